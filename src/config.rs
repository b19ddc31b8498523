//! Bridge configuration.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. Optional `voxbridge.toml` (or `.yaml` / `.json`) in the working directory
//! 3. Environment variables such as `VOXBRIDGE__REMOTE__URL`

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::remote_client::ClientOptions;

const FILE_NAME: &str = "voxbridge";
const ENV_PREFIX: &str = "VOXBRIDGE";
const VOICE_SUFFIX: &str = ".pt";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub remote: RemoteConfig,
    pub session: SessionConfig,
    pub prompt: Prompt,
    pub audio: AudioDeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// WebSocket endpoint of the remote voice service (`ws` or `wss`)
    pub url: String,
    pub handshake_timeout_secs: u64,
    pub audio_queue_capacity: usize,
    pub text_queue_capacity: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "wss://localhost:8998/api/chat".to_string(),
            handshake_timeout_secs: 60,
            audio_queue_capacity: 100,
            text_queue_capacity: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub input_queue_capacity: usize,
    pub output_queue_capacity: usize,
    /// Relayed text is flushed once this many characters are buffered
    pub text_flush_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_queue_capacity: 50,
            output_queue_capacity: 50,
            text_flush_chars: 50,
        }
    }
}

/// ALSA device names, used when built with the `alsa` feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioDeviceConfig {
    pub capture_device: String,
    pub playback_device: String,
}

impl Default for AudioDeviceConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
        }
    }
}

/// Per-session persona: the text prompt and the voice the remote peer uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prompt {
    pub text_prompt: String,
    pub voice_prompt: String,
}

impl Default for Prompt {
    fn default() -> Self {
        Self {
            text_prompt: "You are a helpful assistant.".to_string(),
            voice_prompt: "NATF0.pt".to_string(),
        }
    }
}

impl Prompt {
    /// The voice name gets a `.pt` suffix if it does not already have one.
    pub fn new(text_prompt: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            text_prompt: text_prompt.into(),
            voice_prompt: normalize_voice(voice.into()),
        }
    }
}

fn normalize_voice(mut voice: String) -> String {
    if !voice.ends_with(VOICE_SUFFIX) {
        voice.push_str(VOICE_SUFFIX);
    }
    voice
}

impl BridgeConfig {
    /// Load from defaults, the optional config file and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(FILE_NAME)
    }

    /// Like [`load`](Self::load) with a custom config file base name.
    pub fn load_from(file: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?)
            .add_source(::config::File::with_name(file).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.prompt.voice_prompt = normalize_voice(config.prompt.voice_prompt);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.remote_url()?;
        if !matches!(url.scheme(), "ws" | "wss") {
            anyhow::bail!("remote.url must use ws or wss, got '{}'", url.scheme());
        }
        if self.remote.handshake_timeout_secs == 0 {
            anyhow::bail!("remote.handshake_timeout_secs must be positive");
        }
        for (name, value) in [
            ("remote.audio_queue_capacity", self.remote.audio_queue_capacity),
            ("remote.text_queue_capacity", self.remote.text_queue_capacity),
            ("session.input_queue_capacity", self.session.input_queue_capacity),
            ("session.output_queue_capacity", self.session.output_queue_capacity),
            ("session.text_flush_chars", self.session.text_flush_chars),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be positive", name);
            }
        }
        Ok(())
    }

    pub fn remote_url(&self) -> Result<Url> {
        Url::parse(&self.remote.url)
            .with_context(|| format!("remote.url '{}' is not a valid URL", self.remote.url))
    }

    pub fn client_options(&self) -> Result<ClientOptions> {
        Ok(ClientOptions {
            url: self.remote_url()?,
            handshake_timeout: Duration::from_secs(self.remote.handshake_timeout_secs),
            audio_queue_capacity: self.remote.audio_queue_capacity,
            text_queue_capacity: self.remote.text_queue_capacity,
        })
    }
}
