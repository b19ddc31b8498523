use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::signal;

use voxbridge::endpoint::{StatusChannel, VoiceEndpoint};
use voxbridge::{BridgeConfig, Session, SessionRegistry};

/// Local endpoint key for the single session this binary runs.
const LOCAL_ENDPOINT: &str = "local";

/// Prints status lines and AI text to stdout.
struct ConsoleStatus;

#[async_trait]
impl StatusChannel for ConsoleStatus {
    async fn send(&self, message: &str) -> Result<()> {
        println!("{}", message);
        Ok(())
    }
}

#[cfg(feature = "alsa")]
fn local_endpoint(config: &BridgeConfig) -> Arc<dyn VoiceEndpoint> {
    Arc::new(voxbridge::endpoint::AlsaEndpoint::new(
        config.audio.capture_device.clone(),
        config.audio.playback_device.clone(),
    ))
}

#[cfg(not(feature = "alsa"))]
fn local_endpoint(_config: &BridgeConfig) -> Arc<dyn VoiceEndpoint> {
    Arc::new(voxbridge::endpoint::HeadlessEndpoint::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = BridgeConfig::load()?;
    log::info!(
        "voxbridge {} starting: remote={}, voice={}",
        env!("CARGO_PKG_VERSION"),
        config.remote.url,
        config.prompt.voice_prompt
    );

    let session = Session::new(
        config.client_options()?,
        config.session.clone(),
        local_endpoint(&config),
        Arc::new(ConsoleStatus),
    );
    let mut failed = session.subscribe_failed();

    let registry = SessionRegistry::new();
    registry
        .start(LOCAL_ENDPOINT, session, config.prompt.clone())
        .await?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
        }
        _ = failed.wait_for(|failed| *failed) => {
            log::warn!("Session ended on its own, shutting down...");
        }
    }

    registry.stop_all().await;
    Ok(())
}
