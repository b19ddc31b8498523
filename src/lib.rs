//! voxbridge - Real-time bridge between a local 48 kHz stereo PCM voice peer
//! and a remote 24 kHz mono Ogg/Opus voice service.

pub mod audio;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod remote_client;
pub mod session;

#[cfg(test)]
mod test_support;

pub use config::{BridgeConfig, Prompt};
pub use error::{ClientError, ConversionError, ProtocolError, RegistryError, StartError};
pub use registry::SessionRegistry;
pub use session::{Session, SessionState};
