//! Error types shared across the bridge.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::remote_client::ClientState;
use crate::session::SessionState;

/// A wire message that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect from state {0:?}")]
    InvalidState(ClientState),
    #[error("failed to connect to remote peer: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("handshake timeout ({} seconds)", .0.as_secs_f32())]
    HandshakeTimeout(Duration),
    #[error("invalid handshake: {0}")]
    Handshake(String),
    #[error("connection closed before handshake")]
    ClosedDuringHandshake,
    #[error("not connected")]
    NotConnected,
    #[error("connection closed by remote peer")]
    ConnectionClosed,
    #[error("failed to send to remote peer: {0}")]
    Send(#[source] tungstenite::Error),
}

/// Failure inside the format converter. Never fatal to a loop: callers log it
/// and treat the cycle as having produced no output.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("opus codec error: {0}")]
    Codec(#[from] opus::Error),
    #[error("ogg container error: {0}")]
    Container(#[from] ogg::reading::OggReadError),
    #[error("ogg write error: {0}")]
    Io(#[from] std::io::Error),
    #[error("resampler setup failed: {0}")]
    ResamplerSetup(#[from] rubato::ResamplerConstructionError),
    #[error("resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
    #[error("pcm frame must be exactly 3840 bytes, got {0}")]
    FrameSize(usize),
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("session cannot start from state {0:?}")]
    InvalidState(SessionState),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("audio converter: {0}")]
    Converter(#[from] ConversionError),
    #[error("local endpoint failed: {0}")]
    Endpoint(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a session is already active for this endpoint")]
    Occupied,
    #[error(transparent)]
    Start(#[from] StartError),
}
