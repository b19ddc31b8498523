//! Codec traits for the remote audio stream.

use crate::error::ConversionError;

/// Encodes fixed-size frames of 24 kHz mono float samples into bytes of a
/// continuous compressed stream.
///
/// Implementations may prepend stream headers to their first output; the
/// bytes returned by successive calls concatenate into one valid stream.
pub trait StreamEncoder: Send {
    /// Encode exactly one codec frame (`REMOTE_FRAME_SAMPLES` samples).
    fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, ConversionError>;
}

/// Decodes arbitrary slices of a continuous compressed stream into 24 kHz
/// mono float samples.
///
/// Chunk boundaries need not align with container or codec boundaries, so an
/// implementation buffers partial input and may return no samples at all.
pub trait StreamDecoder: Send {
    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<f32>, ConversionError>;
}
