//! audio - Format conversion between the local PCM peer and the remote
//! Ogg/Opus peer.
//!
//! Local side: 48 kHz stereo S16LE in strict 20 ms frames (3840 bytes).
//! Remote side: 24 kHz mono float samples carried as a streamed Ogg/Opus
//! container with a native 20 ms (480 sample) codec frame.

pub mod converter;
pub mod opus_codec;
pub mod resample;
pub mod stream_codec;

pub use converter::{DownlinkConverter, FormatConverter, UplinkConverter};
pub use opus_codec::{OggOpusReader, OggOpusWriter};
pub use stream_codec::{StreamDecoder, StreamEncoder};

use bytes::Bytes;

use crate::error::ConversionError;

pub const LOCAL_SAMPLE_RATE: u32 = 48_000;
pub const LOCAL_CHANNELS: usize = 2;
pub const FRAME_DURATION_MS: u32 = 20;
/// Samples per channel in one local frame.
pub const LOCAL_FRAME_SAMPLES: usize = (LOCAL_SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;
pub const LOCAL_FRAME_BYTES: usize = LOCAL_FRAME_SAMPLES * LOCAL_CHANNELS * 2;

pub const REMOTE_SAMPLE_RATE: u32 = 24_000;
pub const REMOTE_FRAME_SAMPLES: usize = (REMOTE_SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;

static SILENCE: [u8; LOCAL_FRAME_BYTES] = [0; LOCAL_FRAME_BYTES];

/// One immutable 20 ms slice of local audio, exactly [`LOCAL_FRAME_BYTES`]
/// of interleaved little-endian i16 stereo samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame(Bytes);

impl PcmFrame {
    /// The canonical all-zero frame.
    pub fn silence() -> Self {
        Self(Bytes::from_static(&SILENCE))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn is_silence(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Interleaved samples, left channel first.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.0
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }
}

impl TryFrom<Bytes> for PcmFrame {
    type Error = ConversionError;

    fn try_from(data: Bytes) -> Result<Self, Self::Error> {
        if data.len() != LOCAL_FRAME_BYTES {
            return Err(ConversionError::FrameSize(data.len()));
        }
        Ok(Self(data))
    }
}
