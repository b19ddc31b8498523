//! Bidirectional conversion between local PCM frames and the remote stream.
//!
//! - Uplink: 48 kHz stereo i16 → downmix → resample → normalise → encode
//! - Downlink: decode → scale/clip → resample → upmix → re-frame
//!
//! The two directions share no state, so [`FormatConverter::into_split`] hands
//! each half to its own task without locking.

use bytes::{BufMut, BytesMut};

use super::opus_codec::{OggOpusReader, OggOpusWriter};
use super::resample::StreamResampler;
use super::stream_codec::{StreamDecoder, StreamEncoder};
use super::{LOCAL_CHANNELS, LOCAL_FRAME_BYTES, PcmFrame, REMOTE_FRAME_SAMPLES};
use crate::error::ConversionError;

const I16_SCALE: f32 = 32768.0;

pub struct FormatConverter {
    uplink: UplinkConverter,
    downlink: DownlinkConverter,
}

impl FormatConverter {
    /// Converter backed by the Ogg/Opus codec.
    pub fn new() -> Result<Self, ConversionError> {
        Self::with_codec(
            Box::new(OggOpusWriter::new()?),
            Box::new(OggOpusReader::new()?),
        )
    }

    pub fn with_codec(
        encoder: Box<dyn StreamEncoder>,
        decoder: Box<dyn StreamDecoder>,
    ) -> Result<Self, ConversionError> {
        Ok(Self {
            uplink: UplinkConverter::new(encoder)?,
            downlink: DownlinkConverter::new(decoder)?,
        })
    }

    pub fn local_to_remote(&mut self, pcm: &[u8]) -> Result<Option<Vec<u8>>, ConversionError> {
        self.uplink.convert(pcm)
    }

    pub fn remote_to_local(&mut self, chunk: &[u8]) -> Result<Vec<PcmFrame>, ConversionError> {
        self.downlink.convert(chunk)
    }

    pub fn into_split(self) -> (UplinkConverter, DownlinkConverter) {
        (self.uplink, self.downlink)
    }
}

// ======================== Uplink ========================

/// Local PCM → remote stream.
pub struct UplinkConverter {
    encoder: Box<dyn StreamEncoder>,
    resampler: StreamResampler,
}

impl UplinkConverter {
    pub fn new(encoder: Box<dyn StreamEncoder>) -> Result<Self, ConversionError> {
        Ok(Self {
            encoder,
            resampler: StreamResampler::downsampler()?,
        })
    }

    /// Convert a whole number of local frames.
    ///
    /// Returns `Ok(None)` when no complete codec frame was available, which
    /// callers treat as "try again next cycle".
    pub fn convert(&mut self, pcm: &[u8]) -> Result<Option<Vec<u8>>, ConversionError> {
        let usable = pcm.len() - pcm.len() % LOCAL_FRAME_BYTES;
        if usable != pcm.len() {
            log::warn!(
                "PCM size mismatch: got {} bytes, expected a multiple of {}; truncating to {}",
                pcm.len(),
                LOCAL_FRAME_BYTES,
                usable
            );
        }
        if usable == 0 {
            return Ok(None);
        }

        let mono = downmix(&pcm[..usable]);
        let normalized: Vec<f32> = self
            .resampler
            .process(&mono)?
            .into_iter()
            .map(|s| (s / I16_SCALE).clamp(-1.0, 1.0))
            .collect();

        // A trailing partial codec frame would be discarded rather than
        // carried into the next call, drifting the phase of the stream. Whole
        // local frames always resample to whole codec frames, so it does not
        // happen with the input accepted above.
        let mut encoded = Vec::new();
        for frame in normalized.chunks_exact(REMOTE_FRAME_SAMPLES) {
            encoded.extend(self.encoder.encode(frame)?);
        }

        Ok((!encoded.is_empty()).then_some(encoded))
    }
}

/// Average each stereo pair of little-endian i16 samples.
fn downmix(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2 * LOCAL_CHANNELS)
        .map(|s| {
            let left = i16::from_le_bytes([s[0], s[1]]) as i32;
            let right = i16::from_le_bytes([s[2], s[3]]) as i32;
            ((left + right) / 2).clamp(i16::MIN as i32, i16::MAX as i32) as f32
        })
        .collect()
}

// ======================== Downlink ========================

/// Remote stream → local PCM frames.
pub struct DownlinkConverter {
    decoder: Box<dyn StreamDecoder>,
    resampler: StreamResampler,
    /// Interleaved stereo bytes short of a full local frame.
    replay: BytesMut,
}

impl DownlinkConverter {
    pub fn new(decoder: Box<dyn StreamDecoder>) -> Result<Self, ConversionError> {
        Ok(Self {
            decoder,
            resampler: StreamResampler::upsampler()?,
            replay: BytesMut::with_capacity(LOCAL_FRAME_BYTES * 2),
        })
    }

    /// Convert one remote chunk into zero or more complete local frames.
    /// The replay buffer is only touched after a successful decode.
    pub fn convert(&mut self, chunk: &[u8]) -> Result<Vec<PcmFrame>, ConversionError> {
        let decoded = self.decoder.decode(chunk)?;
        if decoded.is_empty() {
            return Ok(Vec::new());
        }

        let scaled: Vec<f32> = decoded
            .iter()
            .map(|s| (s * I16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32).trunc())
            .collect();

        let upsampled = self.resampler.process(&scaled)?;
        self.replay.reserve(upsampled.len() * 2 * LOCAL_CHANNELS);
        for sample in upsampled {
            let sample = sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            for _ in 0..LOCAL_CHANNELS {
                self.replay.put_i16_le(sample);
            }
        }

        let mut frames = Vec::with_capacity(self.replay.len() / LOCAL_FRAME_BYTES);
        while self.replay.len() >= LOCAL_FRAME_BYTES {
            let frame = self.replay.split_to(LOCAL_FRAME_BYTES).freeze();
            frames.push(PcmFrame::try_from(frame)?);
        }
        Ok(frames)
    }

    /// Local-format bytes held back waiting for the rest of a frame,
    /// counting samples still inside the resampler.
    pub fn buffered_bytes(&self) -> usize {
        let per_remote_sample = 2 * LOCAL_CHANNELS * 2;
        self.replay.len() + self.resampler.pending() * per_remote_sample
    }
}
