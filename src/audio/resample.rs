//! Fixed-ratio streaming resampling between 48 kHz and 24 kHz.
//!
//! Input is buffered until a whole resampler chunk is available, so every
//! call produces output in whole chunks and keeps the remainder for the next
//! call. Filter state carries across calls, which keeps the stream phase
//! continuous.

use rubato::{FftFixedIn, Resampler};

use super::{LOCAL_FRAME_SAMPLES, LOCAL_SAMPLE_RATE, REMOTE_FRAME_SAMPLES, REMOTE_SAMPLE_RATE};
use crate::error::ConversionError;

const SUB_CHUNKS: usize = 2;

pub struct StreamResampler {
    resampler: FftFixedIn<f32>,
    input_buffer: Vec<f32>,
    chunk_size: usize,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self, ConversionError> {
        let resampler = FftFixedIn::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            chunk_size,
            SUB_CHUNKS,
            1, // mono
        )?;

        Ok(Self {
            resampler,
            input_buffer: Vec::with_capacity(chunk_size * 2),
            chunk_size,
        })
    }

    /// 48 kHz → 24 kHz, one local frame per chunk.
    pub fn downsampler() -> Result<Self, ConversionError> {
        Self::new(LOCAL_SAMPLE_RATE, REMOTE_SAMPLE_RATE, LOCAL_FRAME_SAMPLES)
    }

    /// 24 kHz → 48 kHz, one remote codec frame per chunk.
    pub fn upsampler() -> Result<Self, ConversionError> {
        Self::new(REMOTE_SAMPLE_RATE, LOCAL_SAMPLE_RATE, REMOTE_FRAME_SAMPLES)
    }

    /// Resample every complete chunk now buffered.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, ConversionError> {
        self.input_buffer.extend_from_slice(input);

        let mut output = Vec::new();
        while self.input_buffer.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.input_buffer.drain(..self.chunk_size).collect();
            let resampled = self.resampler.process(&[chunk], None)?;
            output.extend_from_slice(&resampled[0]);
        }

        log::trace!(
            "Resampled {} -> {} samples, {} pending",
            input.len(),
            output.len(),
            self.input_buffer.len()
        );
        Ok(output)
    }

    /// Input samples waiting for the rest of their chunk.
    pub fn pending(&self) -> usize {
        self.input_buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsampler_halves_whole_frames() {
        let mut resampler = StreamResampler::downsampler().unwrap();
        assert_eq!(resampler.process(&[0.0; 960]).unwrap().len(), 480);
        assert_eq!(resampler.process(&[0.0; 1920]).unwrap().len(), 960);
        assert_eq!(resampler.pending(), 0);
    }

    #[test]
    fn test_upsampler_buffers_partial_chunks() {
        let mut resampler = StreamResampler::upsampler().unwrap();
        assert!(resampler.process(&[0.0; 300]).unwrap().is_empty());
        assert_eq!(resampler.pending(), 300);
        assert_eq!(resampler.process(&[0.0; 300]).unwrap().len(), 960);
        assert_eq!(resampler.pending(), 120);
    }

    #[test]
    fn test_dc_level_survives_after_settling() {
        let mut down = StreamResampler::downsampler().unwrap();
        let out = down.process(&[1000.0; 960 * 4]).unwrap();
        for &s in &out[out.len() - 240..] {
            assert!((s - 1000.0).abs() < 5.0, "downsampled {s}");
        }

        let mut up = StreamResampler::upsampler().unwrap();
        let out = up.process(&[1000.0; 480 * 4]).unwrap();
        for &s in &out[out.len() - 480..] {
            assert!((s - 1000.0).abs() < 5.0, "upsampled {s}");
        }
    }

    #[test]
    fn test_downsampling_rejects_tone_above_new_nyquist() {
        let mut down = StreamResampler::downsampler().unwrap();
        // 20 kHz at 48 kHz has no place below the 12 kHz output Nyquist
        let tone: Vec<f32> = (0..960 * 4)
            .map(|i| (2.0 * std::f32::consts::PI * 20_000.0 * i as f32 / 48_000.0).sin())
            .collect();
        let out = down.process(&tone).unwrap();
        let peak = out[out.len() - 480..]
            .iter()
            .fold(0f32, |m, s| m.max(s.abs()));
        assert!(peak < 0.05, "alias peak {peak}");
    }
}
