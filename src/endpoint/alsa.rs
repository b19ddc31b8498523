//! ALSA capture and playback for the local voice peer.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O. Both devices
//! run at 48 kHz stereo S16LE with one 20 ms frame per period.

use std::sync::atomic::{AtomicBool, Ordering};

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use super::{CaptureSink, PlaybackSource, VoiceEndpoint, Worker};
use crate::audio::{LOCAL_CHANNELS, LOCAL_FRAME_BYTES, LOCAL_FRAME_SAMPLES, LOCAL_SAMPLE_RATE};

pub struct AlsaEndpoint {
    capture_device: String,
    playback_device: String,
    capture: Mutex<Option<Worker>>,
    playback: Mutex<Option<Worker>>,
}

impl AlsaEndpoint {
    pub fn new(capture_device: impl Into<String>, playback_device: impl Into<String>) -> Self {
        Self {
            capture_device: capture_device.into(),
            playback_device: playback_device.into(),
            capture: Mutex::new(None),
            playback: Mutex::new(None),
        }
    }
}

impl VoiceEndpoint for AlsaEndpoint {
    fn start_capture(&self, sink: CaptureSink) -> Result<()> {
        let mut capture = self.capture.lock();
        if capture.is_some() {
            anyhow::bail!("capture already running");
        }
        let device = self.capture_device.clone();
        *capture = Some(Worker::spawn("alsa-capture", move |running| {
            capture_thread(&device, sink, running)
        })?);
        Ok(())
    }

    fn start_playback(&self, source: PlaybackSource) -> Result<()> {
        let mut playback = self.playback.lock();
        if playback.is_some() {
            anyhow::bail!("playback already running");
        }
        let device = self.playback_device.clone();
        *playback = Some(Worker::spawn("alsa-play", move |running| {
            playback_thread(&device, source, running)
        })?);
        Ok(())
    }

    fn stop_capture(&self) {
        let worker = self.capture.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
    }

    fn stop_playback(&self) {
        let worker = self.playback.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
    }
}

// ======================== Device setup ========================

fn open_pcm(device: &str, direction: Direction, dir_name: &str) -> Result<PCM> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(LOCAL_CHANNELS as u32)?;
        hwp.set_rate(LOCAL_SAMPLE_RATE, ValueOr::Nearest)?;
        hwp.set_period_size_near(LOCAL_FRAME_SAMPLES as alsa::pcm::Frames, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    let (rate, channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        (hwp.get_rate()?, hwp.get_channels()?, hwp.get_period_size()?)
    };
    if rate != LOCAL_SAMPLE_RATE || channels != LOCAL_CHANNELS as u32 {
        anyhow::bail!(
            "{} device '{}' negotiated {} Hz / {} ch, need {} Hz / {} ch",
            dir_name,
            device,
            rate,
            channels,
            LOCAL_SAMPLE_RATE,
            LOCAL_CHANNELS
        );
    }

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        rate,
        channels,
        period_size,
    );
    Ok(pcm)
}

// ======================== Capture thread ========================

fn capture_thread(device: &str, sink: CaptureSink, running: &AtomicBool) -> Result<()> {
    let pcm = open_pcm(device, Direction::Capture, "Capture")?;
    let io = pcm.io_i16()?;

    let mut read_buf = vec![0i16; LOCAL_FRAME_SAMPLES * LOCAL_CHANNELS];
    let mut pending = BytesMut::with_capacity(LOCAL_FRAME_BYTES * 2);

    log::info!("Capture started");
    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                for &sample in &read_buf[..frames * LOCAL_CHANNELS] {
                    pending.put_i16_le(sample);
                }
                // Hand over whole 20 ms frames only
                while pending.len() >= LOCAL_FRAME_BYTES {
                    let frame = pending.split_to(LOCAL_FRAME_BYTES);
                    sink.write(&frame);
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Capture stopped");
    Ok(())
}

// ======================== Playback thread ========================

fn playback_thread(device: &str, source: PlaybackSource, running: &AtomicBool) -> Result<()> {
    let pcm = open_pcm(device, Direction::Playback, "Playback")?;
    let io = pcm.io_i16()?;

    let mut samples = Vec::with_capacity(LOCAL_FRAME_SAMPLES * LOCAL_CHANNELS);

    log::info!("Playback started");
    while running.load(Ordering::Relaxed) {
        // The device clock paces this loop; an empty queue plays silence
        let frame = source.read();
        samples.clear();
        samples.extend(frame.samples());

        let mut frames_written = 0;
        while frames_written < LOCAL_FRAME_SAMPLES {
            let offset = frames_written * LOCAL_CHANNELS;
            match io.writei(&samples[offset..]) {
                Ok(n) => frames_written += n,
                Err(e) => {
                    log::warn!("ALSA playback error: {}, recovering...", e);
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        return Ok(());
                    }
                }
            }
        }
    }

    if let Err(e) = pcm.drain() {
        log::debug!("ALSA drain: {}", e);
    }
    log::info!("Playback stopped");
    Ok(())
}
