//! A local endpoint with no audio hardware.
//!
//! Nothing is captured, so the remote peer hears the session's silence
//! substitution. Playback is drained at the real 20 ms cadence and discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;

use super::{CaptureSink, PlaybackSource, VoiceEndpoint, Worker};
use crate::audio::FRAME_DURATION_MS;

#[derive(Default)]
pub struct HeadlessEndpoint {
    playback: Mutex<Option<Worker>>,
    frames_played: Arc<AtomicU64>,
}

impl HeadlessEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-silent frames consumed since creation.
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }
}

impl VoiceEndpoint for HeadlessEndpoint {
    fn start_capture(&self, _sink: CaptureSink) -> Result<()> {
        log::info!("Headless endpoint: no capture device, remote hears silence");
        Ok(())
    }

    fn start_playback(&self, source: PlaybackSource) -> Result<()> {
        let mut playback = self.playback.lock();
        if playback.is_some() {
            anyhow::bail!("playback already running");
        }

        let frames_played = self.frames_played.clone();
        let worker = Worker::spawn("headless-play", move |running| {
            let period = Duration::from_millis(FRAME_DURATION_MS as u64);
            let mut next = Instant::now();
            while running.load(Ordering::Relaxed) {
                if !source.read().is_silence() {
                    frames_played.fetch_add(1, Ordering::Relaxed);
                }
                next += period;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
            log::info!("Headless playback stopped");
            Ok(())
        })?;
        *playback = Some(worker);
        Ok(())
    }

    fn stop_capture(&self) {}

    fn stop_playback(&self) {
        // Take the worker out first so the lock is not held across the join
        let worker = self.playback.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
            log::info!("Headless playback drained {} frames", self.frames_played());
        }
    }
}
