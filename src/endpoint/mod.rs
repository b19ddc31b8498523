//! endpoint - The local real-time voice peer and the status text channel.
//!
//! The local side produces and consumes audio on its own threads. The session
//! only ever sees it through two queues:
//! - `CaptureSink`: capture thread → input queue (raw 48 kHz stereo PCM)
//! - `PlaybackSource`: output queue → playback thread (one 20 ms frame per read)

pub mod headless;

#[cfg(feature = "alsa")]
pub mod alsa;

pub use headless::HeadlessEndpoint;

#[cfg(feature = "alsa")]
pub use self::alsa::AlsaEndpoint;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::audio::PcmFrame;
use crate::queue::BoundedQueue;

/// Write side of the session's input queue, handed to the capture thread.
#[derive(Clone)]
pub struct CaptureSink {
    queue: Arc<BoundedQueue<Bytes>>,
}

impl CaptureSink {
    pub fn new(queue: Arc<BoundedQueue<Bytes>>) -> Self {
        Self { queue }
    }

    /// Queue captured PCM. Never blocks; evicts the oldest chunk when full.
    pub fn write(&self, pcm: &[u8]) {
        self.queue.push(Bytes::copy_from_slice(pcm));
    }
}

/// Read side of the session's output queue, handed to the playback thread.
#[derive(Clone)]
pub struct PlaybackSource {
    queue: Arc<BoundedQueue<PcmFrame>>,
}

impl PlaybackSource {
    pub fn new(queue: Arc<BoundedQueue<PcmFrame>>) -> Self {
        Self { queue }
    }

    /// The next queued frame, or silence if nothing is queued.
    pub fn read(&self) -> PcmFrame {
        self.queue.try_pop().unwrap_or_else(PcmFrame::silence)
    }
}

/// A local voice peer with its own capture and playback threads.
pub trait VoiceEndpoint: Send + Sync {
    fn start_capture(&self, sink: CaptureSink) -> Result<()>;
    fn start_playback(&self, source: PlaybackSource) -> Result<()>;
    /// Idempotent.
    fn stop_capture(&self);
    /// Idempotent.
    fn stop_playback(&self);
}

/// Where status lines and relayed AI text are shown to the user.
#[async_trait]
pub trait StatusChannel: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

// ======================== Worker thread ========================

/// A named OS thread that runs until asked to stop.
pub(crate) struct Worker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(&AtomicBool) -> Result<()> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            let thread_name = name.to_string();
            thread::Builder::new().name(name.into()).spawn(move || {
                if let Err(e) = body(&running) {
                    log::error!("{} thread error: {}", thread_name, e);
                }
            })?
        };
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to finish.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Audio thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
