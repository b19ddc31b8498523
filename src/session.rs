//! One local ↔ remote voice bridge.
//!
//! A started session runs three tasks until it is stopped:
//! - send: input queue → uplink converter → remote peer, one message per 20 ms
//! - receive: remote audio queue → downlink converter → output queue
//! - text: remote text queue → line buffering → status channel
//!
//! Cancellation goes through a single watch channel that every task selects
//! on at its wait point.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{DownlinkConverter, FormatConverter, PcmFrame, UplinkConverter};
use crate::config::{Prompt, SessionConfig};
use crate::endpoint::{CaptureSink, PlaybackSource, StatusChannel, VoiceEndpoint};
use crate::error::{ClientError, StartError};
use crate::queue::BoundedQueue;
use crate::relay::TextAccumulator;
use crate::remote_client::{ClientOptions, ClientState, RemoteClient};

/// How long the send loop waits for captured audio before sending silence.
const CAPTURE_WAIT: Duration = Duration::from_millis(20);
/// How long the receive loop waits for remote audio before checking again.
const RECEIVE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Stopped,
}

pub struct Session {
    id: Uuid,
    state: SessionState,
    config: SessionConfig,
    client: Arc<RemoteClient>,
    endpoint: Arc<dyn VoiceEndpoint>,
    status: Arc<dyn StatusChannel>,
    input_queue: Arc<BoundedQueue<Bytes>>,
    output_queue: Arc<BoundedQueue<PcmFrame>>,
    shutdown: watch::Sender<bool>,
    /// Set by a task that ended on its own because of a failure.
    failed: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn new(
        options: ClientOptions,
        config: SessionConfig,
        endpoint: Arc<dyn VoiceEndpoint>,
        status: Arc<dyn StatusChannel>,
    ) -> Self {
        let input_queue = Arc::new(BoundedQueue::new("input", config.input_queue_capacity));
        let output_queue = Arc::new(BoundedQueue::new("output", config.output_queue_capacity));
        let (shutdown, _) = watch::channel(false);
        let (failed, _) = watch::channel(false);

        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            config,
            client: Arc::new(RemoteClient::new(options)),
            endpoint,
            status,
            input_queue,
            output_queue,
            shutdown,
            failed: Arc::new(failed),
            tasks: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connect to the remote peer, attach the local endpoint and launch the
    /// three session tasks.
    ///
    /// Any failure tears down what was already started, reports
    /// `Failed to start session: ..` on the status channel and leaves the
    /// session `Stopped`.
    pub async fn start(&mut self, prompt: Prompt) -> Result<(), StartError> {
        if self.state != SessionState::Idle {
            return Err(StartError::InvalidState(self.state));
        }
        self.state = SessionState::Starting;
        log::info!(
            "Starting voice session: session={}, voice={}",
            self.id,
            prompt.voice_prompt
        );

        if let Err(e) = self.launch(&prompt).await {
            log::error!("Failed to start session: session={}, error={}", self.id, e);
            self.teardown().await;
            report(
                self.status.as_ref(),
                &format!("Failed to start session: {}", e),
            )
            .await;
            return Err(e);
        }

        self.state = SessionState::Active;
        report(self.status.as_ref(), "Voice session started!").await;
        log::info!("Voice session started: session={}", self.id);
        Ok(())
    }

    async fn launch(&mut self, prompt: &Prompt) -> Result<(), StartError> {
        self.client
            .connect(&prompt.text_prompt, &prompt.voice_prompt)
            .await?;
        let (uplink, downlink) = FormatConverter::new()?.into_split();

        self.endpoint
            .start_capture(CaptureSink::new(self.input_queue.clone()))
            .map_err(|e| StartError::Endpoint(format!("{:#}", e)))?;
        self.endpoint
            .start_playback(PlaybackSource::new(self.output_queue.clone()))
            .map_err(|e| StartError::Endpoint(format!("{:#}", e)))?;

        let send = self.spawn_loop(
            "Send",
            send_loop(
                self.input_queue.clone(),
                uplink,
                self.client.clone(),
                self.status.clone(),
                self.shutdown.subscribe(),
                self.failed.clone(),
            ),
        );
        let receive = self.spawn_loop(
            "Receive",
            receive_loop(
                self.client.clone(),
                downlink,
                self.output_queue.clone(),
                self.status.clone(),
                self.shutdown.subscribe(),
                self.failed.clone(),
            ),
        );
        let text = self.spawn_loop(
            "Text",
            text_loop(
                self.client.clone(),
                self.status.clone(),
                self.config.text_flush_chars,
                self.shutdown.subscribe(),
            ),
        );
        self.tasks.extend([send, receive, text]);
        Ok(())
    }

    fn spawn_loop<F>(&self, name: &'static str, body: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        spawn_supervised(name, body, self.status.clone(), self.failed.clone())
    }

    /// Cancel the tasks, wait for them (the text task flushes what it has),
    /// detach the local endpoint and close the remote connection.
    ///
    /// A second call is a no-op.
    pub async fn stop(&mut self) {
        match self.state {
            SessionState::Stopping | SessionState::Stopped => return,
            SessionState::Idle => {
                self.state = SessionState::Stopped;
                return;
            }
            SessionState::Starting | SessionState::Active => {}
        }

        self.state = SessionState::Stopping;
        log::info!("Stopping voice session: session={}", self.id);
        self.teardown().await;
        log::info!("Voice session stopped: session={}", self.id);
    }

    async fn teardown(&mut self) {
        self.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::error!("Session task failed: session={}, error={}", self.id, e);
            }
        }

        // Joining the audio threads blocks
        let endpoint = self.endpoint.clone();
        let stopped = tokio::task::spawn_blocking(move || {
            endpoint.stop_capture();
            endpoint.stop_playback();
        })
        .await;
        if let Err(e) = stopped {
            log::error!("Failed to stop local endpoint: {}", e);
        }

        self.client.close().await;
        self.input_queue.clear();
        self.output_queue.clear();
        self.state = SessionState::Stopped;
    }

    /// Flips to `true` once a session task has ended because of a failure,
    /// such as the remote peer closing the connection.
    pub fn subscribe_failed(&self) -> watch::Receiver<bool> {
        self.failed.subscribe()
    }

    /// Resolves once a session task has failed.
    pub async fn failed(&self) {
        let mut failed = self.subscribe_failed();
        // The sender lives in self, so this cannot fail while we are borrowed
        let _ = failed.wait_for(|failed| *failed).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            log::warn!("Session dropped without stop: session={}", self.id);
            self.shutdown.send_replace(true);
        }
    }
}

/// Run a session loop on its own task. A panic ends only that loop; it is
/// reported on the status channel and raises the failure signal.
fn spawn_supervised<F>(
    name: &'static str,
    body: F,
    status: Arc<dyn StatusChannel>,
    failed: Arc<watch::Sender<bool>>,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(body).catch_unwind().await {
            let reason = panic_reason(&*panic).to_string();
            log::error!("{} loop panicked: {}", name, reason);
            report(status.as_ref(), &format!("{} loop failed: {}", name, reason)).await;
            failed.send_replace(true);
        }
    })
}

fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        *reason
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.as_str()
    } else {
        "unknown panic"
    }
}

async fn report(status: &dyn StatusChannel, message: &str) {
    if let Err(e) = status.send(message).await {
        log::warn!("Failed to deliver status message: {:#}", e);
    }
}

// ======================== Send loop ========================

/// The next captured chunk, or one frame of silence if none arrives in time.
async fn next_capture(input: &BoundedQueue<Bytes>) -> Bytes {
    match input.pop_timeout(CAPTURE_WAIT).await {
        Some(pcm) => pcm,
        None => PcmFrame::silence().into_bytes(),
    }
}

async fn send_loop(
    input: Arc<BoundedQueue<Bytes>>,
    mut uplink: UplinkConverter,
    client: Arc<RemoteClient>,
    status: Arc<dyn StatusChannel>,
    mut shutdown: watch::Receiver<bool>,
    failed: Arc<watch::Sender<bool>>,
) {
    let mut last_sent: Option<Vec<u8>> = None;
    loop {
        let pcm = tokio::select! {
            _ = shutdown.changed() => break,
            pcm = next_capture(&input) => pcm,
        };

        let encoded = match uplink.convert(&pcm) {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("Uplink conversion failed: {}", e);
                None
            }
        };
        // Keep the remote stream continuous while the encoder has nothing new
        if let Some(chunk) = encoded {
            last_sent = Some(chunk);
        }
        let Some(chunk) = last_sent.as_deref() else {
            continue;
        };

        if let Err(e) = client.send_audio(chunk).await {
            log::error!("Send loop error: {}", e);
            report(status.as_ref(), &format!("Audio send error: {}", e)).await;
            failed.send_replace(true);
            return;
        }
    }
    log::info!("Send loop cancelled");
}

// ======================== Receive loop ========================

async fn receive_loop(
    client: Arc<RemoteClient>,
    mut downlink: DownlinkConverter,
    output: Arc<BoundedQueue<PcmFrame>>,
    status: Arc<dyn StatusChannel>,
    mut shutdown: watch::Receiver<bool>,
    failed: Arc<watch::Sender<bool>>,
) {
    let audio = client.audio_queue().clone();
    loop {
        let chunk = tokio::select! {
            _ = shutdown.changed() => break,
            chunk = audio.pop_timeout(RECEIVE_WAIT) => chunk,
        };

        let Some(chunk) = chunk else {
            if client.state() == ClientState::Closed {
                let e = ClientError::ConnectionClosed;
                log::error!("Receive loop error: {}", e);
                report(status.as_ref(), &format!("Audio receive error: {}", e)).await;
                failed.send_replace(true);
                return;
            }
            continue;
        };

        match downlink.convert(&chunk) {
            Ok(frames) => {
                for frame in frames {
                    // Playback never waits for space
                    output.push(frame);
                }
            }
            Err(e) => log::warn!("Dropping remote audio chunk: {}", e),
        }
    }
    log::info!("Receive loop cancelled");
}

// ======================== Text relay loop ========================

async fn text_loop(
    client: Arc<RemoteClient>,
    status: Arc<dyn StatusChannel>,
    flush_chars: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let text = client.text_queue().clone();
    let mut lines = TextAccumulator::new(flush_chars);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            fragment = text.pop() => {
                if let Some(line) = lines.push(&fragment) {
                    relay(status.as_ref(), &line).await;
                }
            }
        }
    }

    // Partial responses are still worth showing
    while let Some(fragment) = text.try_pop() {
        if let Some(line) = lines.push(&fragment) {
            relay(status.as_ref(), &line).await;
        }
    }
    if let Some(line) = lines.flush() {
        relay(status.as_ref(), &line).await;
    }
    log::info!("Text loop cancelled");
}

async fn relay(status: &dyn StatusChannel, line: &str) {
    report(status, &format!("AI: {}", line)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{OggOpusWriter, REMOTE_FRAME_SAMPLES, REMOTE_SAMPLE_RATE, StreamEncoder};
    use crate::error::ConversionError;
    use crate::protocol::{self, MessageTag};
    use crate::test_support::{
        LoopbackEndpoint, RecordingStatus, ServerSocket, client_options, closed_port_url,
        serve_once,
    };
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::Ordering;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::Instant;
    use tokio_tungstenite::tungstenite::protocol::Message;

    fn session_for(url: &str) -> (Session, Arc<LoopbackEndpoint>, Arc<RecordingStatus>) {
        let endpoint = Arc::new(LoopbackEndpoint::default());
        let status = Arc::new(RecordingStatus::default());
        let session = Session::new(
            client_options(url, Duration::from_secs(5)),
            SessionConfig::default(),
            endpoint.clone(),
            status.clone(),
        );
        (session, endpoint, status)
    }

    async fn handshake(ws: &mut ServerSocket) {
        ws.send(Message::Binary(vec![0x00].into())).await.unwrap();
    }

    async fn send_tagged(ws: &mut ServerSocket, tag: MessageTag, payload: &[u8]) {
        let message = protocol::encode(tag, payload);
        ws.send(Message::Binary(message.into())).await.unwrap();
    }

    fn remote_speech(frames: usize) -> Vec<Vec<u8>> {
        let mut writer = OggOpusWriter::new().unwrap();
        (0..frames)
            .map(|n| {
                let frame: Vec<f32> = (0..REMOTE_FRAME_SAMPLES)
                    .map(|i| {
                        let t = (n * REMOTE_FRAME_SAMPLES + i) as f32 / REMOTE_SAMPLE_RATE as f32;
                        (2.0 * std::f32::consts::PI * 300.0 * t).sin() * 0.5
                    })
                    .collect();
                writer.encode(&frame).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_next_capture_substitutes_silence() {
        let input = BoundedQueue::new("input", 4);
        let started = Instant::now();
        let pcm = next_capture(&input).await;
        assert!(started.elapsed() >= CAPTURE_WAIT);
        assert_eq!(pcm, PcmFrame::silence().into_bytes());

        input.push(Bytes::from_static(b"captured"));
        assert_eq!(&next_capture(&input).await[..], b"captured");
    }

    /// Fails every other frame and otherwise emits a running counter byte.
    struct FlakyEncoder {
        calls: usize,
    }

    impl StreamEncoder for FlakyEncoder {
        fn encode(&mut self, _frame: &[f32]) -> Result<Vec<u8>, ConversionError> {
            let call = self.calls;
            self.calls += 1;
            if call % 2 == 0 {
                Err(ConversionError::FrameSize(0))
            } else {
                Ok(vec![b'0' + (call / 2) as u8])
            }
        }
    }

    #[tokio::test]
    async fn test_send_loop_resends_previous_output() {
        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel();
        let (url, _request) = serve_once(|mut ws| async move {
            handshake(&mut ws).await;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(data) = msg {
                    let _ = audio_tx.send(data.to_vec());
                }
            }
        })
        .await;

        let client = Arc::new(RemoteClient::new(client_options(&url, Duration::from_secs(5))));
        client.connect("prompt", "voice").await.unwrap();

        let uplink = UplinkConverter::new(Box::new(FlakyEncoder { calls: 0 })).unwrap();
        let (shutdown, _) = watch::channel(false);
        let (failed, _) = watch::channel(false);
        let task = tokio::spawn(send_loop(
            Arc::new(BoundedQueue::new("input", 4)),
            uplink,
            client.clone(),
            Arc::new(RecordingStatus::default()),
            shutdown.subscribe(),
            Arc::new(failed),
        ));

        let mut received = Vec::new();
        while received.len() < 4 {
            let msg = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(msg);
        }
        // The first frame fails before anything was encoded, so nothing goes
        // out for it; each later failure repeats the last good chunk
        assert_eq!(
            received,
            vec![
                b"\x010".to_vec(),
                b"\x010".to_vec(),
                b"\x011".to_vec(),
                b"\x011".to_vec(),
            ]
        );

        shutdown.send_replace(true);
        task.await.unwrap();
        client.close().await;
    }

    async fn panicking_loop() {
        panic!("fragment out of range")
    }

    #[tokio::test]
    async fn test_loop_panic_is_reported() {
        let status = Arc::new(RecordingStatus::default());
        let (failed, mut failed_rx) = watch::channel(false);

        let task = spawn_supervised(
            "Text",
            panicking_loop(),
            status.clone(),
            Arc::new(failed),
        );
        task.await.unwrap();

        assert!(*failed_rx.borrow_and_update());
        assert_eq!(
            status.messages(),
            vec!["Text loop failed: fragment out of range".to_string()]
        );
    }

    #[tokio::test]
    async fn test_session_streams_silence_when_nothing_is_captured() {
        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel();
        let (url, _request) = serve_once(|mut ws| async move {
            handshake(&mut ws).await;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(data) = msg {
                    let _ = audio_tx.send(data.to_vec());
                }
            }
        })
        .await;

        let (mut session, _endpoint, status) = session_for(&url);
        session.start(Prompt::default()).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(status.messages(), vec!["Voice session started!".to_string()]);

        let mut received = Vec::new();
        while received.len() < 5 {
            let msg = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(msg);
        }
        assert!(received.iter().all(|m| m[0] == MessageTag::Audio as u8));
        assert!(received[0][1..].starts_with(b"OggS"));
        assert!(String::from_utf8_lossy(&received[0]).contains("OpusHead"));

        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_captured_frames_are_sent_in_order() {
        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel();
        let (url, _request) = serve_once(|mut ws| async move {
            handshake(&mut ws).await;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(data) = msg {
                    let _ = audio_tx.send(data.len());
                }
            }
        })
        .await;

        let (mut session, endpoint, _status) = session_for(&url);
        session.start(Prompt::default()).await.unwrap();

        let sink = endpoint.sink.lock().clone().unwrap();
        let loud = vec![0x40u8; crate::audio::LOCAL_FRAME_BYTES];
        for _ in 0..10 {
            sink.write(&loud);
        }

        for _ in 0..10 {
            let len = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(len > 1);
        }
        session.stop().await;
        assert!(endpoint.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_remote_audio_reaches_playback() {
        let (url, _request) = serve_once(|mut ws| async move {
            handshake(&mut ws).await;
            for chunk in remote_speech(5) {
                send_tagged(&mut ws, MessageTag::Audio, &chunk).await;
            }
            while ws.next().await.is_some() {}
        })
        .await;

        let (mut session, endpoint, _status) = session_for(&url);
        session.start(Prompt::default()).await.unwrap();
        let source = endpoint.source.lock().clone().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut heard = 0;
        while heard < 3 && Instant::now() < deadline {
            if source.read().is_silence() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            } else {
                heard += 1;
            }
        }
        assert!(heard >= 3, "only {heard} non-silent frames played");
        session.stop().await;
    }

    #[tokio::test]
    async fn test_text_relay_flushes_on_whitespace_and_stop() {
        let (url, _request) = serve_once(|mut ws| async move {
            handshake(&mut ws).await;
            for fragment in ["Hello", " there ", "still", " talk", "ing"] {
                send_tagged(&mut ws, MessageTag::Text, fragment.as_bytes()).await;
            }
            while ws.next().await.is_some() {}
        })
        .await;

        let (mut session, _endpoint, status) = session_for(&url);
        session.start(Prompt::default()).await.unwrap();
        assert!(status.wait_for(|m| m == "AI: Hello there").await);

        // Let the rest of the fragments arrive before stopping
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.stop().await;

        let messages = status.messages();
        assert_eq!(messages.last().unwrap(), "AI: still talking");
        assert_eq!(messages.iter().filter(|m| m.starts_with("AI: ")).count(), 2);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let url = closed_port_url().await;
        let (mut session, endpoint, status) = session_for(&url);

        let err = session.start(Prompt::default()).await.unwrap_err();
        assert!(matches!(err, StartError::Client(ClientError::Connect(_))));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(endpoint.sink.lock().is_none());

        let messages = status.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Failed to start session: "));

        assert!(matches!(
            session.start(Prompt::default()).await,
            Err(StartError::InvalidState(SessionState::Stopped))
        ));
    }

    #[tokio::test]
    async fn test_prompts_reach_remote_peer() {
        let (url, request) = serve_once(|mut ws| async move {
            handshake(&mut ws).await;
            while ws.next().await.is_some() {}
        })
        .await;

        let (mut session, _endpoint, _status) = session_for(&url);
        session
            .start(Prompt::new("You enjoy puns.", "NATM1"))
            .await
            .unwrap();
        let uri = request.await.unwrap();
        assert!(uri.contains("text_prompt=You+enjoy+puns."));
        assert!(uri.contains("voice_prompt=NATM1.pt"));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (url, _request) = serve_once(|mut ws| async move {
            handshake(&mut ws).await;
            while ws.next().await.is_some() {}
        })
        .await;

        let (mut idle, _endpoint, _status) = session_for(&url);
        idle.stop().await;
        assert_eq!(idle.state(), SessionState::Stopped);

        let (mut session, _endpoint, status) = session_for(&url);
        session.start(Prompt::default()).await.unwrap();
        session.stop().await;
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(status.messages(), vec!["Voice session started!".to_string()]);
    }

    #[tokio::test]
    async fn test_remote_close_ends_session() {
        let (closed_tx, closed_rx) = oneshot::channel::<()>();
        let (url, _request) = serve_once(|mut ws| async move {
            handshake(&mut ws).await;
            ws.close(None).await.unwrap();
            let _ = closed_tx.send(());
        })
        .await;

        let (mut session, _endpoint, status) = session_for(&url);
        session.start(Prompt::default()).await.unwrap();
        closed_rx.await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), session.failed())
            .await
            .unwrap();
        assert!(status.wait_for(|m| m.starts_with("Audio ")).await);
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }
}
