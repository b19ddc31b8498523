//! In-process WebSocket peer for exercising the client and session loops.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use url::Url;

use crate::endpoint::{CaptureSink, PlaybackSource, StatusChannel, VoiceEndpoint};
use crate::remote_client::ClientOptions;

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Accept a single connection on a loopback port and hand it to `handler`.
///
/// Returns the `ws://` URL to connect to and a receiver for the request
/// path and query seen during the upgrade.
pub async fn serve_once<F, Fut>(handler: F) -> (String, oneshot::Receiver<String>)
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (uri_tx, uri_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let _ = uri_tx.send(request.uri().to_string());
            Ok(response)
        };
        let ws = accept_hdr_async(stream, capture).await.unwrap();
        handler(ws).await;
    });

    (format!("ws://{}/api/chat", addr), uri_rx)
}

/// URL of a loopback port with nothing listening on it.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/api/chat", addr)
}

pub fn client_options(url: &str, handshake_timeout: Duration) -> ClientOptions {
    ClientOptions {
        url: Url::parse(url).unwrap(),
        handshake_timeout,
        audio_queue_capacity: 100,
        text_queue_capacity: 50,
    }
}

/// Endpoint that hands its sink and source back to the test.
#[derive(Default)]
pub struct LoopbackEndpoint {
    pub sink: Mutex<Option<CaptureSink>>,
    pub source: Mutex<Option<PlaybackSource>>,
    pub stopped: AtomicBool,
}

impl VoiceEndpoint for LoopbackEndpoint {
    fn start_capture(&self, sink: CaptureSink) -> Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn start_playback(&self, source: PlaybackSource) -> Result<()> {
        *self.source.lock() = Some(source);
        Ok(())
    }

    fn stop_capture(&self) {
        self.sink.lock().take();
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn stop_playback(&self) {
        self.source.lock().take();
    }
}

/// Status channel that keeps every message it is sent.
#[derive(Default)]
pub struct RecordingStatus {
    messages: Mutex<Vec<String>>,
}

impl RecordingStatus {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// Poll until some message satisfies `pred`, for at most two seconds.
    pub async fn wait_for(&self, pred: impl Fn(&str) -> bool) -> bool {
        for _ in 0..200 {
            if self.messages.lock().iter().any(|m| pred(m)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl StatusChannel for RecordingStatus {
    async fn send(&self, message: &str) -> Result<()> {
        self.messages.lock().push(message.to_string());
        Ok(())
    }
}
