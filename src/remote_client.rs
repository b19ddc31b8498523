use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::error::ClientError;
use crate::protocol::{self, MessageTag};
use crate::queue::BoundedQueue;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Connection parameters for the remote peer.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: Url,
    pub handshake_timeout: Duration,
    pub audio_queue_capacity: usize,
    pub text_queue_capacity: usize,
}

/// WebSocket client for the remote voice peer.
///
/// After a successful [`connect`](Self::connect) a background task reads the
/// socket and demultiplexes inbound messages into the audio and text queues.
pub struct RemoteClient {
    options: ClientOptions,
    state: Arc<Mutex<ClientState>>,
    writer: tokio::sync::Mutex<Option<WsWriter>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    audio_queue: Arc<BoundedQueue<Bytes>>,
    text_queue: Arc<BoundedQueue<String>>,
}

impl RemoteClient {
    pub fn new(options: ClientOptions) -> Self {
        let audio_queue = Arc::new(BoundedQueue::new(
            "remote audio",
            options.audio_queue_capacity,
        ));
        let text_queue = Arc::new(BoundedQueue::new("remote text", options.text_queue_capacity));
        Self {
            options,
            state: Arc::new(Mutex::new(ClientState::Disconnected)),
            writer: tokio::sync::Mutex::new(None),
            receive_task: Mutex::new(None),
            audio_queue,
            text_queue,
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Encoded audio chunks received from the remote peer, in arrival order.
    pub fn audio_queue(&self) -> &Arc<BoundedQueue<Bytes>> {
        &self.audio_queue
    }

    /// Text fragments received from the remote peer, in arrival order.
    pub fn text_queue(&self) -> &Arc<BoundedQueue<String>> {
        &self.text_queue
    }

    /// The full connection URL with both prompts as query parameters.
    pub fn connect_url(&self, text_prompt: &str, voice_prompt: &str) -> Url {
        let mut url = self.options.url.clone();
        url.query_pairs_mut()
            .append_pair("text_prompt", text_prompt)
            .append_pair("voice_prompt", voice_prompt);
        url
    }

    /// Open the connection and wait for the handshake message.
    ///
    /// On any failure the connection is torn down before returning and the
    /// client is left `Closed`.
    pub async fn connect(&self, text_prompt: &str, voice_prompt: &str) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock();
            if *state != ClientState::Disconnected {
                return Err(ClientError::InvalidState(*state));
            }
            *state = ClientState::Connecting;
        }

        let url = self.connect_url(text_prompt, voice_prompt);
        log::info!("Connecting to remote peer: {}", url);

        let ws_stream = match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.set_state(ClientState::Closed);
                return Err(ClientError::Connect(e));
            }
        };
        let (mut write, mut read) = ws_stream.split();

        if let Err(e) = self.await_handshake(&mut read).await {
            if let Err(close_err) = write.close().await {
                log::debug!("Close after failed handshake: {}", close_err);
            }
            self.set_state(ClientState::Closed);
            return Err(e);
        }
        log::info!("Remote handshake received");

        *self.writer.lock().await = Some(write);
        self.set_state(ClientState::Connected);

        let task = tokio::spawn(receive_loop(
            read,
            self.audio_queue.clone(),
            self.text_queue.clone(),
            self.state.clone(),
        ));
        *self.receive_task.lock() = Some(task);
        Ok(())
    }

    async fn await_handshake(&self, read: &mut WsReader) -> Result<(), ClientError> {
        let timeout = self.options.handshake_timeout;
        let first = async {
            loop {
                match read.next().await {
                    // Keepalives may arrive before the handshake
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    other => return other,
                }
            }
        };
        let msg = match tokio::time::timeout(timeout, first).await {
            Err(_) => {
                log::error!("No handshake within {:?}", timeout);
                return Err(ClientError::HandshakeTimeout(timeout));
            }
            Ok(None) => return Err(ClientError::ClosedDuringHandshake),
            Ok(Some(Err(e))) => return Err(ClientError::Connect(e)),
            Ok(Some(Ok(msg))) => msg,
        };

        let data = match msg {
            Message::Binary(data) => data,
            Message::Close(frame) => {
                log::info!("Remote closed during handshake: {:?}", frame);
                return Err(ClientError::ClosedDuringHandshake);
            }
            other => {
                return Err(ClientError::Handshake(format!(
                    "expected binary handshake, got {:?}",
                    other
                )));
            }
        };

        match protocol::decode(&data) {
            Ok((MessageTag::Handshake, _)) => Ok(()),
            Ok((tag, _)) => Err(ClientError::Handshake(format!(
                "expected handshake (0x00), got {:?}",
                tag
            ))),
            Err(e) => Err(ClientError::Handshake(e.to_string())),
        }
    }

    /// Send one encoded audio chunk as an Audio message.
    pub async fn send_audio(&self, chunk: &[u8]) -> Result<(), ClientError> {
        if self.state() != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        let write = writer.as_mut().ok_or(ClientError::NotConnected)?;
        let message = protocol::encode(MessageTag::Audio, chunk);
        write
            .send(Message::Binary(message.into()))
            .await
            .map_err(ClientError::Send)
    }

    /// Stop the receive loop and close the connection. Safe to call in any
    /// state and more than once.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ClientState::Closed && self.receive_task.lock().is_none() {
                return;
            }
            *state = ClientState::Closing;
        }
        log::info!("Closing remote client");

        let task = self.receive_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        if let Some(mut write) = self.writer.lock().await.take() {
            if let Err(e) = write.close().await {
                log::debug!("WebSocket close: {}", e);
            }
        }

        self.set_state(ClientState::Closed);
        log::info!("Remote client closed");
    }

    fn set_state(&self, next: ClientState) {
        *self.state.lock() = next;
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.get_mut().take() {
            task.abort();
        }
    }
}

// ======================== Receive loop ========================

async fn receive_loop(
    mut read: WsReader,
    audio_queue: Arc<BoundedQueue<Bytes>>,
    text_queue: Arc<BoundedQueue<String>>,
    state: Arc<Mutex<ClientState>>,
) {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Binary(data)) => route(data, &audio_queue, &text_queue),
            Ok(Message::Close(frame)) => {
                log::info!("Remote closed connection: {:?}", frame);
                break;
            }
            Ok(Message::Text(text)) => {
                log::debug!("Ignoring text frame ({} bytes)", text.len());
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    *state.lock() = ClientState::Closed;
    log::info!("Receive loop ended");
}

fn route(data: Bytes, audio_queue: &BoundedQueue<Bytes>, text_queue: &BoundedQueue<String>) {
    let tag = match protocol::decode(&data) {
        Ok((tag, _)) => tag,
        Err(e) => {
            log::warn!("Dropping message: {}", e);
            return;
        }
    };
    let payload = data.slice(1..);

    match tag {
        MessageTag::Audio => {
            audio_queue.push(payload);
        }
        MessageTag::Text => match String::from_utf8(payload.to_vec()) {
            Ok(text) => {
                text_queue.push(text);
            }
            Err(e) => log::warn!("Dropping text message with invalid UTF-8: {}", e),
        },
        MessageTag::Handshake => log::warn!("Unexpected handshake after connect, dropped"),
    }
}
