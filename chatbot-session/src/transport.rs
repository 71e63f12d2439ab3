//! Transport adapter: one bidirectional socket connection exposed as a
//! command handle plus an ordered event stream.
//!
//! Every event for a connection is produced by a single task, so consumers
//! observe `Opened` at most once, then any number of `Message`s, then exactly
//! one `Closed` (possibly preceded by an `Error`). Nothing is delivered after
//! `Closed`.
//!
//! [`Connector`] and [`TransportHandle`] are the seam the session is written
//! against; [`WebSocketConnector`] is the production implementation on top of
//! `tokio-tungstenite`.

use std::{borrow::Cow, time::Duration};

use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    select,
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};
use url::Url;

/// Close code for a deliberate, orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the peer's close frame carried no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the connection ended without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A discrete payload received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(Frame),
    Error(TransportError),
    Closed { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server answered the upgrade request with an HTTP error status.
    #[error("HTTP {status}: WebSocket upgrade rejected")]
    Rejected { status: u16 },
    #[error("{0}")]
    Connect(String),
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// `send` was called before `Opened` was delivered.
    #[error("send attempted before the connection was open")]
    NotOpen,
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Opens connections. Must not block and must not fail synchronously: a
/// connection that cannot be established reports `Error` then `Closed`.
pub trait Connector: Send + 'static {
    type Handle: TransportHandle;

    fn connect(&self, url: &Url) -> (Self::Handle, TransportEvents);
}

/// Caller side of an open (or opening) connection.
pub trait TransportHandle: Send + 'static {
    /// Queues one text frame. Before `Opened` this is reported as
    /// [`TransportError::NotOpen`] on the event stream.
    fn send(&self, text: String);

    /// Starts a graceful shutdown. Always followed by exactly one `Closed`,
    /// including when the connection never opened.
    fn close(&self, code: Option<u16>, reason: Option<String>);
}

#[derive(Debug)]
enum SocketCommand {
    Send(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Closure {
    code: u16,
    reason: String,
}

impl Closure {
    fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason)
    }
}

/// WebSocket client connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Option<Duration>,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the TCP + upgrade handshake. `None` waits indefinitely.
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Connector for WebSocketConnector {
    type Handle = WebSocketHandle;

    fn connect(&self, url: &Url) -> (Self::Handle, TransportEvents) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(drive_socket(
            url.to_string(),
            self.connect_timeout,
            command_rx,
            event_tx,
        ));

        (
            WebSocketHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketHandle {
    commands: mpsc::UnboundedSender<SocketCommand>,
}

impl TransportHandle for WebSocketHandle {
    fn send(&self, text: String) {
        if self.commands.send(SocketCommand::Send(text)).is_err() {
            debug!("websocket task already finished, dropping outbound frame");
        }
    }

    fn close(&self, code: Option<u16>, reason: Option<String>) {
        let command = SocketCommand::Close {
            code: code.unwrap_or(NORMAL_CLOSURE),
            reason: reason.unwrap_or_default(),
        };
        if self.commands.send(command).is_err() {
            debug!("websocket task already finished, close is a no-op");
        }
    }
}

enum Opening {
    Open(WsStream),
    Aborted(Closure),
    Failed(TransportError),
}

async fn drive_socket(
    url: String,
    connect_timeout: Option<Duration>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let closure = match open_socket(&url, connect_timeout, &mut commands, &events).await {
        Opening::Open(stream) => {
            emit(&events, TransportEvent::Opened);
            pump(stream, &mut commands, &events).await
        }
        Opening::Aborted(closure) => closure,
        Opening::Failed(error) => {
            warn!(%url, %error, "websocket connection failed");
            emit(&events, TransportEvent::Error(error));
            Closure::abnormal("connection failed")
        }
    };

    debug!(code = closure.code, reason = %closure.reason, "websocket closed");
    emit(
        &events,
        TransportEvent::Closed {
            code: closure.code,
            reason: closure.reason,
        },
    );
}

async fn open_socket(
    url: &str,
    connect_timeout: Option<Duration>,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> Opening {
    info!(%url, "websocket connecting");

    let handshake = async {
        let attempt = connect_async(url);
        let result = match connect_timeout {
            Some(limit) => match timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => return Err(TransportError::ConnectTimeout(limit)),
            },
            None => attempt.await,
        };
        match result {
            Ok((stream, response)) => {
                info!(%url, status = %response.status(), "websocket connected");
                Ok(stream)
            }
            Err(error) => Err(classify_connect_error(url, error)),
        }
    };
    tokio::pin!(handshake);

    loop {
        select! {
            result = &mut handshake => {
                return match result {
                    Ok(stream) => Opening::Open(stream),
                    Err(error) => Opening::Failed(error),
                };
            }
            command = commands.recv() => match command {
                Some(SocketCommand::Send(_)) => {
                    emit(events, TransportEvent::Error(TransportError::NotOpen));
                }
                Some(SocketCommand::Close { code, reason }) => {
                    debug!(%url, "connect aborted by caller");
                    return Opening::Aborted(Closure::new(code, reason));
                }
                None => return Opening::Aborted(Closure::new(NORMAL_CLOSURE, "handle dropped")),
            },
        }
    }
}

fn classify_connect_error(url: &str, error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Http(response) => TransportError::Rejected {
            status: response.status().as_u16(),
        },
        other => TransportError::Connect(format!("WebSocket connection to '{url}' failed: {other}")),
    }
}

async fn pump(
    stream: WsStream,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> Closure {
    let (mut writer, mut reader) = stream.split();

    loop {
        select! {
            command = commands.recv() => match command {
                Some(SocketCommand::Send(text)) => {
                    if let Err(error) = writer.send(Message::Text(text)).await {
                        emit(events, TransportEvent::Error(TransportError::Write(error.to_string())));
                        return Closure::abnormal("write failed");
                    }
                }
                Some(SocketCommand::Close { code, reason }) => {
                    return close_gracefully(&mut writer, &mut reader, Closure::new(code, reason)).await;
                }
                None => {
                    let closure = Closure::new(NORMAL_CLOSURE, "handle dropped");
                    return close_gracefully(&mut writer, &mut reader, closure).await;
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => emit(events, TransportEvent::Message(Frame::Text(text))),
                Some(Ok(Message::Binary(data))) => emit(events, TransportEvent::Message(Frame::Binary(data))),
                Some(Ok(Message::Close(frame))) => {
                    info!("websocket received close frame");
                    return match frame {
                        Some(frame) => Closure::new(frame.code.into(), frame.reason.into_owned()),
                        None => Closure::new(NO_STATUS_RECEIVED, ""),
                    };
                }
                Some(Ok(Message::Ping(payload))) => {
                    debug!("websocket ping received ({} bytes)", payload.len());
                }
                Some(Ok(Message::Pong(_))) => debug!("websocket pong received"),
                Some(Ok(Message::Frame(_))) => debug!("websocket raw frame ignored"),
                Some(Err(error)) => {
                    emit(events, TransportEvent::Error(TransportError::Read(error.to_string())));
                    return Closure::abnormal("read failed");
                }
                None => return Closure::abnormal("connection dropped"),
            },
        }
    }
}

async fn close_gracefully(
    writer: &mut SplitSink<WsStream, Message>,
    reader: &mut SplitStream<WsStream>,
    closure: Closure,
) -> Closure {
    let frame = CloseFrame {
        code: CloseCode::from(closure.code),
        reason: Cow::Owned(closure.reason.clone()),
    };
    if let Err(error) = writer.send(Message::Close(Some(frame))).await {
        warn!("error sending websocket close frame: {error}");
        return closure;
    }

    // Inbound frames after our close frame are discarded.
    let acknowledged = timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(frame) = reader.next().await {
            if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    })
    .await;
    if acknowledged.is_err() {
        debug!("peer did not answer the close frame within {CLOSE_HANDSHAKE_TIMEOUT:?}");
    }

    closure
}

fn emit(events: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent) {
    if let Err(error) = events.send(event) {
        debug!("transport event receiver dropped: {:?}", error.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn rejected_upgrade_keeps_status() {
        let err = TransportError::Rejected { status: 401 };
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn send_before_open_is_reported_and_close_aborts_the_attempt() {
        // The listener never accepts, so the upgrade never completes.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let url = Url::parse(&format!("ws://{addr}/chatbot")).expect("url");

        let connector = WebSocketConnector::new().with_connect_timeout(None);
        let (handle, mut events) = connector.connect(&url);

        handle.send("too early".into());
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Error(TransportError::NotOpen))
        );

        handle.close(None, Some("bye".into()));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Closed {
                code: NORMAL_CLOSURE,
                reason: "bye".into()
            })
        );
        assert_eq!(events.recv().await, None);

        drop(listener);
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_error_then_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);
        let url = Url::parse(&format!("ws://{addr}/chatbot")).expect("url");

        let (_handle, mut events) = WebSocketConnector::new().connect(&url);

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Error(TransportError::Connect(_)))
        ));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                ..
            })
        ));
        assert_eq!(events.recv().await, None);
    }
}
