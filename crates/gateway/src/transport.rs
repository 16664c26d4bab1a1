//! Message-level transport seam.
//!
//! The client logic speaks `FrameReader`/`FrameWriter` so the handshake and
//! read loop can be driven by channel-backed mocks in tests. The production
//! implementation wraps a split `tokio-tungstenite` stream, dialled either
//! directly or over an overlay-network stream.

use std::{io, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    futures_util::{
        stream::{SplitSink, SplitStream},
        SinkExt, StreamExt,
    },
    tokio::io::{AsyncRead, AsyncWrite},
    tokio::time,
    tokio_tungstenite::{
        client_async_tls_with_config, connect_async_with_config,
        tungstenite::{
            client::IntoClientRequest,
            http::{header, HeaderValue},
            protocol::WebSocketConfig,
            Error as WsError, Message,
        },
        WebSocketStream,
    },
    tracing::warn,
};

use crate::error::ClientError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_MESSAGE_BYTES: usize = 8 << 20;

/// One inbound websocket message, reduced to what the client cares about.
/// Close frames surface as `ClientError::Closed` from `next_message`.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Ping,
    Pong,
}

#[async_trait]
pub trait FrameReader: Send {
    async fn next_message(&mut self) -> Result<Inbound, ClientError>;
}

#[async_trait]
pub trait FrameWriter: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ClientError>;
    async fn send_ping(&mut self) -> Result<(), ClientError>;
}

/// Establishes one connection and hands back its message halves.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<(Box<dyn FrameReader>, Box<dyn FrameWriter>), ClientError>;
}

/// Raw byte stream the websocket can ride on. The overlay-network client
/// supplies these; a plain TCP implementation stands in otherwise.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// Dial contract consumed from the overlay-network client.
#[async_trait]
pub trait StreamDialer: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn RawStream>>;
}

// ── Production websocket transport ───────────────────────────────────────────

pub struct WsDialer {
    url: String,
    user_agent: Option<String>,
    stream_dialer: Option<Arc<dyn StreamDialer>>,
}

impl WsDialer {
    pub fn new(
        url: impl Into<String>,
        user_agent: Option<String>,
        stream_dialer: Option<Arc<dyn StreamDialer>>,
    ) -> Self {
        Self {
            url: url.into(),
            user_agent,
            stream_dialer,
        }
    }

    fn websocket_config() -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_MESSAGE_BYTES);
        config.max_frame_size = Some(MAX_MESSAGE_BYTES);
        config
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<(Box<dyn FrameReader>, Box<dyn FrameWriter>), ClientError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if let Some(ua) = &self.user_agent {
            let value = HeaderValue::from_str(ua)
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            request.headers_mut().insert(header::USER_AGENT, value);
        }
        let config = Some(Self::websocket_config());

        match &self.stream_dialer {
            Some(dialer) => {
                let host = request
                    .uri()
                    .host()
                    .ok_or_else(|| ClientError::Transport("url has no host".into()))?
                    .to_string();
                let port = request.uri().port_u16().unwrap_or_else(|| {
                    if request.uri().scheme_str() == Some("wss") {
                        443
                    } else {
                        80
                    }
                });
                let stream = dialer
                    .connect(&host, port)
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string()))?;
                let (ws, _) = time::timeout(
                    HANDSHAKE_TIMEOUT,
                    client_async_tls_with_config(request, stream, config, None),
                )
                .await
                .map_err(|_| ClientError::Transport("websocket handshake timed out".into()))?
                .map_err(map_ws_error)?;
                Ok(split_stream(ws))
            },
            None => {
                let (ws, _) = time::timeout(
                    HANDSHAKE_TIMEOUT,
                    connect_async_with_config(request, config, false),
                )
                .await
                .map_err(|_| ClientError::Transport("websocket handshake timed out".into()))?
                .map_err(map_ws_error)?;
                Ok(split_stream(ws))
            },
        }
    }
}

fn split_stream<S>(ws: WebSocketStream<S>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = ws.split();
    (
        Box::new(WsFrameReader { inner: stream }),
        Box::new(WsFrameWriter { inner: sink }),
    )
}

struct WsFrameReader<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameReader for WsFrameReader<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn next_message(&mut self) -> Result<Inbound, ClientError> {
        loop {
            let message = match self.inner.next().await {
                None => {
                    return Err(ClientError::Closed {
                        code: None,
                        reason: "connection closed".into(),
                    })
                },
                Some(Err(err)) => return Err(map_ws_error(err)),
                Some(Ok(message)) => message,
            };
            match message {
                Message::Text(text) => return Ok(Inbound::Text(text)),
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Inbound::Text(text)),
                    Err(_) => {
                        warn!("gateway: dropping non-UTF-8 binary frame");
                        continue;
                    },
                },
                Message::Ping(_) => return Ok(Inbound::Ping),
                Message::Pong(_) => return Ok(Inbound::Pong),
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    return Err(ClientError::Closed { code, reason });
                },
                Message::Frame(_) => continue,
            }
        }
    }
}

struct WsFrameWriter<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameWriter for WsFrameWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn send_text(&mut self, text: String) -> Result<(), ClientError> {
        self.inner.send(Message::Text(text)).await.map_err(map_ws_error)
    }

    async fn send_ping(&mut self) -> Result<(), ClientError> {
        self.inner
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(map_ws_error)
    }
}

fn map_ws_error(err: WsError) -> ClientError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ClientError::Closed {
            code: None,
            reason: "connection closed".into(),
        },
        other => ClientError::Transport(other.to_string()),
    }
}
