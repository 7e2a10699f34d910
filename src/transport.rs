//! Transport abstraction.
//!
//! The connection talks to the server over WebSocket when it can and falls
//! back to raw TCP+TLS. Both are reduced to one [`Transport`] type that
//! splits into independent read/write halves, plus a [`Dialer`] seam so
//! tests can substitute an in-memory loopback.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;

/// One unit of wire traffic: a binary envelope frame or a legacy text
/// frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Any async byte stream usable as a fallback transport.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// An established transport, before splitting.
pub enum Transport {
    WebSocket(WsStream),
    Stream(Box<dyn ByteStream>),
}

impl Transport {
    /// Wrap any byte stream, e.g. a TLS-wrapped TCP connection or a test
    /// duplex.
    pub fn from_stream(stream: impl ByteStream + 'static) -> Self {
        Transport::Stream(Box::new(stream))
    }

    /// A connected in-memory pair for loopback tests.
    pub fn duplex(max_buf: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(max_buf);
        (Self::from_stream(a), Self::from_stream(b))
    }

    /// Split into write and read halves owned by separate tasks.
    pub fn split(self) -> (TransportSink, TransportStream) {
        match self {
            Transport::WebSocket(ws) => {
                let (sink, stream) = ws.split();
                (TransportSink::WebSocket(sink), TransportStream::WebSocket(stream))
            }
            Transport::Stream(inner) => {
                let (read, write) = tokio::io::split(inner);
                (TransportSink::Stream(write), TransportStream::Stream(read))
            }
        }
    }
}

/// Write half of a transport.
pub enum TransportSink {
    WebSocket(SplitSink<WsStream, WsMessage>),
    Stream(WriteHalf<Box<dyn ByteStream>>),
}

impl TransportSink {
    /// Write one frame. Byte-stream transports carry only the raw bytes;
    /// framing is the envelope's job.
    pub async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        match self {
            TransportSink::WebSocket(sink) => {
                let message = match frame {
                    Frame::Binary(data) => WsMessage::Binary(data),
                    Frame::Text(text) => WsMessage::Text(text),
                };
                sink.send(message)
                    .await
                    .map_err(|e| ConnectionError::SendFailed(e.to_string()))
            }
            TransportSink::Stream(write) => {
                let data = match &frame {
                    Frame::Binary(data) => data.as_slice(),
                    Frame::Text(text) => text.as_bytes(),
                };
                write
                    .write_all(data)
                    .await
                    .map_err(|e| ConnectionError::SendFailed(e.to_string()))
            }
        }
    }

    /// Close the transport for writing.
    pub async fn close(&mut self) {
        match self {
            TransportSink::WebSocket(sink) => {
                if let Err(e) = sink.send(WsMessage::Close(None)).await {
                    debug!("close frame not delivered: {}", e);
                }
                let _ = sink.close().await;
            }
            TransportSink::Stream(write) => {
                let _ = write.shutdown().await;
            }
        }
    }
}

/// Read half of a transport.
pub enum TransportStream {
    WebSocket(SplitStream<WsStream>),
    Stream(ReadHalf<Box<dyn ByteStream>>),
}

impl TransportStream {
    /// Next frame, or `Ok(None)` when the peer closed the transport.
    ///
    /// Byte-stream transports yield raw chunks; the caller reassembles
    /// envelope frames from them.
    pub async fn next(&mut self) -> Result<Option<Frame>, ConnectionError> {
        match self {
            TransportStream::WebSocket(stream) => loop {
                match stream.next().await {
                    None => return Ok(None),
                    Some(Ok(WsMessage::Binary(data))) => return Ok(Some(Frame::Binary(data))),
                    Some(Ok(WsMessage::Text(text))) => return Ok(Some(Frame::Text(text))),
                    Some(Ok(WsMessage::Close(_))) => return Ok(None),
                    // Control frames; tungstenite answers pings itself.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(ConnectionError::ReceiveFailed(e.to_string())),
                }
            },
            TransportStream::Stream(read) => {
                let mut chunk = vec![0u8; 4096];
                let n = read
                    .read(&mut chunk)
                    .await
                    .map_err(|e| ConnectionError::ReceiveFailed(e.to_string()))?;
                if n == 0 {
                    return Ok(None);
                }
                chunk.truncate(n);
                Ok(Some(Frame::Binary(chunk)))
            }
        }
    }
}

/// Establishes transports. The production dialer reaches the network;
/// tests supply scripted ones.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, config: &ConnectionConfig) -> Result<Transport, ConnectionError>;
}

/// WebSocket-first dialer with a TCP+TLS fallback.
pub struct NetDialer {
    headers: BTreeMap<String, String>,
}

impl NetDialer {
    pub fn new() -> Self {
        Self {
            headers: BTreeMap::new(),
        }
    }

    /// Extra headers for the WebSocket upgrade, fixed before the first
    /// dial.
    pub fn with_headers(headers: BTreeMap<String, String>) -> Self {
        Self { headers }
    }

    async fn dial_websocket(&self, config: &ConnectionConfig) -> Result<WsStream, ConnectionError> {
        let mut request = config
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| ConnectionError::ConnectFailed {
                url: config.endpoint.clone(),
                reason: e.to_string(),
            })?;

        let header_map = request.headers_mut();
        for (name, value) in default_headers(config).iter().chain(self.headers.iter()) {
            let name: tokio_tungstenite::tungstenite::http::header::HeaderName = name
                .parse()
                .map_err(|_| ConnectionError::ConnectFailed {
                    url: config.endpoint.clone(),
                    reason: format!("invalid header name: {}", name),
                })?;
            let value = HeaderValue::from_str(value).map_err(|_| ConnectionError::ConnectFailed {
                url: config.endpoint.clone(),
                reason: "invalid header value".to_string(),
            })?;
            header_map.insert(name, value);
        }

        let (ws, _response) =
            connect_async(request)
                .await
                .map_err(|e| ConnectionError::ConnectFailed {
                    url: config.endpoint.clone(),
                    reason: e.to_string(),
                })?;
        Ok(ws)
    }

    async fn dial_tcp_tls(&self, config: &ConnectionConfig) -> Result<Transport, ConnectionError> {
        let addr = &config.fallback_addr;
        let domain = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| ConnectionError::ConnectFailed {
                url: addr.clone(),
                reason: e.to_string(),
            })?;

        let connector =
            native_tls::TlsConnector::new().map_err(|e| ConnectionError::ConnectFailed {
                url: addr.clone(),
                reason: e.to_string(),
            })?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = connector
            .connect(domain, tcp)
            .await
            .map_err(|e| ConnectionError::ConnectFailed {
                url: addr.clone(),
                reason: e.to_string(),
            })?;

        Ok(Transport::from_stream(tls))
    }
}

impl Default for NetDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, config: &ConnectionConfig) -> Result<Transport, ConnectionError> {
        match self.dial_websocket(config).await {
            Ok(ws) => Ok(Transport::WebSocket(ws)),
            Err(ws_err) => {
                warn!(
                    "websocket dial to {} failed ({}); trying tcp fallback {}",
                    config.endpoint, ws_err, config.fallback_addr
                );
                self.dial_tcp_tls(config).await
            }
        }
    }
}

fn default_headers(config: &ConnectionConfig) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert("User-Agent".to_string(), config.user_agent.clone());
    headers.insert("Origin".to_string(), config.origin.clone());
    headers
}
