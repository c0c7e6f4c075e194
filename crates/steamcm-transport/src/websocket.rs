//! WebSocket transport.
//!
//! Each binary WebSocket message carries exactly one frame body, without the TCP
//! envelope. Endpoints are reached over TLS (`wss://host:port/cmsocket/`), which is why
//! these connections skip channel encryption.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::discovery::{ServerRecord, TransportKind};
use crate::error::{Result, TransportError};
use crate::protocol::MAX_FRAME_SIZE;
use crate::transport::{Connection, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Connection (TCP + TLS + upgrade) timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Use `wss://`. Plain `ws://` is only meant for local test servers.
    pub secure: bool,
    /// Request path on the endpoint.
    pub path: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            secure: true,
            path: "/cmsocket/".to_string(),
        }
    }
}

/// WebSocket transport: opens CM connections over `ws://` or `wss://`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Creates a new WebSocket transport with the given configuration.
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// URL used to reach `record`.
    pub fn url_for(&self, record: &ServerRecord) -> String {
        let scheme = if self.config.secure { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, record.addr(), self.config.path)
    }

    /// Connects to `url`.
    pub async fn connect_url(&self, url: &str) -> Result<WebSocketConnection> {
        let timeout = std::time::Duration::from_millis(self.config.connect_timeout_ms);
        let (stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: url.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        debug!(url = url, "WebSocket connected");
        Ok(WebSocketConnection::new(stream, url.to_string()))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, record: &ServerRecord) -> Result<Box<dyn Connection>> {
        let conn = self.connect_url(&self.url_for(record)).await?;
        Ok(Box::new(conn))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }
}

/// An established WebSocket connection.
pub struct WebSocketConnection {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    peer_addr: String,
}

impl WebSocketConnection {
    fn new(stream: WsStream, peer_addr: String) -> Self {
        let (sink, stream) = stream.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            peer_addr,
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send_frame(&self, body: &[u8]) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(body.to_vec().into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn recv_frame(&self) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > MAX_FRAME_SIZE as usize {
                        return Err(TransportError::PayloadTooLarge {
                            size: data.len() as u32,
                            max_size: MAX_FRAME_SIZE,
                        });
                    }
                    return Ok(data.to_vec());
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(peer = %self.peer_addr, close = ?frame, "WebSocket closed by peer");
                    return Err(TransportError::ConnectionReset);
                }
                Some(Ok(Message::Text(_))) => {
                    debug!(peer = %self.peer_addr, "ignoring text message");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
                None => return Err(TransportError::ConnectionReset),
            }
        }
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let (mut tx, mut rx) = ws.split();
            while let Some(Ok(msg)) = rx.next().await {
                match msg {
                    Message::Binary(data) => {
                        tx.send(Message::Text("noise".into())).await.unwrap();
                        tx.send(Message::Binary(data)).await.unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_binary_roundtrip_skips_text() {
        let addr = echo_server().await;
        let transport = WebSocketTransport::new(WebSocketConfig {
            secure: false,
            ..Default::default()
        });
        let record = ServerRecord::new(
            addr.split(':').next().unwrap(),
            addr.rsplit(':').next().unwrap().parse().unwrap(),
            TransportKind::WebSocket,
        );
        let conn = transport.connect(&record).await.unwrap();
        assert!(!conn.requires_channel_encryption());
        conn.send_frame(b"frame body").await.unwrap();
        assert_eq!(conn.recv_frame().await.unwrap(), b"frame body");
        conn.close().await;
    }

    #[test]
    fn test_url_for() {
        let record = ServerRecord::new("cm1.example.net", 443, TransportKind::WebSocket);
        assert_eq!(
            WebSocketTransport::default().url_for(&record),
            "wss://cm1.example.net:443/cmsocket/"
        );
    }
}
