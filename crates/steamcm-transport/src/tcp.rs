//! TCP transport implementation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::discovery::{ServerRecord, TransportKind};
use crate::error::{Result, TransportError};
use crate::protocol::{encode_envelope, FrameDecoder};
use crate::transport::{Connection, Transport};

/// TCP transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// TCP transport: opens enveloped CM connections.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Establishes a TCP connection to the specified address.
    pub async fn connect_addr(&self, addr: &str) -> Result<TcpConnection> {
        let timeout = std::time::Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                },
                _ => TransportError::IoError(e),
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        tracing::debug!(addr = addr, "TCP connected");
        TcpConnection::from_stream(stream)
    }

    /// Binds to the specified address and returns a listener for incoming connections.
    pub async fn listen(&self, addr: &str) -> Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(TransportError::IoError)
    }

    /// Accepts an incoming TCP connection from the listener.
    pub async fn accept(&self, listener: &tokio::net::TcpListener) -> Result<TcpConnection> {
        let (stream, _) = listener.accept().await.map_err(TransportError::IoError)?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        TcpConnection::from_stream(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, record: &ServerRecord) -> Result<Box<dyn Connection>> {
        let conn = self.connect_addr(&record.addr()).await?;
        Ok(Box::new(conn))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

/// A single TCP connection carrying enveloped frames.
///
/// Reads go through a buffered [`FrameDecoder`], so a `recv_frame` future dropped
/// mid-frame loses no bytes.
pub struct TcpConnection {
    read: Mutex<(OwnedReadHalf, FrameDecoder)>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
    local_addr: String,
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: tokio::net::TcpStream) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        Ok(Self {
            read: Mutex::new((read, FrameDecoder::new())),
            write: Mutex::new(write),
            peer_addr,
            local_addr,
        })
    }

    /// Returns the local address of this TCP connection as a string.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send_frame(&self, body: &[u8]) -> Result<()> {
        let encoded = encode_envelope(body);
        let mut write = self.write.lock().await;
        write.write_all(&encoded).await.map_err(TransportError::IoError)?;
        write.flush().await.map_err(TransportError::IoError)?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Vec<u8>> {
        let mut guard = self.read.lock().await;
        let (read, decoder) = &mut *guard;
        loop {
            if let Some(frame) = decoder.next_frame()? {
                return Ok(frame);
            }
            let n = read
                .read_buf(decoder.buffer_mut())
                .await
                .map_err(TransportError::IoError)?;
            if n == 0 {
                return Err(TransportError::ConnectionReset);
            }
        }
    }

    async fn close(&self) {
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAGIC;

    #[tokio::test]
    async fn test_send_recv_frame() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let conn = transport.accept(&listener).await.unwrap();
            let frame = conn.recv_frame().await.unwrap();
            assert_eq!(frame, b"ping");
            conn.send_frame(b"pong").await.unwrap();
        });

        let client_transport = TcpTransport::new(TcpTransportConfig::default());
        let conn = client_transport.connect_addr(&addr).await.unwrap();
        conn.send_frame(b"ping").await.unwrap();
        let response = conn.recv_frame().await.unwrap();
        assert_eq!(response, b"pong");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_split_writes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = encode_envelope(b"fragmented body");
            for chunk in frame.chunks(3) {
                stream.write_all(chunk).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
        });

        let conn = TcpTransport::default().connect_addr(&addr).await.unwrap();
        assert_eq!(conn.recv_frame().await.unwrap(), b"fragmented body");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_bad_magic() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut frame = 4u32.to_le_bytes().to_vec();
            frame.extend_from_slice(&(MAGIC ^ 1).to_le_bytes());
            frame.extend_from_slice(b"oops");
            stream.write_all(&frame).await.unwrap();
        });

        let conn = TcpTransport::default().connect_addr(&addr).await.unwrap();
        let err = conn.recv_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidMagic { .. }));
        assert!(err.is_connection_fatal());
    }

    #[tokio::test]
    async fn test_peer_close_is_reset() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let conn = TcpTransport::default().connect_addr(&addr).await.unwrap();
        assert!(matches!(
            conn.recv_frame().await,
            Err(TransportError::ConnectionReset) | Err(TransportError::IoError(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = TcpTransport::default().connect_addr(&addr).await.err().unwrap();
        assert!(err.is_connection_fatal());
    }
}
