//! Abstract transport layer for CM connections.
//!
//! A [`Transport`] opens byte-stream connections to [`ServerRecord`]s; a [`Connection`]
//! sends and receives whole frame bodies. Neither knows anything about message headers
//! or encryption.

use async_trait::async_trait;

use crate::discovery::{ServerRecord, TransportKind};
use crate::error::{Result, TransportError};
use crate::tcp::{TcpTransport, TcpTransportConfig};
use crate::websocket::{WebSocketConfig, WebSocketTransport};

/// Opens connections of one transport kind.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the endpoint described by `record`.
    async fn connect(&self, record: &ServerRecord) -> Result<Box<dyn Connection>>;

    /// Kind of connection this transport opens.
    fn kind(&self) -> TransportKind;
}

/// An established connection carrying frame bodies.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one frame body.
    async fn send_frame(&self, body: &[u8]) -> Result<()>;

    /// Receive the next frame body.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses no data, so it
    /// can sit in a `tokio::select!` loop.
    async fn recv_frame(&self) -> Result<Vec<u8>>;

    /// Close the connection. Errors are ignored.
    async fn close(&self);

    /// Get the remote peer address.
    fn peer_addr(&self) -> &str;

    /// Kind of this connection.
    fn kind(&self) -> TransportKind;

    /// Whether frame bodies need the channel encryption handshake.
    fn requires_channel_encryption(&self) -> bool {
        self.kind() == TransportKind::Tcp
    }
}

/// Picks the transport matching each server record.
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    tcp: TcpTransport,
    websocket: WebSocketTransport,
}

impl TransportFactory {
    /// Creates a factory with the given per-kind configuration.
    pub fn new(tcp: TcpTransportConfig, websocket: WebSocketConfig) -> Self {
        Self {
            tcp: TcpTransport::new(tcp),
            websocket: WebSocketTransport::new(websocket),
        }
    }

    /// Transport kinds this factory can open.
    pub fn supported_kinds() -> &'static [TransportKind] {
        &[TransportKind::Tcp, TransportKind::WebSocket]
    }

    /// Connects to `record` with the transport for its kind.
    pub async fn connect(&self, record: &ServerRecord) -> Result<Box<dyn Connection>> {
        match record.kind {
            TransportKind::Tcp => self.tcp.connect(record).await,
            TransportKind::WebSocket => self.websocket.connect(record).await,
            TransportKind::Udp => Err(TransportError::UnsupportedTransport(record.kind.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_is_unsupported() {
        let factory = TransportFactory::default();
        let record = ServerRecord::new("127.0.0.1", 27017, TransportKind::Udp);
        let err = factory.connect(&record).await.err().unwrap();
        assert!(matches!(err, TransportError::UnsupportedTransport(_)));
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn test_supported_kinds() {
        assert!(!TransportFactory::supported_kinds().contains(&TransportKind::Udp));
    }

    #[tokio::test]
    async fn test_tcp_connection_needs_encryption() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let record = ServerRecord::new("127.0.0.1", port, TransportKind::Tcp);
        let conn = TransportFactory::default().connect(&record).await.unwrap();
        assert!(conn.requires_channel_encryption());
        assert_eq!(conn.kind(), TransportKind::Tcp);
    }
}
