use thiserror::Error;

/// Errors raised by the CM protocol connection layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused to {addr}")]
    ConnectionRefused { addr: String },

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    #[error("frame length mismatch: declared {declared} bytes, {available} available")]
    LengthMismatch { declared: usize, available: usize },

    #[error("header overflow: header claims {claimed} bytes, {available} available")]
    HeaderOverflow { claimed: usize, available: usize },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    #[error("failed to decode message header: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("channel handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("frame failed integrity verification")]
    DecryptionFailed,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("transport {0} is not supported by this client")]
    UnsupportedTransport(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("server directory error: {0}")]
    Directory(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Malformed bytes at the codec boundary. Fatal to the current frame only.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidFrame { .. }
                | TransportError::LengthMismatch { .. }
                | TransportError::HeaderOverflow { .. }
                | TransportError::Decode(_)
        )
    }

    /// Errors after which the current connection cannot be used any more.
    ///
    /// A bad magic or an oversized length prefix means the byte stream itself is out of
    /// sync, so those count as fatal even though they are raised by the framing code.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            TransportError::ConnectionRefused { .. }
            | TransportError::ConnectionTimeout { .. }
            | TransportError::ConnectionReset
            | TransportError::InvalidMagic { .. }
            | TransportError::PayloadTooLarge { .. }
            | TransportError::Handshake { .. }
            | TransportError::DecryptionFailed
            | TransportError::EncryptionFailed(_)
            | TransportError::WebSocket(_)
            | TransportError::IoError(_) => true,
            TransportError::InvalidFrame { .. }
            | TransportError::LengthMismatch { .. }
            | TransportError::HeaderOverflow { .. }
            | TransportError::Decode(_)
            | TransportError::NotConnected
            | TransportError::UnsupportedTransport(_)
            | TransportError::Directory(_)
            | TransportError::SerializationError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
