use std::fmt;

use steamcm_transport::{JobError, MsgType, TransportError};
use thiserror::Error;

/// Errors surfaced by the client facade and message handlers.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("failed to decode {msg} body: {source}")]
    BodyDecode {
        msg: MsgType,
        #[source]
        source: prost::DecodeError,
    },

    #[error("{0} is not a proto message")]
    NotProto(MsgType),

    #[error("expected {expected}, got {got}")]
    UnexpectedMessage { expected: MsgType, got: MsgType },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error type subscribers may return from fallible callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How a subscriber failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Returned an error.
    Error(String),
    /// Panicked.
    Panic(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Error(msg) => write!(f, "error: {}", msg),
            FailureKind::Panic(msg) => write!(f, "panic: {}", msg),
        }
    }
}

/// One subscriber that failed while handling an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Id of the failed subscription.
    pub subscription: u64,
    /// What went wrong.
    pub kind: FailureKind,
}

/// Every subscriber failure for one event, reported after all subscribers ran.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} subscriber(s) failed handling {event}", failures.len())]
pub struct DispatchError {
    /// Type name of the event.
    pub event: &'static str,
    /// Failures in subscription order.
    pub failures: Vec<HandlerFailure>,
}
