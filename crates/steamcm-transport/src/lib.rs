#![warn(missing_docs)]

//! SteamCM transport subsystem: CM framing and codec, channel encryption, job correlation,
//! TCP/WebSocket connection core with heartbeat and reconnect
//!
//! Send path: PacketMsg → encode → (TCP: encrypt) → envelope / WebSocket message
//! Receive path: frame → (TCP: decrypt) → decode → Multi unpack → job registry or router

pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod job;
pub mod jobs;
pub mod keepalive;
pub mod message;
pub mod protocol;
pub mod retry;
pub mod tcp;
pub mod transport;
pub mod websocket;

pub use connection::{CmConnection, CmConnectionBuilder, ConnectionConfig, ConnectionObserver, ConnectionState};
pub use crypto::{
    ChannelCipher, ChannelNegotiator, HandshakeState, SessionKey, UniverseKey, UniversePrivateKey,
};
pub use discovery::{
    DirectoryConfig, DirectoryServiceProvider, FallbackServerListProvider, FileServerListProvider,
    MemoryServerListProvider, ServerDirectory, ServerListProvider, ServerQuality, ServerRecord,
    TransportKind, DEFAULT_DIRECTORY_URL,
};
pub use dispatch::{MessageRouter, NetworkListener, RouteFn};
pub use error::{Result, TransportError};
pub use identity::{SessionAttributes, SessionInfo, SteamId};
pub use job::{JobId, JobIdAllocator};
pub use jobs::{CancelReason, JobCanceller, JobError, JobRegistry, JobResult, MultiJob, Resolution, SingleJob};
pub use keepalive::{HeartbeatConfig, HeartbeatStats};
pub use message::{decode_message, encode_message, MsgHeader, PacketMsg, ProtoHeader, StructHeader};
pub use protocol::{EResult, MsgType, Universe};
pub use retry::ReconnectPolicy;
pub use tcp::TcpTransportConfig;
pub use transport::{Connection, Transport, TransportFactory};
pub use websocket::WebSocketConfig;
