//! Heartbeat tracking for CM connections.
//!
//! The client sends `ClientHeartBeat` at a fixed interval while connected. Missing
//! heartbeats are the server's concern; the client only sends them and keeps counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::message::PacketMsg;
use crate::protocol::MsgType;

/// Configuration for heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats in milliseconds until the server sends its own (default: 5000).
    pub interval_ms: u64,
    /// Whether heartbeats are sent at all.
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            enabled: true,
        }
    }
}

impl HeartbeatConfig {
    /// Interval as a duration, never shorter than 10ms.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(10))
    }
}

/// `CMsgClientHeartBeat` body.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientHeartBeat {
    /// Ask the server to answer the heartbeat.
    #[prost(bool, optional, tag = "1")]
    pub send_reply: Option<bool>,
}

/// Builds the heartbeat message sent on every tick.
pub fn heartbeat_packet() -> PacketMsg {
    let body = ClientHeartBeat {
        send_reply: Some(true),
    };
    PacketMsg::new_proto(MsgType::CLIENT_HEART_BEAT, prost::Message::encode_to_vec(&body))
}

/// Heartbeat counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    /// Heartbeats sent since the tracker was reset.
    pub total_sent: u64,
    /// Inbound frames seen since the tracker was reset.
    pub total_received: u64,
    /// Time since the last heartbeat was sent.
    pub since_last_sent: Option<Duration>,
    /// Time since the last inbound frame.
    pub since_last_received: Option<Duration>,
}

/// Tracks heartbeats sent and frames received on a connection.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    total_sent: AtomicU64,
    total_received: AtomicU64,
    last_sent: Mutex<Option<Instant>>,
    last_received: Mutex<Option<Instant>>,
}

impl HeartbeatTracker {
    /// Creates a tracker with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a heartbeat was sent.
    pub fn record_sent(&self) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        *self.last_sent.lock() = Some(Instant::now());
    }

    /// Records an inbound frame.
    pub fn record_received(&self) {
        self.total_received.fetch_add(1, Ordering::Relaxed);
        *self.last_received.lock() = Some(Instant::now());
    }

    /// Clears all counters, at the start of each session.
    pub fn reset(&self) {
        self.total_sent.store(0, Ordering::Relaxed);
        self.total_received.store(0, Ordering::Relaxed);
        *self.last_sent.lock() = None;
        *self.last_received.lock() = None;
    }

    /// Returns current statistics.
    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_received: self.total_received.load(Ordering::Relaxed),
            since_last_sent: self.last_sent.lock().map(|t| t.elapsed()),
            since_last_received: self.last_received.lock().map(|t| t.elapsed()),
        }
    }
}
