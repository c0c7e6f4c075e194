//! Per-message-type dispatch table and network listeners.
//!
//! The [`MessageRouter`] is assembled once, before the connection is built, and is
//! read-only afterwards. Inbound messages without a target job are looked up by type and
//! handed to every route registered for it, in registration order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::connection::CmConnection;
use crate::message::PacketMsg;
use crate::protocol::MsgType;

/// A route invoked on the connection worker for each matching message.
pub type RouteFn = Arc<dyn Fn(&PacketMsg, &CmConnection) + Send + Sync>;

/// Dispatch table keyed by message type.
#[derive(Clone, Default)]
pub struct MessageRouter {
    routes: HashMap<MsgType, Vec<RouteFn>>,
}

impl MessageRouter {
    /// Empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route for `msg_type`.
    pub fn route<F>(mut self, msg_type: MsgType, f: F) -> Self
    where
        F: Fn(&PacketMsg, &CmConnection) + Send + Sync + 'static,
    {
        self.routes.entry(msg_type).or_default().push(Arc::new(f));
        self
    }

    /// Adds an already shared route for `msg_type`.
    pub fn route_shared(mut self, msg_type: MsgType, f: RouteFn) -> Self {
        self.routes.entry(msg_type).or_default().push(f);
        self
    }

    /// Whether anything is routed for `msg_type`.
    pub fn handles(&self, msg_type: MsgType) -> bool {
        self.routes.contains_key(&msg_type)
    }

    /// Message types with at least one route.
    pub fn message_types(&self) -> Vec<MsgType> {
        let mut types: Vec<MsgType> = self.routes.keys().copied().collect();
        types.sort();
        types
    }

    /// Runs every route for the packet's type. Returns false when none is registered.
    ///
    /// A panicking route is logged and does not stop the remaining routes.
    pub fn dispatch(&self, packet: &PacketMsg, conn: &CmConnection) -> bool {
        let Some(routes) = self.routes.get(&packet.msg_type) else {
            return false;
        };
        for route in routes {
            if catch_unwind(AssertUnwindSafe(|| route(packet, conn))).is_err() {
                error!(msg = %packet.msg_type, "message route panicked");
            }
        }
        true
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("message_types", &self.message_types())
            .finish()
    }
}

/// Observes raw messages crossing the wire, after decryption and before encryption.
pub trait NetworkListener: Send + Sync {
    /// A message was received.
    fn on_incoming(&self, msg_type: MsgType, data: &[u8]);

    /// A message is about to be sent.
    fn on_outgoing(&self, msg_type: MsgType, data: &[u8]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_routes_run_in_order_and_survive_panics() {
        let hits = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let h1 = hits.clone();
        let h2 = hits.clone();
        let router = MessageRouter::new()
            .route(MsgType::CLIENT_CM_LIST, move |_, _| h1.lock().push(1))
            .route(MsgType::CLIENT_CM_LIST, |_, _| panic!("boom"))
            .route(MsgType::CLIENT_CM_LIST, move |_, _| h2.lock().push(3));
        let conn = CmConnection::builder(ConnectionConfig::default()).build();

        let packet = PacketMsg::new_proto(MsgType::CLIENT_CM_LIST, Bytes::new());
        assert!(router.dispatch(&packet, &conn));
        assert_eq!(*hits.lock(), vec![1, 3]);

        let other = PacketMsg::new_proto(MsgType::CLIENT_HELLO, Bytes::new());
        assert!(!router.dispatch(&other, &conn));
    }

    #[test]
    fn test_message_types_sorted() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let router = MessageRouter::new()
            .route(MsgType::CLIENT_SESSION_TOKEN, move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .route(MsgType::MULTI, |_, _| {});
        assert_eq!(
            router.message_types(),
            vec![MsgType::MULTI, MsgType::CLIENT_SESSION_TOKEN]
        );
        assert!(router.handles(MsgType::MULTI));
        assert!(!router.handles(MsgType::CLIENT_HELLO));
    }
}
