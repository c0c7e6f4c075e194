//! Interface for service-specific message handlers.
//!
//! A handler names the message types it owns; the client routes every inbound message of
//! those types (that does not answer a pending job) to [`MessageHandler::handle_msg`] on
//! the connection worker. Handlers must not block: long work goes to a spawned task and
//! results reach the application through [`HandlerContext::post`].

use std::any::Any;

use steamcm_transport::{
    CmConnection, JobId, MsgType, MultiJob, PacketMsg, SessionAttributes, SingleJob, SteamId,
};

use crate::callback::CallbackManager;
use crate::error::Result;

/// A consumer of inbound messages.
pub trait MessageHandler: Send + Sync {
    /// Message types this handler owns.
    fn message_types(&self) -> Vec<MsgType>;

    /// Handles one message. Errors are logged; they do not affect the connection.
    fn handle_msg(&self, packet: &PacketMsg, ctx: &HandlerContext<'_>) -> Result<()>;
}

/// What a handler may do while handling a message.
pub struct HandlerContext<'a> {
    conn: &'a CmConnection,
    callbacks: &'a CallbackManager,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(conn: &'a CmConnection, callbacks: &'a CallbackManager) -> Self {
        Self { conn, callbacks }
    }

    /// Queues a message without a job.
    pub fn send(&self, packet: PacketMsg) -> Result<()> {
        Ok(self.conn.send(packet)?)
    }

    /// Queues a message as a job expecting one response.
    pub fn send_job(&self, packet: PacketMsg) -> Result<SingleJob> {
        Ok(self.conn.send_job(packet)?)
    }

    /// Queues a message as a job expecting a stream of responses.
    pub fn send_job_multiple<F>(&self, packet: PacketMsg, terminal: F) -> Result<MultiJob>
    where
        F: Fn(&PacketMsg) -> bool + Send + Sync + 'static,
    {
        Ok(self.conn.send_job_multiple(packet, terminal)?)
    }

    /// Posts an event to the application.
    pub fn post<T: Any + Send>(&self, event: T) {
        self.callbacks.post(event);
    }

    /// Allocates a job id without sending anything.
    pub fn next_job_id(&self) -> JobId {
        self.conn.jobs().next_job_id()
    }

    /// Session attributes, read-only.
    pub fn attributes(&self) -> &SessionAttributes {
        self.conn.attributes()
    }

    /// Logged-on account.
    pub fn steam_id(&self) -> Option<SteamId> {
        self.conn.attributes().steam_id()
    }

    /// Recommended cell id.
    pub fn cell_id(&self) -> Option<u32> {
        self.conn.attributes().cell_id()
    }

    /// Callback manager, for handlers that post from spawned tasks.
    pub fn callbacks(&self) -> &CallbackManager {
        self.callbacks
    }

    /// The underlying connection.
    pub fn connection(&self) -> &CmConnection {
        self.conn
    }
}
