//! Connection core: one long-lived worker per CM connection.
//!
//! [`CmConnection`] is a cheap, cloneable handle. `connect` spawns a worker task that
//! picks a server from the [`ServerDirectory`], dials it, runs the channel handshake on
//! TCP, and then multiplexes four event sources until the session ends:
//!
//! - control requests (disconnect),
//! - inbound frames, decrypted and routed to the job registry or the [`MessageRouter`],
//! - the outbound queue fed by [`CmConnection::send`] and friends,
//! - the heartbeat ticker.
//!
//! When a session ends without a user request, pending jobs are failed, the server is
//! marked bad and the worker reconnects according to the [`ReconnectPolicy`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use crate::crypto::{ChannelCipher, ChannelNegotiator, UniverseKey};
use crate::discovery::{
    DirectoryConfig, MemoryServerListProvider, ServerDirectory, ServerQuality, ServerRecord,
    TransportKind,
};
use crate::dispatch::{MessageRouter, NetworkListener};
use crate::error::{Result, TransportError};
use crate::identity::SessionAttributes;
use crate::jobs::{CancelReason, JobRegistry, MultiJob, Resolution, SingleJob};
use crate::keepalive::{heartbeat_packet, HeartbeatConfig, HeartbeatStats, HeartbeatTracker};
use crate::message::{decode_message, unpack_multi, PacketMsg};
use crate::protocol::{MsgType, Universe};
use crate::retry::ReconnectPolicy;
use crate::tcp::TcpTransportConfig;
use crate::transport::{Connection, TransportFactory};
use crate::websocket::WebSocketConfig;

/// Configuration of one CM connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP transport settings.
    pub tcp: TcpTransportConfig,
    /// WebSocket transport settings.
    pub websocket: WebSocketConfig,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect behaviour after non-user disconnects.
    pub reconnect: ReconnectPolicy,
    /// Deadline for the channel handshake after the socket is up (default: 10s).
    pub handshake_timeout: Duration,
    /// Universe this client belongs to.
    pub universe: Universe,
    /// Public key used to wrap the session key. Defaults to the universe's built-in key.
    pub universe_key: Option<UniverseKey>,
    /// Transport kinds to try, in order of preference.
    pub protocols: Vec<TransportKind>,
    /// Name recorded on the connection's tracing span.
    pub name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tcp: TcpTransportConfig::default(),
            websocket: WebSocketConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            universe: Universe::Public,
            universe_key: None,
            protocols: vec![TransportKind::Tcp, TransportKind::WebSocket],
            name: "default".to_string(),
        }
    }
}

impl ConnectionConfig {
    fn resolved_universe_key(&self) -> Result<UniverseKey> {
        match &self.universe_key {
            Some(key) => Ok(key.clone()),
            None => UniverseKey::for_universe(self.universe),
        }
    }

    fn candidate_kinds(&self) -> Vec<TransportKind> {
        self.protocols
            .iter()
            .copied()
            .filter(|kind| TransportFactory::supported_kinds().contains(kind))
            .collect()
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket and no attempt in progress.
    Disconnected,
    /// Picking a server or dialing it.
    Connecting,
    /// Socket is up, channel handshake in progress.
    AwaitingHandshake,
    /// Channel is ready; messages can be sent.
    Connected,
    /// Connected and the logon was accepted.
    LoggedOn,
}

impl ConnectionState {
    /// Whether messages can be sent in this state.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::LoggedOn)
    }
}

/// Lifecycle notifications, invoked on the connection worker.
pub trait ConnectionObserver: Send + Sync {
    /// A session is established and messages can be sent.
    fn on_connected(&self, _conn: &CmConnection, _server: &ServerRecord) {}

    /// An established session ended, a connect attempt failed, or a user disconnect
    /// arrived while no session existed.
    fn on_disconnected(&self, _conn: &CmConnection, _user_initiated: bool) {}
}

enum Control {
    Disconnect { user_initiated: bool },
}

enum Attempt {
    Established(Session),
    Failed,
    Interrupted { user_initiated: bool },
}

struct Session {
    record: ServerRecord,
    conn: Box<dyn Connection>,
    cipher: Option<ChannelCipher>,
}

struct Inner {
    config: ConnectionConfig,
    transports: TransportFactory,
    directory: Arc<ServerDirectory>,
    router: MessageRouter,
    observer: Option<Arc<dyn ConnectionObserver>>,
    listener: Option<Arc<dyn NetworkListener>>,
    attributes: SessionAttributes,
    jobs: JobRegistry,
    heartbeat: HeartbeatTracker,
    state: watch::Sender<ConnectionState>,
    heartbeat_interval: watch::Sender<Duration>,
    // Cleared before pending jobs are failed, so a job is either registered while the
    // sender is present or rejected with NotConnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<PacketMsg>>>,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    endpoint: Mutex<Option<ServerRecord>>,
    span: tracing::Span,
}

/// Builder for [`CmConnection`].
pub struct CmConnectionBuilder {
    config: ConnectionConfig,
    directory: Option<Arc<ServerDirectory>>,
    router: MessageRouter,
    observer: Option<Arc<dyn ConnectionObserver>>,
    listener: Option<Arc<dyn NetworkListener>>,
    attributes: SessionAttributes,
    jobs: JobRegistry,
}

impl CmConnectionBuilder {
    /// Server directory to pick endpoints from. Defaults to an empty in-memory list.
    pub fn directory(mut self, directory: Arc<ServerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Dispatch table for inbound messages that answer no job.
    pub fn router(mut self, router: MessageRouter) -> Self {
        self.router = router;
        self
    }

    /// Lifecycle observer.
    pub fn observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Raw message listener.
    pub fn listener(mut self, listener: Arc<dyn NetworkListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Shares session attributes with another component.
    pub fn attributes(mut self, attributes: SessionAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Shares a job registry with another component.
    pub fn jobs(mut self, jobs: JobRegistry) -> Self {
        self.jobs = jobs;
        self
    }

    /// Builds the connection in the `Disconnected` state.
    pub fn build(self) -> CmConnection {
        let directory = self.directory.unwrap_or_else(|| {
            Arc::new(ServerDirectory::new(
                Arc::new(MemoryServerListProvider::default()),
                DirectoryConfig::default(),
            ))
        });
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (heartbeat_interval, _) = watch::channel(self.config.heartbeat.interval());
        let span = tracing::info_span!("cm_connection", name = %self.config.name);
        CmConnection {
            inner: Arc::new(Inner {
                transports: TransportFactory::new(
                    self.config.tcp.clone(),
                    self.config.websocket.clone(),
                ),
                config: self.config,
                directory,
                router: self.router,
                observer: self.observer,
                listener: self.listener,
                attributes: self.attributes,
                jobs: self.jobs,
                heartbeat: HeartbeatTracker::new(),
                state,
                heartbeat_interval,
                outbound: Mutex::new(None),
                control: Mutex::new(None),
                worker: Mutex::new(None),
                endpoint: Mutex::new(None),
                span,
            }),
        }
    }
}

/// Handle to a CM connection and its worker task.
#[derive(Clone)]
pub struct CmConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmConnection")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .field("endpoint", &self.current_endpoint())
            .finish()
    }
}

impl CmConnection {
    /// Starts building a connection.
    pub fn builder(config: ConnectionConfig) -> CmConnectionBuilder {
        CmConnectionBuilder {
            config,
            directory: None,
            router: MessageRouter::new(),
            observer: None,
            listener: None,
            attributes: SessionAttributes::new(),
            jobs: JobRegistry::new(),
        }
    }

    /// Starts the worker, which connects to the best directory candidate.
    ///
    /// Returns once the worker is running; watch [`CmConnection::subscribe_state`] or the
    /// observer for the outcome. An existing worker is shut down first.
    pub async fn connect(&self) {
        self.start(None).await;
    }

    /// Like [`CmConnection::connect`], but the first attempt goes to `server`.
    pub async fn connect_to(&self, server: ServerRecord) {
        self.start(Some(server)).await;
    }

    async fn start(&self, pinned: Option<ServerRecord>) {
        self.shutdown().await;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.control.lock() = Some(tx);
        self.set_state(ConnectionState::Connecting);
        let worker = self.clone();
        let handle = tokio::spawn(
            async move { worker.run_worker(rx, pinned).await }.instrument(self.inner.span.clone()),
        );
        *self.inner.worker.lock() = Some(handle);
    }

    /// Asks the worker to end the session. Does not wait.
    ///
    /// A user-initiated disconnect stops the worker. Otherwise the worker reconnects per
    /// the reconnect policy, which is how a server redirect is acted upon.
    pub fn disconnect(&self, user_initiated: bool) {
        if let Some(control) = self.inner.control.lock().as_ref() {
            let _ = control.send(Control::Disconnect { user_initiated });
        }
    }

    /// Disconnects and waits for the worker to finish.
    pub async fn shutdown(&self) {
        self.disconnect(true);
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(name = %self.inner.config.name, "connection worker panicked");
                }
            }
        }
        *self.inner.control.lock() = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Queues a message. Fails with `NotConnected` unless a session is established.
    pub fn send(&self, packet: PacketMsg) -> Result<()> {
        let outbound = self.inner.outbound.lock();
        let tx = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(packet).map_err(|_| TransportError::NotConnected)
    }

    /// Queues a message as a new job expecting exactly one response.
    pub fn send_job(&self, mut packet: PacketMsg) -> Result<SingleJob> {
        let job = self.inner.jobs.next_job_id();
        packet.header.set_source_job(job);
        let outbound = self.inner.outbound.lock();
        let tx = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        let handle = self.inner.jobs.register_single(job);
        tx.send(packet).map_err(|_| TransportError::NotConnected)?;
        Ok(handle)
    }

    /// Queues a message as a new job answered by several responses. The job completes
    /// after the first response for which `terminal` returns true.
    pub fn send_job_multiple<F>(&self, mut packet: PacketMsg, terminal: F) -> Result<MultiJob>
    where
        F: Fn(&PacketMsg) -> bool + Send + Sync + 'static,
    {
        let job = self.inner.jobs.next_job_id();
        packet.header.set_source_job(job);
        let outbound = self.inner.outbound.lock();
        let tx = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        let handle = self.inner.jobs.register_multiple(job, terminal);
        tx.send(packet).map_err(|_| TransportError::NotConnected)?;
        Ok(handle)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether messages can currently be sent.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Waits until `pred` holds for the state, for at most `timeout`.
    pub async fn wait_for_state<F>(&self, timeout: Duration, pred: F) -> Option<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.subscribe_state();
        let state = match tokio::time::timeout(timeout, rx.wait_for(pred)).await {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        };
        state
    }

    /// Server of the established session, if any.
    pub fn current_endpoint(&self) -> Option<ServerRecord> {
        self.inner.endpoint.lock().clone()
    }

    /// Moves between `Connected` and `LoggedOn`. Ignored in any other state.
    pub fn set_logged_on(&self, logged_on: bool) {
        self.inner.state.send_if_modified(|state| match (*state, logged_on) {
            (ConnectionState::Connected, true) => {
                *state = ConnectionState::LoggedOn;
                true
            }
            (ConnectionState::LoggedOn, false) => {
                *state = ConnectionState::Connected;
                true
            }
            _ => false,
        });
    }

    /// Changes the heartbeat interval of the current session.
    pub fn set_heartbeat_interval(&self, interval: Duration) {
        let interval = interval.max(Duration::from_millis(10));
        self.inner.heartbeat_interval.send_replace(interval);
    }

    /// Current heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        *self.inner.heartbeat_interval.borrow()
    }

    /// Heartbeat counters of the current session.
    pub fn heartbeat_stats(&self) -> HeartbeatStats {
        self.inner.heartbeat.stats()
    }

    /// Job registry used for responses.
    pub fn jobs(&self) -> &JobRegistry {
        &self.inner.jobs
    }

    /// Server directory used for endpoint selection.
    pub fn directory(&self) -> &Arc<ServerDirectory> {
        &self.inner.directory
    }

    /// Session attributes stamped onto outgoing messages.
    pub fn attributes(&self) -> &SessionAttributes {
        &self.inner.attributes
    }

    /// Connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(from = ?*state, to = ?next, "connection state changed");
            *state = next;
            true
        });
    }

    fn notify_disconnected(&self, user_initiated: bool) {
        self.set_state(ConnectionState::Disconnected);
        if let Some(observer) = &self.inner.observer {
            observer.on_disconnected(self, user_initiated);
        }
    }

    async fn run_worker(self, mut control: mpsc::UnboundedReceiver<Control>, mut pinned: Option<ServerRecord>) {
        let policy = self.inner.config.reconnect.clone();
        let mut failures: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.establish(&mut control, pinned.take()).await {
                Attempt::Interrupted {
                    user_initiated: true,
                } => {
                    self.notify_disconnected(true);
                    break;
                }
                Attempt::Interrupted {
                    user_initiated: false,
                } => {
                    debug!("connect attempt abandoned, moving to the next server");
                    failures = failures.saturating_add(1);
                    self.notify_disconnected(false);
                }
                Attempt::Failed => {
                    failures = failures.saturating_add(1);
                    self.notify_disconnected(false);
                }
                Attempt::Established(session) => {
                    failures = 0;
                    if self.run_session(session, &mut control).await {
                        break;
                    }
                }
            }

            if !policy.should_retry(failures) {
                if failures > 0 {
                    warn!(failures, "giving up on connecting");
                }
                break;
            }

            let delay = policy.backoff(failures.saturating_sub(1));
            debug!(delay_ms = delay.as_millis() as u64, failures, "reconnecting after backoff");
            self.set_state(ConnectionState::Disconnected);
            let stop = tokio::select! {
                biased;
                request = control.recv() => match request {
                    Some(Control::Disconnect { user_initiated: false }) => {
                        debug!("backoff cut short");
                        false
                    }
                    _ => true,
                },
                _ = tokio::time::sleep(delay) => false,
            };
            if stop {
                self.notify_disconnected(true);
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        debug!("connection worker stopped");
    }

    async fn establish(
        &self,
        control: &mut mpsc::UnboundedReceiver<Control>,
        pinned: Option<ServerRecord>,
    ) -> Attempt {
        tokio::select! {
            biased;
            request = control.recv() => Attempt::Interrupted {
                user_initiated: match request {
                    Some(Control::Disconnect { user_initiated }) => user_initiated,
                    None => true,
                },
            },
            result = self.dial(pinned) => match result {
                Ok(session) => Attempt::Established(session),
                Err(e) => {
                    warn!(error = %e, "connection attempt failed");
                    Attempt::Failed
                }
            },
        }
    }

    async fn pick_server(&self) -> Option<ServerRecord> {
        let kinds = self.inner.config.candidate_kinds();
        if let Some(record) = self.inner.directory.next_candidate(&kinds) {
            return Some(record);
        }
        match self.inner.directory.refresh().await {
            Ok(count) => debug!(count, "refreshed server list"),
            Err(e) => warn!(error = %e, "failed to refresh server list"),
        }
        self.inner.directory.next_candidate(&kinds)
    }

    async fn dial(&self, pinned: Option<ServerRecord>) -> Result<Session> {
        let record = match pinned {
            Some(record) => record,
            None => self
                .pick_server()
                .await
                .ok_or_else(|| TransportError::Directory("no CM servers available".into()))?,
        };
        debug!(server = %record, "dialing");

        let conn = match self.inner.transports.connect(&record).await {
            Ok(conn) => conn,
            Err(e) => {
                self.inner.directory.mark(&record, ServerQuality::Bad);
                return Err(e);
            }
        };

        let cipher = if conn.requires_channel_encryption() {
            self.set_state(ConnectionState::AwaitingHandshake);
            let timeout = self.inner.config.handshake_timeout;
            let outcome = match tokio::time::timeout(timeout, self.negotiate(conn.as_ref())).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Handshake {
                    reason: format!("no result within {}ms", timeout.as_millis()),
                }),
            };
            match outcome {
                Ok(cipher) => Some(cipher),
                Err(e) => {
                    conn.close().await;
                    self.inner.directory.mark(&record, ServerQuality::Bad);
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Session {
            record,
            conn,
            cipher,
        })
    }

    async fn negotiate(&self, conn: &dyn Connection) -> Result<ChannelCipher> {
        let config = &self.inner.config;
        let mut negotiator = ChannelNegotiator::new(config.universe, config.resolved_universe_key()?);
        negotiator.start();
        loop {
            let frame = conn.recv_frame().await?;
            let packet = decode_message(&frame)?;
            if let Some(listener) = &self.inner.listener {
                listener.on_incoming(packet.msg_type, &frame);
            }
            match packet.msg_type {
                MsgType::CHANNEL_ENCRYPT_REQUEST => {
                    let reply = negotiator.handle_challenge(&packet)?.encode();
                    if let Some(listener) = &self.inner.listener {
                        listener.on_outgoing(MsgType::CHANNEL_ENCRYPT_RESPONSE, &reply);
                    }
                    conn.send_frame(&reply).await?;
                }
                MsgType::CHANNEL_ENCRYPT_RESULT => return negotiator.handle_result(&packet),
                other => debug!(msg = %other, "ignoring message before channel is encrypted"),
            }
        }
    }

    /// Runs an established session to its end. Returns whether the end was user-initiated.
    async fn run_session(&self, session: Session, control: &mut mpsc::UnboundedReceiver<Control>) -> bool {
        let Session {
            record,
            conn,
            cipher,
        } = session;

        self.inner.heartbeat.reset();
        self.inner
            .heartbeat_interval
            .send_replace(self.inner.config.heartbeat.interval());
        let (tx, mut outbound) = mpsc::unbounded_channel();
        *self.inner.outbound.lock() = Some(tx);
        *self.inner.endpoint.lock() = Some(record.clone());
        self.set_state(ConnectionState::Connected);
        self.inner.directory.mark(&record, ServerQuality::Good);
        info!(server = %record, kind = %record.kind, encrypted = cipher.is_some(), "connected");
        if let Some(observer) = &self.inner.observer {
            observer.on_connected(self, &record);
        }

        let user_initiated = self
            .pump(conn.as_ref(), cipher.as_ref(), &mut outbound, control)
            .await;

        self.inner.outbound.lock().take();
        self.set_state(ConnectionState::Disconnected);
        let cancelled = self.inner.jobs.cancel_all(CancelReason::Disconnected);
        conn.close().await;
        self.inner.endpoint.lock().take();
        self.inner.attributes.clear_logon();
        if !user_initiated {
            self.inner.directory.mark(&record, ServerQuality::Bad);
        }
        info!(server = %record, user_initiated, cancelled_jobs = cancelled, "disconnected");
        if let Some(observer) = &self.inner.observer {
            observer.on_disconnected(self, user_initiated);
        }
        user_initiated
    }

    async fn pump(
        &self,
        conn: &dyn Connection,
        cipher: Option<&ChannelCipher>,
        outbound: &mut mpsc::UnboundedReceiver<PacketMsg>,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> bool {
        let heartbeat_enabled = self.inner.config.heartbeat.enabled;
        let mut interval_rx = self.inner.heartbeat_interval.subscribe();
        let mut ticker = heartbeat_ticker(*interval_rx.borrow_and_update());

        loop {
            tokio::select! {
                biased;
                request = control.recv() => {
                    return match request {
                        Some(Control::Disconnect { user_initiated }) => user_initiated,
                        None => true,
                    };
                }
                frame = conn.recv_frame() => match frame {
                    Ok(frame) => {
                        if let Err(e) = self.handle_frame(frame, cipher) {
                            warn!(error = %e, "dropping connection after bad inbound frame");
                            return false;
                        }
                    }
                    Err(TransportError::ConnectionReset) => {
                        info!("connection closed by server");
                        return false;
                    }
                    Err(e) => {
                        warn!(error = %e, "receive failed");
                        return false;
                    }
                },
                Some(packet) = outbound.recv() => {
                    if let Err(e) = self.write_packet(conn, cipher, packet).await {
                        warn!(error = %e, "send failed");
                        return false;
                    }
                }
                _ = ticker.tick(), if heartbeat_enabled => {
                    if let Err(e) = self.write_packet(conn, cipher, heartbeat_packet()).await {
                        warn!(error = %e, "heartbeat failed");
                        return false;
                    }
                    self.inner.heartbeat.record_sent();
                }
                Ok(()) = interval_rx.changed() => {
                    let period = *interval_rx.borrow_and_update();
                    debug!(interval_ms = period.as_millis() as u64, "heartbeat interval changed");
                    ticker = heartbeat_ticker(period);
                }
            }
        }
    }

    fn handle_frame(&self, frame: Vec<u8>, cipher: Option<&ChannelCipher>) -> Result<()> {
        self.inner.heartbeat.record_received();
        let plain = match cipher {
            Some(cipher) => cipher.decrypt(&frame)?,
            None => frame,
        };
        match decode_message(&plain) {
            Ok(packet) => self.process(packet, &plain),
            Err(e) => warn!(error = %e, len = plain.len(), "dropping undecodable message"),
        }
        Ok(())
    }

    fn process(&self, packet: PacketMsg, raw: &[u8]) {
        if packet.msg_type == MsgType::MULTI {
            let parts = match unpack_multi(&packet) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(error = %e, "dropping multi message");
                    return;
                }
            };
            for part in parts {
                match decode_message(&part) {
                    Ok(inner) => self.process(inner, &part),
                    Err(e) => warn!(error = %e, "dropping undecodable message inside multi"),
                }
            }
            return;
        }

        if let Some(listener) = &self.inner.listener {
            listener.on_incoming(packet.msg_type, raw);
        }

        let target = packet.target_job();
        if !target.is_none() {
            let msg_type = packet.msg_type;
            if self.inner.jobs.resolve(target, packet) == Resolution::Unknown {
                debug!(job = %target, msg = %msg_type, "response for unknown job dropped");
            }
            return;
        }

        if !self.inner.router.dispatch(&packet, self) {
            debug!(msg = %packet.msg_type, "no route for message");
        }
    }

    async fn write_packet(
        &self,
        conn: &dyn Connection,
        cipher: Option<&ChannelCipher>,
        mut packet: PacketMsg,
    ) -> Result<()> {
        if let Some(header) = packet.proto_header_mut() {
            let info = self.inner.attributes.snapshot();
            if let Some(steam_id) = info.steam_id {
                header.steamid = Some(steam_id.0);
            }
            if let Some(session_id) = info.session_id {
                header.client_sessionid = Some(session_id);
            }
        }
        let bytes = packet.encode();
        if let Some(listener) = &self.inner.listener {
            listener.on_outgoing(packet.msg_type, &bytes);
        }
        let wire = match cipher {
            Some(cipher) => cipher.encrypt(&bytes)?,
            None => bytes,
        };
        conn.send_frame(&wire).await
    }
}

fn heartbeat_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpTransport;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        connected: AtomicUsize,
        disconnected: Mutex<Vec<bool>>,
    }

    impl ConnectionObserver for CountingObserver {
        fn on_connected(&self, _conn: &CmConnection, _server: &ServerRecord) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnected(&self, _conn: &CmConnection, user_initiated: bool) {
            self.disconnected.lock().push(user_initiated);
        }
    }

    fn quick_config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect: ReconnectPolicy::disabled(),
            handshake_timeout: Duration::from_millis(200),
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let conn = CmConnection::builder(ConnectionConfig::default()).build();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let packet = PacketMsg::new_proto(MsgType::CLIENT_HELLO, Bytes::new());
        assert!(matches!(conn.send(packet.clone()), Err(TransportError::NotConnected)));
        assert!(matches!(conn.send_job(packet), Err(TransportError::NotConnected)));
        assert_eq!(conn.jobs().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_directory_gives_up_and_reports() {
        let observer = Arc::new(CountingObserver::default());
        let conn = CmConnection::builder(quick_config())
            .observer(observer.clone())
            .build();
        conn.connect().await;
        let state = conn
            .wait_for_state(Duration::from_secs(2), |s| *s == ConnectionState::Disconnected)
            .await;
        assert_eq!(state, Some(ConnectionState::Disconnected));
        conn.shutdown().await;
        assert_eq!(observer.connected.load(Ordering::SeqCst), 0);
        assert_eq!(*observer.disconnected.lock(), vec![false]);
    }

    #[tokio::test]
    async fn test_silent_server_fails_handshake_and_is_marked_bad() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let conn = TcpTransport::default().accept(&listener).await.unwrap();
            // Hold the socket open without sending a challenge.
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(conn);
        });

        let record = ServerRecord::new("127.0.0.1", addr.port(), TransportKind::Tcp);
        let other = ServerRecord::new("127.0.0.1", 1, TransportKind::Tcp);
        let conn = CmConnection::builder(quick_config()).build();
        conn.directory().replace(vec![record.clone(), other.clone()]);
        conn.connect().await;

        let mut states = conn.subscribe_state();
        let handshake = tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == ConnectionState::AwaitingHandshake),
        )
        .await;
        assert!(handshake.is_ok());

        let state = conn
            .wait_for_state(Duration::from_secs(2), |s| *s == ConnectionState::Disconnected)
            .await;
        assert_eq!(state, Some(ConnectionState::Disconnected));
        conn.shutdown().await;
        assert_eq!(conn.current_endpoint(), None);
        assert_eq!(conn.directory().next_candidate(&[TransportKind::Tcp]), Some(other));
        server.abort();
    }

    async fn wait_for_events(observer: &CountingObserver, count: usize) -> Vec<bool> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while observer.disconnected.lock().len() < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        observer.disconnected.lock().clone()
    }

    #[tokio::test]
    async fn test_handshake_interrupts_follow_user_flag() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok(conn) = TcpTransport::default().accept(&listener).await {
                held.push(conn);
                let _ = accepted_tx.send(held.len());
            }
        });

        let observer = Arc::new(CountingObserver::default());
        let config = ConnectionConfig {
            reconnect: ReconnectPolicy {
                initial_backoff_ms: 10,
                max_backoff_ms: 10,
                jitter: false,
                ..ReconnectPolicy::default()
            },
            handshake_timeout: Duration::from_secs(30),
            ..ConnectionConfig::default()
        };
        let conn = CmConnection::builder(config).observer(observer.clone()).build();
        let record = ServerRecord::new("127.0.0.1", port, TransportKind::Tcp);
        conn.directory().replace(vec![record]);
        conn.connect().await;

        let first = tokio::time::timeout(Duration::from_secs(2), accepted.recv()).await;
        assert_eq!(first.unwrap(), Some(1));
        conn.disconnect(false);
        let second = tokio::time::timeout(Duration::from_secs(2), accepted.recv()).await;
        assert_eq!(second.unwrap(), Some(2));
        assert_eq!(*observer.disconnected.lock(), vec![false]);

        conn.disconnect(true);
        assert_eq!(wait_for_events(&observer, 2).await, vec![false, true]);
        let state = conn
            .wait_for_state(Duration::from_secs(2), |s| *s == ConnectionState::Disconnected)
            .await;
        assert_eq!(state, Some(ConnectionState::Disconnected));
        conn.shutdown().await;
        assert_eq!(observer.connected.load(Ordering::SeqCst), 0);
        assert_eq!(*observer.disconnected.lock(), vec![false, true]);
        server.abort();
    }

    #[tokio::test]
    async fn test_user_disconnect_during_backoff_reports() {
        let observer = Arc::new(CountingObserver::default());
        let config = ConnectionConfig {
            reconnect: ReconnectPolicy {
                initial_backoff_ms: 60_000,
                max_backoff_ms: 60_000,
                jitter: false,
                ..ReconnectPolicy::default()
            },
            ..ConnectionConfig::default()
        };
        let conn = CmConnection::builder(config).observer(observer.clone()).build();
        conn.directory()
            .replace(vec![ServerRecord::new("127.0.0.1", 1, TransportKind::Tcp)]);
        conn.connect().await;

        assert_eq!(wait_for_events(&observer, 1).await, vec![false]);
        conn.disconnect(true);
        assert_eq!(wait_for_events(&observer, 2).await, vec![false, true]);
        tokio::time::timeout(Duration::from_secs(2), conn.shutdown())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_logged_on_only_from_connected() {
        let conn = CmConnection::builder(ConnectionConfig::default()).build();
        conn.set_logged_on(true);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.set_state(ConnectionState::Connected);
        conn.set_logged_on(true);
        assert_eq!(conn.state(), ConnectionState::LoggedOn);
        assert!(conn.is_connected());
        conn.set_logged_on(false);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_candidate_kinds_skip_udp() {
        let config = ConnectionConfig {
            protocols: vec![TransportKind::Udp, TransportKind::WebSocket],
            ..ConnectionConfig::default()
        };
        assert_eq!(config.candidate_kinds(), vec![TransportKind::WebSocket]);
    }

    #[test]
    fn test_heartbeat_interval_floor() {
        let conn = CmConnection::builder(ConnectionConfig::default()).build();
        assert_eq!(conn.heartbeat_interval(), Duration::from_secs(5));
        conn.set_heartbeat_interval(Duration::ZERO);
        assert_eq!(conn.heartbeat_interval(), Duration::from_millis(10));
    }
}
