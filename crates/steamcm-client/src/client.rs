//! Client facade: a [`CmConnection`] wired to a [`CallbackManager`] and message handlers.
//!
//! The client handles the session messages itself (logon response, logoff, server
//! unavailable, session token, CM list) before any registered handler sees them, sends
//! `ClientHello` on every new session and posts lifecycle callbacks.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use steamcm_transport::protocol::CLIENT_PROTOCOL_VERSION;
use steamcm_transport::{
    CmConnection, ConnectionObserver, ConnectionState, JobId, MessageRouter, MsgType, MultiJob,
    NetworkListener, PacketMsg, ServerDirectory, ServerQuality, ServerRecord, SingleJob, SteamId,
    TransportKind,
};
use tracing::{debug, info, warn};

use crate::callback::CallbackManager;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::handler::{HandlerContext, MessageHandler};
use crate::msg::{
    ClientCmList, ClientHello, ClientLoggedOff, ClientLogonResponse, ClientSessionToken,
    IpAddressMsg, ProtoMsg,
};

/// Posted when a session is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedCallback {
    /// Server of the new session.
    pub server: ServerRecord,
}

/// Posted when a session ends, a connect attempt fails, or a user disconnect stops
/// connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectedCallback {
    /// Whether the application asked for it.
    pub user_initiated: bool,
}

/// Posted when the server sends a fresh CM list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmListCallback {
    /// Endpoints now in the directory.
    pub servers: Vec<ServerRecord>,
}

struct ClientObserver {
    callbacks: CallbackManager,
}

impl ConnectionObserver for ClientObserver {
    fn on_connected(&self, conn: &CmConnection, server: &ServerRecord) {
        let hello = ProtoMsg::new(
            MsgType::CLIENT_HELLO,
            ClientHello {
                protocol_version: Some(CLIENT_PROTOCOL_VERSION),
            },
        );
        if let Err(e) = conn.send(hello.into_packet()) {
            warn!(error = %e, "failed to queue ClientHello");
        }
        self.callbacks.post(ConnectedCallback {
            server: server.clone(),
        });
    }

    fn on_disconnected(&self, conn: &CmConnection, user_initiated: bool) {
        conn.attributes().clear_logon();
        self.callbacks.post(DisconnectedCallback { user_initiated });
    }
}

fn mark_current_bad(conn: &CmConnection) {
    if let Some(endpoint) = conn.current_endpoint() {
        conn.directory().mark(&endpoint, ServerQuality::Bad);
    }
}

pub(crate) fn handle_logon_response(packet: &PacketMsg, conn: &CmConnection) {
    if !packet.is_proto() {
        debug!("non-proto logon response, no logon was attempted on this session");
        return;
    }
    let msg = match ProtoMsg::<ClientLogonResponse>::decode(packet) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "undecodable logon response");
            return;
        }
    };
    let result = msg.body.result();
    if result.is_ok() {
        conn.attributes().update(|info| {
            info.steam_id = msg.header.steamid.map(SteamId);
            info.session_id = msg.header.client_sessionid;
            info.cell_id = msg.body.cell_id;
            info.public_ip = msg.body.public_ip.as_ref().and_then(IpAddressMsg::to_ip);
            info.ip_country_code = msg.body.ip_country_code.clone();
        });
        if let Some(interval) = msg.body.heartbeat_interval() {
            conn.set_heartbeat_interval(interval);
        }
        conn.set_logged_on(true);
        info!(steam_id = ?msg.header.steamid, cell_id = ?msg.body.cell_id, "logged on");
    } else {
        info!(result = %result, "logon rejected");
        if result.is_server_rejection() {
            mark_current_bad(conn);
        }
    }
}

pub(crate) fn handle_logged_off(packet: &PacketMsg, conn: &CmConnection) {
    conn.attributes().clear_logon();
    conn.set_logged_on(false);
    if !packet.is_proto() {
        return;
    }
    match ProtoMsg::<ClientLoggedOff>::decode(packet) {
        Ok(msg) => {
            let result = msg.body.result();
            info!(result = %result, "logged off by server");
            if result.is_server_rejection() {
                mark_current_bad(conn);
            }
        }
        Err(e) => warn!(error = %e, "undecodable logoff"),
    }
}

pub(crate) fn handle_server_unavailable(packet: &PacketMsg, conn: &CmConnection) {
    // jobid_sent u64 | emsg_sent u32 | server_type i32
    let body = &packet.body;
    if body.len() >= 16 {
        let emsg_sent = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
        let server_type = i32::from_le_bytes([body[12], body[13], body[14], body[15]]);
        debug!(
            server_type,
            request = %MsgType::from_raw(emsg_sent).0,
            "server type unavailable for request"
        );
    }
    conn.disconnect(false);
}

pub(crate) fn handle_session_token(packet: &PacketMsg, conn: &CmConnection) {
    match ProtoMsg::<ClientSessionToken>::decode(packet) {
        Ok(msg) => {
            let token = msg.body.token;
            conn.attributes().update(|info| info.session_token = token);
        }
        Err(e) => warn!(error = %e, "undecodable session token"),
    }
}

fn cm_list_records(list: &ClientCmList) -> Vec<ServerRecord> {
    let mut records = Vec::with_capacity(list.cm_addresses.len() + list.cm_websocket_addresses.len());
    for (addr, port) in list.cm_addresses.iter().zip(&list.cm_ports) {
        let Ok(port) = u16::try_from(*port) else {
            continue;
        };
        records.push(ServerRecord::new(
            IpAddr::V4(Ipv4Addr::from(*addr)).to_string(),
            port,
            TransportKind::Tcp,
        ));
    }
    for endpoint in &list.cm_websocket_addresses {
        match ServerRecord::parse(endpoint, TransportKind::WebSocket) {
            Ok(record) => records.push(record),
            Err(_) => records.push(ServerRecord::new(endpoint.clone(), 443, TransportKind::WebSocket)),
        }
    }
    records
}

pub(crate) fn handle_cm_list(packet: &PacketMsg, conn: &CmConnection, callbacks: &CallbackManager) {
    let msg = match ProtoMsg::<ClientCmList>::decode(packet) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "undecodable CM list");
            return;
        }
    };
    let records = cm_list_records(&msg.body);
    if records.is_empty() {
        debug!("empty CM list ignored");
        return;
    }
    info!(count = records.len(), "received CM list");
    conn.directory().replace(records.clone());
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        let directory = conn.directory().clone();
        runtime.spawn(async move {
            if let Err(e) = directory.persist().await {
                warn!(error = %e, "failed to persist CM list");
            }
        });
    }
    callbacks.post(CmListCallback { servers: records });
}

fn builtin_routes(callbacks: &CallbackManager) -> MessageRouter {
    let cm_list_callbacks = callbacks.clone();
    MessageRouter::new()
        .route(MsgType::CLIENT_LOG_ON_RESPONSE, handle_logon_response)
        .route(MsgType::CLIENT_LOGGED_OFF, handle_logged_off)
        .route(MsgType::CLIENT_SERVER_UNAVAILABLE, handle_server_unavailable)
        .route(MsgType::CLIENT_SESSION_TOKEN, handle_session_token)
        .route(MsgType::CLIENT_CM_LIST, move |packet, conn| {
            handle_cm_list(packet, conn, &cm_list_callbacks)
        })
}

/// Builder for [`CmClient`].
pub struct CmClientBuilder {
    config: ClientConfig,
    handlers: Vec<Arc<dyn MessageHandler>>,
    listener: Option<Arc<dyn NetworkListener>>,
    directory: Option<Arc<ServerDirectory>>,
    callbacks: CallbackManager,
}

impl CmClientBuilder {
    /// Registers a message handler. Handlers run in registration order.
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Sets a raw message listener.
    pub fn with_listener(mut self, listener: Arc<dyn NetworkListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Uses `directory` instead of the one described by the config.
    pub fn with_directory(mut self, directory: Arc<ServerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Posts to an existing callback manager.
    pub fn with_callbacks(mut self, callbacks: CallbackManager) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Builds the client. Fails only on an invalid config.
    pub fn build(self) -> Result<CmClient> {
        let connection_config = self.config.connection_config()?;
        let directory = self
            .directory
            .unwrap_or_else(|| self.config.server_directory());
        let callbacks = self.callbacks;

        let mut router = builtin_routes(&callbacks);
        for handler in self.handlers {
            for msg_type in handler.message_types() {
                let handler = handler.clone();
                let callbacks = callbacks.clone();
                router = router.route(msg_type, move |packet, conn| {
                    let ctx = HandlerContext::new(conn, &callbacks);
                    if let Err(e) = handler.handle_msg(packet, &ctx) {
                        warn!(msg = %packet.msg_type, error = %e, "message handler failed");
                    }
                });
            }
        }

        let mut builder = CmConnection::builder(connection_config)
            .directory(directory)
            .router(router)
            .observer(Arc::new(ClientObserver {
                callbacks: callbacks.clone(),
            }));
        if let Some(listener) = self.listener {
            builder = builder.listener(listener);
        }

        Ok(CmClient {
            conn: builder.build(),
            callbacks,
        })
    }
}

/// A CM client: connection, callbacks and session state.
#[derive(Debug, Clone)]
pub struct CmClient {
    conn: CmConnection,
    callbacks: CallbackManager,
}

impl CmClient {
    /// Starts building a client.
    pub fn builder(config: ClientConfig) -> CmClientBuilder {
        CmClientBuilder {
            config,
            handlers: Vec::new(),
            listener: None,
            directory: None,
            callbacks: CallbackManager::new(),
        }
    }

    /// Connects to the best known server. See [`CmConnection::connect`].
    pub async fn connect(&self) {
        self.conn.connect().await;
    }

    /// Connects to `server` first.
    pub async fn connect_to(&self, server: ServerRecord) {
        self.conn.connect_to(server).await;
    }

    /// Ends the session without reconnecting. Does not wait.
    pub fn disconnect(&self) {
        self.conn.disconnect(true);
    }

    /// Ends the session and waits for the worker to stop.
    pub async fn shutdown(&self) {
        self.conn.shutdown().await;
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

    /// Sends a job and waits up to `timeout` for its response.
    pub async fn call(&self, packet: PacketMsg, timeout: Duration) -> Result<PacketMsg> {
        let job = self.send_job(packet)?;
        Ok(job.wait_timeout(timeout).await?)
    }

    /// Callback manager the client posts to.
    pub fn callbacks(&self) -> &CallbackManager {
        &self.callbacks
    }

    /// Underlying connection.
    pub fn connection(&self) -> &CmConnection {
        &self.conn
    }

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Whether messages can be sent.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Server of the current session.
    pub fn current_endpoint(&self) -> Option<ServerRecord> {
        self.conn.current_endpoint()
    }

    /// Logged-on account.
    pub fn steam_id(&self) -> Option<SteamId> {
        self.conn.attributes().steam_id()
    }

    /// Session id of the logon.
    pub fn session_id(&self) -> Option<i32> {
        self.conn.attributes().session_id()
    }

    /// Recommended cell id.
    pub fn cell_id(&self) -> Option<u32> {
        self.conn.attributes().cell_id()
    }

    /// Public IP reported at logon.
    pub fn public_ip(&self) -> Option<IpAddr> {
        self.conn.attributes().public_ip()
    }

    /// Country code reported at logon.
    pub fn ip_country_code(&self) -> Option<String> {
        self.conn.attributes().ip_country_code()
    }

    /// Last session token.
    pub fn session_token(&self) -> Option<u64> {
        self.conn.attributes().session_token()
    }

    /// Allocates a job id.
    pub fn next_job_id(&self) -> JobId {
        self.conn.jobs().next_job_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerListSource;
    use bytes::Bytes;
    use steamcm_transport::EResult;

    fn offline_client() -> CmClient {
        let config = ClientConfig {
            server_list: ServerListSource::Static,
            ..ClientConfig::default()
        };
        CmClient::builder(config).build().unwrap()
    }

    fn logon_response(result: EResult) -> PacketMsg {
        let mut msg = ProtoMsg::new(
            MsgType::CLIENT_LOG_ON_RESPONSE,
            ClientLogonResponse {
                eresult: Some(result.0),
                legacy_out_of_game_heartbeat_seconds: Some(9),
                cell_id: Some(25),
                public_ip: Some(IpAddressMsg::from_ip("198.51.100.4".parse().unwrap())),
                ip_country_code: Some("SE".into()),
                ..Default::default()
            },
        );
        msg.header.steamid = Some(76561197960287930);
        msg.header.client_sessionid = Some(1234);
        msg.into_packet()
    }

    #[test]
    fn test_logon_response_populates_attributes() {
        let client = offline_client();
        handle_logon_response(&logon_response(EResult::OK), client.connection());
        assert_eq!(client.steam_id(), Some(SteamId(76561197960287930)));
        assert_eq!(client.session_id(), Some(1234));
        assert_eq!(client.cell_id(), Some(25));
        assert_eq!(client.public_ip(), Some("198.51.100.4".parse().unwrap()));
        assert_eq!(client.ip_country_code().as_deref(), Some("SE"));
        assert_eq!(client.connection().heartbeat_interval(), Duration::from_secs(9));
        // Not connected, so the state stays put.
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_failed_logon_leaves_attributes_empty() {
        let client = offline_client();
        handle_logon_response(&logon_response(EResult::INVALID_PASSWORD), client.connection());
        assert_eq!(client.steam_id(), None);

        let legacy = PacketMsg::new_struct(MsgType::CLIENT_LOG_ON_RESPONSE, Bytes::new());
        handle_logon_response(&legacy, client.connection());
        assert_eq!(client.session_id(), None);
    }

    #[test]
    fn test_logged_off_and_session_token() {
        let client = offline_client();
        handle_logon_response(&logon_response(EResult::OK), client.connection());
        let token = ProtoMsg::new(MsgType::CLIENT_SESSION_TOKEN, ClientSessionToken { token: Some(42) });
        handle_session_token(&token.into_packet(), client.connection());
        assert_eq!(client.session_token(), Some(42));

        let off = ProtoMsg::new(
            MsgType::CLIENT_LOGGED_OFF,
            ClientLoggedOff {
                eresult: Some(EResult::TRY_ANOTHER_CM.0),
            },
        );
        handle_logged_off(&off.into_packet(), client.connection());
        assert_eq!(client.steam_id(), None);
        assert_eq!(client.cell_id(), None);
        assert_eq!(client.session_token(), Some(42));
    }

    #[test]
    fn test_cm_list_replaces_directory_and_posts() {
        let client = offline_client();
        let list = ProtoMsg::new(
            MsgType::CLIENT_CM_LIST,
            ClientCmList {
                cm_addresses: vec![u32::from(Ipv4Addr::new(10, 1, 2, 3))],
                cm_ports: vec![27017],
                cm_websocket_addresses: vec!["cm1.example.net:443".into(), "cm2.example.net".into()],
            },
        );
        handle_cm_list(&list.into_packet(), client.connection(), client.callbacks());

        let expected = vec![
            ServerRecord::new("10.1.2.3", 27017, TransportKind::Tcp),
            ServerRecord::new("cm1.example.net", 443, TransportKind::WebSocket),
            ServerRecord::new("cm2.example.net", 443, TransportKind::WebSocket),
        ];
        assert_eq!(client.connection().directory().records(), expected);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = client
            .callbacks()
            .subscribe::<CmListCallback, _>(move |cb| s.lock().push(cb.servers.len()));
        client.callbacks().run_pending().unwrap();
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn test_send_offline_fails() {
        let client = offline_client();
        let packet = PacketMsg::new_proto(MsgType::CLIENT_HELLO, Bytes::new());
        assert!(client.send(packet).is_err());
        assert_ne!(client.next_job_id(), client.next_job_id());
    }
}
