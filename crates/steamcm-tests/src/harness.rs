//! Test Harness - mock CM servers and client test environment setup

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use steamcm_client::{CallbackManager, ClientConfig, ServerListSource, Subscription};
use steamcm_transport::crypto::{EncryptRequest, EncryptResponse, EncryptResult, CHALLENGE_SIZE};
use steamcm_transport::message::pack_multi;
use steamcm_transport::tcp::{TcpConnection, TcpTransport};
use steamcm_transport::{
    decode_message, ChannelCipher, Connection, EResult, HeartbeatConfig, MsgType, PacketMsg,
    ReconnectPolicy, ServerRecord, TransportKind, Universe, UniverseKey, UniversePrivateKey,
    WebSocketConfig,
};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber once per process. `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> Self {
        init_tracing();
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        Self {
            temp_dir,
            test_name: test_name.to_string(),
        }
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn server_list_path(&self) -> PathBuf {
        self.temp_dir.path().join("servers.json")
    }
}

/// Key pair of the local test universe, generated once per process. Mock servers hold
/// the private half; clients built by [`local_client_config`] get the public half.
pub fn test_universe_key() -> &'static UniversePrivateKey {
    static KEY: OnceLock<UniversePrivateKey> = OnceLock::new();
    KEY.get_or_init(|| UniversePrivateKey::generate(2048).expect("failed to generate test universe key"))
}

/// Public half of [`test_universe_key`].
pub fn test_universe_public_key() -> UniverseKey {
    test_universe_key().public_key()
}

/// Client config for talking to local mock servers: static endpoint list, fast
/// reconnects and a heartbeat slow enough to stay out of the way.
pub fn local_client_config(servers: Vec<ServerRecord>) -> ClientConfig {
    let protocols = if servers.iter().all(|s| s.kind == TransportKind::WebSocket) {
        vec![TransportKind::WebSocket]
    } else {
        vec![TransportKind::Tcp, TransportKind::WebSocket]
    };
    ClientConfig {
        name: "test".to_string(),
        universe_key_pem: Some(
            test_universe_public_key()
                .to_pem()
                .expect("failed to encode test universe key"),
        ),
        server_list: ServerListSource::Static,
        servers,
        protocols,
        handshake_timeout_ms: 2000,
        heartbeat: HeartbeatConfig {
            interval_ms: 60_000,
            enabled: true,
        },
        reconnect: ReconnectPolicy {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            jitter: false,
            ..ReconnectPolicy::default()
        },
        websocket: WebSocketConfig {
            secure: false,
            ..WebSocketConfig::default()
        },
        ..ClientConfig::default()
    }
}

/// A local TCP CM server that performs the server side of the channel handshake.
pub struct MockCmServer {
    listener: TcpListener,
    transport: TcpTransport,
    universe: Universe,
    universe_key: UniversePrivateKey,
    port: u16,
}

impl MockCmServer {
    pub async fn bind() -> anyhow::Result<Self> {
        Self::bind_for(Universe::Public).await
    }

    pub async fn bind_for(universe: Universe) -> anyhow::Result<Self> {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            transport,
            universe,
            universe_key: test_universe_key().clone(),
            port,
        })
    }

    /// Unwraps session keys with `key` instead of the test universe key.
    pub fn with_universe_key(mut self, key: UniversePrivateKey) -> Self {
        self.universe_key = key;
        self
    }

    pub fn record(&self) -> ServerRecord {
        ServerRecord::new("127.0.0.1", self.port, TransportKind::Tcp)
    }

    /// Accepts a TCP connection without any handshake.
    pub async fn accept_raw(&self) -> anyhow::Result<TcpConnection> {
        Ok(self.transport.accept(&self.listener).await?)
    }

    /// Accepts a connection and completes the handshake successfully.
    pub async fn accept(&self) -> anyhow::Result<MockSession> {
        self.accept_with_result(EResult::OK).await
    }

    /// Accepts a connection and answers the handshake with `result`. The session is
    /// returned even when `result` is not OK, so the caller can watch the client hang up.
    pub async fn accept_with_result(&self, result: EResult) -> anyhow::Result<MockSession> {
        let conn = self.accept_raw().await?;
        let request = EncryptRequest::random(self.universe);
        conn.send_frame(&request.to_packet().encode()).await?;

        let reply = decode_message(&conn.recv_frame().await?)?;
        if reply.msg_type != MsgType::CHANNEL_ENCRYPT_RESPONSE {
            bail!("expected ChannelEncryptResponse, got {}", reply.msg_type);
        }
        let response = EncryptResponse::decode(&reply.body)?;
        let key = self
            .universe_key
            .unwrap_session_key(&response.wrapped_key, &request.challenge)
            .context("client wrapped the session key with another universe key")?;

        conn.send_frame(&EncryptResult { result }.to_packet(self.universe).encode())
            .await?;
        Ok(MockSession {
            link: Link::Tcp(conn),
            cipher: Some(ChannelCipher::new(&key)?),
            handshake: Some(Handshake {
                challenge: request.challenge,
                wrapped_key: response.wrapped_key,
            }),
        })
    }
}

/// A local WebSocket CM server. WebSocket sessions carry plain frame bodies.
pub struct MockWsServer {
    listener: TcpListener,
    port: u16,
}

impl MockWsServer {
    pub async fn bind() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn record(&self) -> ServerRecord {
        ServerRecord::new("127.0.0.1", self.port, TransportKind::WebSocket)
    }

    pub async fn accept(&self) -> anyhow::Result<MockSession> {
        let (stream, _) = self.listener.accept().await?;
        let ws = accept_async(stream).await?;
        let (sink, stream) = ws.split();
        Ok(MockSession {
            link: Link::Ws {
                sink: tokio::sync::Mutex::new(sink),
                stream: tokio::sync::Mutex::new(stream),
            },
            cipher: None,
            handshake: None,
        })
    }
}

/// Handshake bytes as they crossed the wire.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub challenge: [u8; CHALLENGE_SIZE],
    pub wrapped_key: Vec<u8>,
}

enum Link {
    Tcp(TcpConnection),
    Ws {
        sink: tokio::sync::Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
        stream: tokio::sync::Mutex<SplitStream<WebSocketStream<TcpStream>>>,
    },
}

/// Server end of an established session.
pub struct MockSession {
    link: Link,
    cipher: Option<ChannelCipher>,
    handshake: Option<Handshake>,
}

impl MockSession {
    pub async fn send(&self, packet: &PacketMsg) -> anyhow::Result<()> {
        self.send_body(&packet.encode()).await
    }

    /// Sends `packets` wrapped in one uncompressed `Multi`.
    pub async fn send_multi(&self, packets: &[PacketMsg]) -> anyhow::Result<()> {
        let bodies: Vec<Vec<u8>> = packets.iter().map(PacketMsg::encode).collect();
        self.send(&pack_multi(bodies)).await
    }

    /// Sends a frame body, encrypting it if the session is encrypted.
    pub async fn send_body(&self, body: &[u8]) -> anyhow::Result<()> {
        let frame = match &self.cipher {
            Some(cipher) => cipher.encrypt(body)?,
            None => body.to_vec(),
        };
        self.send_frame(&frame).await
    }

    /// Sends bytes as a frame exactly as given.
    pub async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        match &self.link {
            Link::Tcp(conn) => conn.send_frame(frame).await?,
            Link::Ws { sink, .. } => {
                sink.lock()
                    .await
                    .send(Message::Binary(frame.to_vec().into()))
                    .await?
            }
        }
        Ok(())
    }

    /// Channel handshake of a TCP session.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Next frame from the client as it arrived, still sealed on an encrypted session.
    pub async fn recv_frame(&self) -> anyhow::Result<Vec<u8>> {
        match &self.link {
            Link::Tcp(conn) => Ok(conn.recv_frame().await?),
            Link::Ws { stream, .. } => {
                let mut stream = stream.lock().await;
                loop {
                    match stream.next().await {
                        Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                        Some(Ok(Message::Close(_))) | None => bail!("client closed the socket"),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Opens and decodes a frame received with [`MockSession::recv_frame`].
    pub fn decode_frame(&self, frame: &[u8]) -> anyhow::Result<PacketMsg> {
        let body = match &self.cipher {
            Some(cipher) => cipher.decrypt(frame)?,
            None => frame.to_vec(),
        };
        Ok(decode_message(&body)?)
    }

    /// Next message from the client.
    pub async fn recv(&self) -> anyhow::Result<PacketMsg> {
        let frame = self.recv_frame().await?;
        self.decode_frame(&frame)
    }

    /// Next message of type `msg_type`, skipping anything else (heartbeats, hello).
    pub async fn recv_type(&self, msg_type: MsgType, timeout: Duration) -> anyhow::Result<PacketMsg> {
        let deadline = Instant::now() + timeout;
        loop {
            let packet = tokio::time::timeout_at(deadline, self.recv())
                .await
                .with_context(|| format!("no {} within {:?}", msg_type, timeout))??;
            if packet.msg_type == msg_type {
                return Ok(packet);
            }
        }
    }

    /// Waits until the client closes its end. Returns false on timeout.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.recv_frame()).await {
                Err(_) => return false,
                Ok(Err(_)) => return true,
                Ok(Ok(_)) => {}
            }
        }
    }

    pub async fn close(&self) {
        match &self.link {
            Link::Tcp(conn) => conn.close().await,
            Link::Ws { sink, .. } => {
                let _ = sink.lock().await.close().await;
            }
        }
    }
}

/// Records every posted event of type `T` that goes through the pump.
pub struct CallbackRecorder<T> {
    events: Arc<Mutex<Vec<T>>>,
    _subscription: Subscription,
}

impl<T: Any + Send + Clone> CallbackRecorder<T> {
    pub fn new(callbacks: &CallbackManager) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = callbacks.subscribe::<T, _>(move |event| sink.lock().push(event.clone()));
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn events(&self) -> Vec<T> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pumps `callbacks` from the test task until `done` holds or `timeout` passes.
pub async fn pump_until<F>(callbacks: &CallbackManager, timeout: Duration, done: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let _ = callbacks.run_pending();
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_creation() {
        let env = TestEnv::new("harness");
        assert!(env.tempdir().exists());
        assert_eq!(env.test_name(), "harness");
        assert!(env.server_list_path().starts_with(env.tempdir()));
    }

    #[test]
    fn test_local_client_config_protocols() {
        let tcp = ServerRecord::new("127.0.0.1", 1, TransportKind::Tcp);
        let ws = ServerRecord::new("127.0.0.1", 2, TransportKind::WebSocket);
        assert_eq!(
            local_client_config(vec![ws.clone()]).protocols,
            vec![TransportKind::WebSocket]
        );
        assert_eq!(local_client_config(vec![tcp, ws]).protocols.len(), 2);
        assert!(local_client_config(Vec::new()).connection_config().is_ok());
    }

    #[tokio::test]
    async fn test_mock_server_binds_distinct_ports() {
        let a = MockCmServer::bind().await.unwrap();
        let b = MockCmServer::bind().await.unwrap();
        assert_ne!(a.record(), b.record());
        assert_eq!(a.record().kind, TransportKind::Tcp);
    }
}
