use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use steamcm_transport::{
    ConnectionConfig, DirectoryConfig, DirectoryServiceProvider, FallbackServerListProvider,
    FileServerListProvider, HeartbeatConfig, MemoryServerListProvider, ReconnectPolicy,
    ServerDirectory, ServerListProvider, ServerRecord, TcpTransportConfig, TransportKind, Universe,
    UniverseKey, WebSocketConfig, DEFAULT_DIRECTORY_URL,
};

use crate::error::{ClientError, Result};

/// Where the client gets its CM endpoints from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerListSource {
    /// Only the `servers` listed in the config.
    Static,
    /// The directory Web API.
    Directory,
    /// A JSON cache file, filled from the directory Web API when empty.
    File {
        /// Cache file path.
        path: PathBuf,
    },
}

/// Client configuration, loadable from TOML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name recorded on the connection's tracing span.
    pub name: String,
    /// Universe to connect to.
    pub universe: Universe,
    /// PEM public key replacing the universe's built-in key.
    pub universe_key_pem: Option<String>,
    /// Transport kinds to try, in order of preference.
    pub protocols: Vec<TransportKind>,
    /// Cell id sent to the directory Web API.
    pub cell_id: u32,
    /// Endpoint source.
    pub server_list: ServerListSource,
    /// Directory Web API base URL.
    pub directory_url: String,
    /// Seed endpoints, tried before anything from the source.
    pub servers: Vec<ServerRecord>,
    /// How long a server stays marked bad, in seconds.
    pub bad_server_expiry_secs: u64,
    /// Channel handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,
    /// TCP settings.
    pub tcp: TcpTransportConfig,
    /// WebSocket settings.
    pub websocket: WebSocketConfig,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect settings.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "steamcm".to_string(),
            universe: Universe::Public,
            universe_key_pem: None,
            protocols: vec![TransportKind::Tcp, TransportKind::WebSocket],
            cell_id: 0,
            server_list: ServerListSource::Directory,
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            servers: Vec::new(),
            bad_server_expiry_secs: 300,
            handshake_timeout_ms: 10_000,
            tcp: TcpTransportConfig::default(),
            websocket: WebSocketConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ClientConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ClientConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Connection settings derived from this config.
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let universe_key = match &self.universe_key_pem {
            Some(pem) => Some(
                UniverseKey::from_pem(pem)
                    .map_err(|e| ClientError::Config(format!("universe_key_pem: {}", e)))?,
            ),
            None => None,
        };
        if self.protocols.is_empty() {
            return Err(ClientError::Config("protocols must not be empty".into()));
        }
        Ok(ConnectionConfig {
            tcp: self.tcp.clone(),
            websocket: self.websocket.clone(),
            heartbeat: self.heartbeat.clone(),
            reconnect: self.reconnect.clone(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            universe: self.universe,
            universe_key,
            protocols: self.protocols.clone(),
            name: self.name.clone(),
        })
    }

    /// Endpoint provider for the configured source.
    pub fn server_list_provider(&self) -> Arc<dyn ServerListProvider> {
        let directory = || -> Arc<dyn ServerListProvider> {
            Arc::new(DirectoryServiceProvider::new(self.directory_url.clone(), self.cell_id))
        };
        match &self.server_list {
            ServerListSource::Static => Arc::new(MemoryServerListProvider::new(self.servers.clone())),
            ServerListSource::Directory => directory(),
            ServerListSource::File { path } => Arc::new(FallbackServerListProvider::new(
                Arc::new(FileServerListProvider::new(path.clone())),
                directory(),
            )),
        }
    }

    /// Server directory seeded with `servers`.
    pub fn server_directory(&self) -> Arc<ServerDirectory> {
        let directory = ServerDirectory::new(
            self.server_list_provider(),
            DirectoryConfig {
                bad_expiry: Duration::from_secs(self.bad_server_expiry_secs),
            },
        );
        if !self.servers.is_empty() {
            directory.replace(self.servers.clone());
        }
        Arc::new(directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ClientConfig::default();
        assert_eq!(config.universe, Universe::Public);
        assert_eq!(config.server_list, ServerListSource::Directory);
        assert_eq!(config.handshake_timeout_ms, 10_000);
        assert_eq!(config.heartbeat.interval_ms, 5000);
        assert!(config.reconnect.enabled);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
name = "bot"
universe = "beta"
protocols = ["WEB_SOCKET"]
cell_id = 4

[server_list]
kind = "file"
path = "/var/cache/steamcm/servers.json"

[[servers]]
host = "10.0.0.1"
port = 27017
kind = "TCP"

[heartbeat]
interval_ms = 2000

[reconnect]
max_attempts = 5
"#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "bot");
        assert_eq!(config.universe, Universe::Beta);
        assert_eq!(config.protocols, vec![TransportKind::WebSocket]);
        assert_eq!(
            config.server_list,
            ServerListSource::File {
                path: PathBuf::from("/var/cache/steamcm/servers.json")
            }
        );
        assert_eq!(config.servers, vec![ServerRecord::new("10.0.0.1", 27017, TransportKind::Tcp)]);
        assert_eq!(config.heartbeat.interval_ms, 2000);
        assert!(config.heartbeat.enabled);
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.reconnect.initial_backoff_ms, 1000);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{ "server_list": {{ "kind": "static" }}, "handshake_timeout_ms": 500 }}"#
        )
        .unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server_list, ServerListSource::Static);
        assert_eq!(config.handshake_timeout_ms, 500);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ClientConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_connection_config_conversion() {
        let beta = UniverseKey::for_universe(Universe::Beta).unwrap();
        let config = ClientConfig {
            universe_key_pem: Some(beta.to_pem().unwrap()),
            handshake_timeout_ms: 1500,
            ..ClientConfig::default()
        };
        let conn = config.connection_config().unwrap();
        assert_eq!(conn.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(conn.universe_key, Some(beta));
        assert_eq!(conn.name, "steamcm");
        assert_eq!(ClientConfig::default().connection_config().unwrap().universe_key, None);

        let bad = ClientConfig {
            universe_key_pem: Some("-----BEGIN PUBLIC KEY-----\nzz\n-----END PUBLIC KEY-----".into()),
            ..ClientConfig::default()
        };
        assert!(matches!(bad.connection_config(), Err(ClientError::Config(_))));

        let empty = ClientConfig {
            protocols: Vec::new(),
            ..ClientConfig::default()
        };
        assert!(empty.connection_config().is_err());
    }

    #[test]
    fn test_static_directory_is_seeded() {
        let config = ClientConfig {
            server_list: ServerListSource::Static,
            servers: vec![ServerRecord::new("10.0.0.9", 27017, TransportKind::Tcp)],
            ..ClientConfig::default()
        };
        let directory = config.server_directory();
        assert_eq!(directory.len(), 1);
        assert_eq!(
            directory.next_candidate(&[TransportKind::Tcp]),
            Some(ServerRecord::new("10.0.0.9", 27017, TransportKind::Tcp))
        );
    }
}
