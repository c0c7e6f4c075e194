//! CM server discovery and ranking.
//!
//! A [`ServerListProvider`] supplies the raw endpoint list: from a local JSON file, from
//! memory, or from the directory Web API. [`ServerDirectory`] holds the working list and
//! ranks candidates: servers marked good move to the front, servers marked bad are
//! skipped until the mark expires.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Transport a CM endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportKind {
    /// Raw TCP with the length/magic envelope.
    Tcp,
    /// UDP. Listed by the directory but not supported for connecting.
    Udp,
    /// WebSocket over TLS.
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Udp => write!(f, "UDP"),
            TransportKind::WebSocket => write!(f, "WEB_SOCKET"),
        }
    }
}

/// One CM endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Host name or IP address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Accepted transport.
    pub kind: TransportKind,
}

impl ServerRecord {
    /// Creates a record.
    pub fn new(host: impl Into<String>, port: u16, kind: TransportKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
        }
    }

    /// Parses a `host:port` endpoint string.
    pub fn parse(endpoint: &str, kind: TransportKind) -> Result<Self> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| TransportError::Directory(format!("endpoint without port: {}", endpoint)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::Directory(format!("invalid port in endpoint: {}", endpoint)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TransportError::Directory(format!("endpoint without host: {}", endpoint)));
        }
        Ok(Self::new(host, port, kind))
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ServerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr(), self.kind)
    }
}

/// Source of the CM endpoint list.
#[async_trait]
pub trait ServerListProvider: Send + Sync {
    /// Returns the known endpoints, in preference order.
    async fn fetch_server_list(&self) -> Result<Vec<ServerRecord>>;

    /// Replaces the stored endpoints. Providers without storage ignore this.
    async fn update_server_list(&self, records: &[ServerRecord]) -> Result<()>;
}

/// Endpoint list persisted as a JSON array in a file.
///
/// A missing file reads as an empty list. Writes go to a temporary file that is then
/// renamed over the target, so readers never see a partial list.
#[derive(Debug, Clone)]
pub struct FileServerListProvider {
    path: PathBuf,
}

impl FileServerListProvider {
    /// Provider backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ServerListProvider for FileServerListProvider {
    async fn fetch_server_list(&self) -> Result<Vec<ServerRecord>> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "server list file not found");
                return Ok(Vec::new());
            }
            Err(e) => return Err(TransportError::IoError(e)),
        };
        serde_json::from_slice(&content).map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    async fn update_server_list(&self, records: &[ServerRecord]) -> Result<()> {
        let content = serde_json::to_vec_pretty(records)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), count = records.len(), "server list written");
        Ok(())
    }
}

/// Endpoint list held in memory.
#[derive(Debug, Default)]
pub struct MemoryServerListProvider {
    records: Mutex<Vec<ServerRecord>>,
}

impl MemoryServerListProvider {
    /// Provider seeded with `records`.
    pub fn new(records: Vec<ServerRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[async_trait]
impl ServerListProvider for MemoryServerListProvider {
    async fn fetch_server_list(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.records.lock().clone())
    }

    async fn update_server_list(&self, records: &[ServerRecord]) -> Result<()> {
        *self.records.lock() = records.to_vec();
        Ok(())
    }
}

/// Default directory Web API base URL.
pub const DEFAULT_DIRECTORY_URL: &str = "https://api.steampowered.com";

/// Endpoint list fetched from the `ISteamDirectory/GetCMListForConnect` Web API.
#[derive(Debug, Clone)]
pub struct DirectoryServiceProvider {
    client: reqwest::Client,
    base_url: String,
    cell_id: u32,
    max_count: u32,
}

#[derive(Debug, Deserialize)]
struct DirectoryEnvelope {
    response: DirectoryResponse,
}

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    serverlist: Vec<DirectoryServer>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct DirectoryServer {
    endpoint: String,
    #[serde(rename = "type")]
    kind: String,
}

impl DirectoryServiceProvider {
    /// Provider querying `base_url` for servers near `cell_id`.
    pub fn new(base_url: impl Into<String>, cell_id: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            cell_id,
            max_count: 20,
        }
    }

    /// Limits how many endpoints are requested.
    pub fn with_max_count(mut self, max_count: u32) -> Self {
        self.max_count = max_count;
        self
    }

    fn parse_response(body: &[u8]) -> Result<Vec<ServerRecord>> {
        let envelope: DirectoryEnvelope = serde_json::from_slice(body)
            .map_err(|e| TransportError::Directory(format!("malformed directory response: {}", e)))?;
        let response = envelope.response;
        if !response.success {
            return Err(TransportError::Directory(format!(
                "directory request failed: {}",
                response.message
            )));
        }
        let mut records = Vec::with_capacity(response.serverlist.len());
        for server in response.serverlist {
            let kind = match server.kind.as_str() {
                "netfilter" => TransportKind::Tcp,
                "websockets" => TransportKind::WebSocket,
                other => {
                    debug!(kind = other, endpoint = %server.endpoint, "skipping unknown server type");
                    continue;
                }
            };
            records.push(ServerRecord::parse(&server.endpoint, kind)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl ServerListProvider for DirectoryServiceProvider {
    async fn fetch_server_list(&self) -> Result<Vec<ServerRecord>> {
        let url = format!(
            "{}/ISteamDirectory/GetCMListForConnect/v1/",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .query(&[("cellid", self.cell_id), ("maxcount", self.max_count)])
            .send()
            .await
            .map_err(|e| TransportError::Directory(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Directory(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Directory(e.to_string()))?;
        let records = Self::parse_response(&body)?;
        info!(count = records.len(), cell_id = self.cell_id, "fetched CM server list");
        Ok(records)
    }

    async fn update_server_list(&self, _records: &[ServerRecord]) -> Result<()> {
        Ok(())
    }
}

/// Reads from `primary` and falls back to `fallback` when it has no endpoints.
///
/// Updates are written to `primary` only, which makes a file cache in front of the
/// directory Web API.
pub struct FallbackServerListProvider {
    primary: Arc<dyn ServerListProvider>,
    fallback: Arc<dyn ServerListProvider>,
}

impl FallbackServerListProvider {
    /// Chains two providers.
    pub fn new(primary: Arc<dyn ServerListProvider>, fallback: Arc<dyn ServerListProvider>) -> Self {
        Self { primary, fallback }
    }
}

impl fmt::Debug for FallbackServerListProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackServerListProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl ServerListProvider for FallbackServerListProvider {
    async fn fetch_server_list(&self) -> Result<Vec<ServerRecord>> {
        let records = self.primary.fetch_server_list().await?;
        if !records.is_empty() {
            return Ok(records);
        }
        debug!("primary server list empty, asking fallback");
        self.fallback.fetch_server_list().await
    }

    async fn update_server_list(&self, records: &[ServerRecord]) -> Result<()> {
        self.primary.update_server_list(records).await
    }
}

/// Outcome recorded for a server after a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerQuality {
    /// Connected successfully.
    Good,
    /// Failed or asked us to go elsewhere.
    Bad,
}

/// Directory ranking configuration.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// How long a bad mark keeps a server out of rotation (default: 5 min).
    pub bad_expiry: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            bad_expiry: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    record: ServerRecord,
    last_bad: Option<Instant>,
}

/// Working list of CM endpoints with quality marks.
pub struct ServerDirectory {
    provider: Arc<dyn ServerListProvider>,
    config: DirectoryConfig,
    entries: Mutex<Vec<DirectoryEntry>>,
}

impl ServerDirectory {
    /// Empty directory backed by `provider`.
    pub fn new(provider: Arc<dyn ServerListProvider>, config: DirectoryConfig) -> Self {
        Self {
            provider,
            config,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Reloads the list from the provider. Returns the number of records.
    pub async fn refresh(&self) -> Result<usize> {
        let records = self.provider.fetch_server_list().await?;
        self.replace(records);
        Ok(self.len())
    }

    /// Replaces the working list. Duplicates after the first occurrence are dropped and
    /// all quality marks are cleared.
    pub fn replace(&self, records: Vec<ServerRecord>) {
        let mut entries: Vec<DirectoryEntry> = Vec::with_capacity(records.len());
        for record in records {
            if entries.iter().any(|e| e.record == record) {
                continue;
            }
            entries.push(DirectoryEntry {
                record,
                last_bad: None,
            });
        }
        debug!(count = entries.len(), "server directory replaced");
        *self.entries.lock() = entries;
    }

    /// Current records in ranking order.
    pub fn records(&self) -> Vec<ServerRecord> {
        self.entries.lock().iter().map(|e| e.record.clone()).collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no records are known.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Best record of one of `kinds`: the first one without an active bad mark, or the
    /// one marked bad longest ago when every candidate is marked.
    pub fn next_candidate(&self, kinds: &[TransportKind]) -> Option<ServerRecord> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let mut oldest_bad: Option<&DirectoryEntry> = None;
        for entry in entries.iter().filter(|e| kinds.contains(&e.record.kind)) {
            match entry.last_bad {
                None => return Some(entry.record.clone()),
                Some(at) if now.duration_since(at) >= self.config.bad_expiry => {
                    return Some(entry.record.clone())
                }
                Some(at) => {
                    if oldest_bad.map_or(true, |o| o.last_bad.is_some_and(|o_at| at < o_at)) {
                        oldest_bad = Some(entry);
                    }
                }
            }
        }
        oldest_bad.map(|e| e.record.clone())
    }

    /// Records the outcome of using `record`. Returns false if it is not in the list.
    pub fn mark(&self, record: &ServerRecord, quality: ServerQuality) -> bool {
        let mut entries = self.entries.lock();
        let Some(index) = entries.iter().position(|e| &e.record == record) else {
            return false;
        };
        match quality {
            ServerQuality::Good => {
                let mut entry = entries.remove(index);
                entry.last_bad = None;
                entries.insert(0, entry);
            }
            ServerQuality::Bad => {
                entries[index].last_bad = Some(Instant::now());
                debug!(server = %record, "server marked bad");
            }
        }
        true
    }

    /// Writes the current list back to the provider.
    pub async fn persist(&self) -> Result<()> {
        let records = self.records();
        self.provider.update_server_list(&records).await
    }
}

impl fmt::Debug for ServerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDirectory")
            .field("records", &self.len())
            .field("bad_expiry", &self.config.bad_expiry)
            .finish()
    }
}
