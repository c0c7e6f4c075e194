//! Session attributes learned from the logon flow.
//!
//! The logon layer writes these when the server accepts a logon; handlers read them.
//! The connection stamps the steam id and session id onto every outgoing proto header.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::protocol::Universe;

/// 64-bit account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SteamId(pub u64);

impl SteamId {
    /// Account number (low 32 bits).
    pub fn account_id(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Universe (top 8 bits).
    pub fn universe(self) -> Universe {
        Universe::from_u8((self.0 >> 56) as u8)
    }

    /// True when no account is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SteamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of the session attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Logged-on account.
    pub steam_id: Option<SteamId>,
    /// Session id assigned at logon.
    pub session_id: Option<i32>,
    /// Recommended content cell.
    pub cell_id: Option<u32>,
    /// Public IP as seen by the server.
    pub public_ip: Option<IpAddr>,
    /// Country of the public IP.
    pub ip_country_code: Option<String>,
    /// Session token handed out by the server.
    pub session_token: Option<u64>,
}

/// Shared, thread-safe session attributes.
#[derive(Debug, Clone, Default)]
pub struct SessionAttributes {
    inner: Arc<RwLock<SessionInfo>>,
}

impl SessionAttributes {
    /// Empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all attributes.
    pub fn snapshot(&self) -> SessionInfo {
        self.inner.read().clone()
    }

    /// Applies `f` under the write lock.
    pub fn update<F: FnOnce(&mut SessionInfo)>(&self, f: F) {
        f(&mut self.inner.write());
    }

    /// Clears everything learned at logon. The session token survives.
    pub fn clear_logon(&self) {
        let mut info = self.inner.write();
        let token = info.session_token;
        *info = SessionInfo {
            session_token: token,
            ..SessionInfo::default()
        };
    }

    /// Logged-on account, if any.
    pub fn steam_id(&self) -> Option<SteamId> {
        self.inner.read().steam_id
    }

    /// Session id, if logged on.
    pub fn session_id(&self) -> Option<i32> {
        self.inner.read().session_id
    }

    /// Recommended cell id, if logged on.
    pub fn cell_id(&self) -> Option<u32> {
        self.inner.read().cell_id
    }

    /// Public IP reported at logon.
    pub fn public_ip(&self) -> Option<IpAddr> {
        self.inner.read().public_ip
    }

    /// Country code reported at logon.
    pub fn ip_country_code(&self) -> Option<String> {
        self.inner.read().ip_country_code.clone()
    }

    /// Last session token received.
    pub fn session_token(&self) -> Option<u64> {
        self.inner.read().session_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steam_id_fields() {
        let id = SteamId(76561197960287930);
        assert_eq!(id.account_id(), 22202);
        assert_eq!(id.universe(), Universe::Public);
        assert!(SteamId::default().is_empty());
    }

    #[test]
    fn test_update_and_clear_keeps_token() {
        let attrs = SessionAttributes::new();
        let reader = attrs.clone();
        attrs.update(|info| {
            info.steam_id = Some(SteamId(1));
            info.session_id = Some(42);
            info.cell_id = Some(7);
            info.public_ip = Some("203.0.113.9".parse().unwrap());
            info.ip_country_code = Some("NZ".into());
            info.session_token = Some(99);
        });
        assert_eq!(reader.session_id(), Some(42));
        assert_eq!(reader.ip_country_code().as_deref(), Some("NZ"));

        attrs.clear_logon();
        let info = reader.snapshot();
        assert_eq!(info.steam_id, None);
        assert_eq!(info.cell_id, None);
        assert_eq!(info.public_ip, None);
        assert_eq!(info.session_token, Some(99));
    }
}
