//! Relay configuration.
//!
//! Read from an optional TOML file; every field has a default so an empty
//! file, or no file at all, yields a usable relay listening on
//! [`DEFAULT_LISTEN`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::store::MemoryStore;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7777";
/// Bounded wait for new connections per loop iteration.
pub const DEFAULT_ACCEPT_POLL_MS: u64 = 500;
pub const DEFAULT_MAX_PENDING_OUTPUT: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// A user the credential store is seeded with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEntry {
    pub login: String,
    /// Hex PBKDF2 hash, as printed by `chat-relay hash`.
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Socket address to bind. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    pub accept_poll_ms: u64,
    pub max_frame_len: usize,
    /// Unsent bytes a connection may accumulate before it counts as stalled.
    pub max_pending_output: usize,
    /// Evict connections silent for this long. Unset disables eviction.
    pub idle_timeout_secs: Option<u64>,
    pub users: Vec<UserEntry>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7777)),
            accept_poll_ms: DEFAULT_ACCEPT_POLL_MS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_pending_output: DEFAULT_MAX_PENDING_OUTPUT,
            idle_timeout_secs: None,
            users: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// An in-memory credential store holding the configured users.
    pub fn seeded_store(&self) -> MemoryStore {
        MemoryStore::with_users(
            self.users
                .iter()
                .map(|user| (user.login.clone(), user.password_hash.clone())),
        )
    }
}
