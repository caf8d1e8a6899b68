//! Connection settings and lock retry policy, loadable from TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::Result;

/// Maximum bytes in one memcached catalog segment.
pub const DEFAULT_MAX_CATALOG_SEGMENT_SIZE: usize = 512 * 1024;

/// Connection settings for one context.
///
/// ```toml
/// backend = "redis-cluster"
/// servers = ["10.0.0.1:7000", "10.0.0.2:7000:secret"]
///
/// [options]
/// io_timeout_ms = 2000
///
/// [lock]
/// max_attempts = 500
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DpsConfig {
    /// Factory key: `memcached`, `redis-cluster` or `cloudant`.
    pub backend: String,
    /// Server strings in the backend's own format.
    #[serde(default)]
    pub servers: Vec<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub options: ConnectionOptions,
    #[allow(missing_docs)]
    #[serde(default)]
    pub lock: LockPolicy,
    /// Only used by the memcached adapter.
    #[serde(default = "default_segment_size")]
    pub max_catalog_segment_size: usize,
}

fn default_segment_size() -> usize {
    DEFAULT_MAX_CATALOG_SEGMENT_SIZE
}

impl DpsConfig {
    /// A config with default options for `backend` and `servers`.
    pub fn new(backend: impl Into<String>, servers: Vec<String>) -> Self {
        DpsConfig {
            backend: backend.into(),
            servers,
            options: ConnectionOptions::default(),
            lock: LockPolicy::default(),
            max_catalog_segment_size: DEFAULT_MAX_CATALOG_SEGMENT_SIZE,
        }
    }

    #[allow(missing_docs)]
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    #[allow(missing_docs)]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}

/// Credentials, TLS and timeouts handed to a wire client constructor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Used when a server string carries no password of its own.
    pub password: Option<String>,
    /// Basic-auth user for the HTTP backend.
    pub username: Option<String>,
    #[allow(missing_docs)]
    pub tls: bool,
    /// Zero means no timeout.
    pub connect_timeout_ms: u64,
    /// Zero means no timeout.
    pub io_timeout_ms: u64,
}

impl ConnectionOptions {
    #[allow(missing_docs)]
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    #[allow(missing_docs)]
    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_ms > 0).then(|| Duration::from_millis(self.io_timeout_ms))
    }
}

/// Retry budget shared by store locks, general purpose locks and user locks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// Attempts before giving up with a lock acquisition error.
    pub max_attempts: u32,
    /// Lease of internal locks; also the staleness limit for document-store takeover.
    pub lease_ttl_secs: u64,
    /// Upper bound of the randomized sleep between attempts.
    pub max_retry_sleep_ms: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy {
            max_attempts: 10_000,
            lease_ttl_secs: 5,
            max_retry_sleep_ms: 1_000,
        }
    }
}
