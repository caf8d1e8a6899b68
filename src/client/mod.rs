//! Wire primitives each adapter is built on.
//!
//! The adapters only ever talk to these traits. The TCP and HTTP clients in
//! this module implement them against real servers.

use std::fmt;

use crate::Result;

mod http;
mod memcached;
mod redis_cluster;
mod resp;

pub use self::http::CloudantHttpClient;
pub use self::memcached::{MemcachedClient, is_valid_key as is_valid_memcached_key};
pub use self::redis_cluster::{RedisClusterClient, hash_slot};
pub use self::resp::RespValue;

/// Storage commands of the memcached text protocol.
pub trait MemcachedOps: Send {
    #[allow(missing_docs)]
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditional store. `exptime` zero means no expiry.
    fn set(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<()>;

    /// Store only if absent. `false` when the key already exists.
    fn add(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<bool>;

    /// `false` when the key did not exist.
    fn delete(&mut self, key: &str) -> Result<bool>;

    /// Atomic increment, `None` when the key does not exist.
    fn incr(&mut self, key: &str, delta: u64) -> Result<Option<u64>>;

    /// Server version string, used as a liveness probe.
    fn version(&mut self) -> Result<String>;

    /// Drop and reopen every server connection.
    fn reconnect(&mut self) -> Result<()>;
}

/// A RESP command channel that routes each command to the right node.
pub trait RedisOps: Send {
    /// Send one command and return its reply. Error replies come back as
    /// [`RespValue::Error`], not as `Err`.
    fn command(&mut self, args: &[&[u8]]) -> Result<RespValue>;

    /// Drop and reopen every node connection.
    fn reconnect(&mut self) -> Result<()>;
}

/// A plain HTTP exchange with a JSON document database.
pub trait HttpOps: Send {
    #[allow(missing_docs)]
    fn send(&mut self, verb: HttpVerb, url: &str, body: Option<&str>) -> Result<HttpReply>;
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Get,
    Put,
    Post,
    Delete,
    Head,
}

impl fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpVerb::Get => "GET",
            HttpVerb::Put => "PUT",
            HttpVerb::Post => "POST",
            HttpVerb::Delete => "DELETE",
            HttpVerb::Head => "HEAD",
        };
        f.write_str(s)
    }
}

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    #[allow(missing_docs)]
    pub status: u16,
    #[allow(missing_docs)]
    pub body: String,
}
