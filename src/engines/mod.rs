//! The backend contract and the three adapters that implement it.

use std::collections::HashMap;
use std::time::Duration;

use crate::catalog::StoreInfo;
use crate::client::{CloudantHttpClient, MemcachedClient, RedisClusterClient};
use crate::config::DpsConfig;
use crate::iterator::StoreIterator;
use crate::{DpsError, Result};

mod cloudant;
mod layout;
mod memcached;
mod redis_cluster;

pub use self::cloudant::{
    CloudantEngine, CommandScope, HttpCommand, HttpCommandReply, META_DB as CLOUDANT_META_DB,
    lock_id_for as cloudant_lock_id, store_id_for as cloudant_store_id,
};
pub use self::memcached::MemcachedEngine;
pub use self::redis_cluster::RedisClusterEngine;

/// Whether TTL keys and values go through the standard encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlEncoding {
    #[allow(missing_docs)]
    pub key: bool,
    #[allow(missing_docs)]
    pub value: bool,
}

impl Default for TtlEncoding {
    fn default() -> Self {
        TtlEncoding {
            key: true,
            value: true,
        }
    }
}

/// The operation set every backend adapter implements.
///
/// The plain `put`/`get`/`has`/`remove` do no store existence check and take
/// no store lock, so they are only correct against a store the caller knows
/// exists. The `_safe` variants check first and fail with
/// [`DpsError::InvalidStoreId`], and serialize mutations on the store lock.
#[allow(missing_docs)]
pub trait DpsEngine: Send {
    /// Backend product name.
    fn product_name(&self) -> &'static str;

    /// Cheap liveness probe.
    fn is_connected(&mut self) -> bool;

    fn reconnect(&mut self) -> Result<()>;

    fn create_store(&mut self, name: &str, key_type: &str, value_type: &str) -> Result<u64>;

    /// Id of the store named `name`, creating it when absent.
    fn create_or_get_store(&mut self, name: &str, key_type: &str, value_type: &str) -> Result<u64> {
        match self.create_store(name, key_type, value_type) {
            Err(DpsError::StoreExists(_)) => self.find_store(name),
            other => other,
        }
    }

    fn find_store(&mut self, name: &str) -> Result<u64>;

    fn remove_store(&mut self, store: u64) -> Result<()>;

    /// Name, type tags and item count of a store.
    fn store_info(&mut self, store: u64) -> Result<StoreInfo>;

    fn store_name(&mut self, store: u64) -> Result<String> {
        Ok(self.store_info(store)?.name)
    }

    fn key_type_name(&mut self, store: u64) -> Result<String> {
        Ok(self.store_info(store)?.key_type)
    }

    fn value_type_name(&mut self, store: u64) -> Result<String> {
        Ok(self.store_info(store)?.value_type)
    }

    fn size(&mut self, store: u64) -> Result<u64>;

    /// Drop every item, keeping the store's name and type tags.
    fn clear(&mut self, store: u64) -> Result<()>;

    fn put(&mut self, store: u64, key: &[u8], value: &[u8]) -> Result<()>;

    fn put_safe(&mut self, store: u64, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&mut self, store: u64, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn get_safe(&mut self, store: u64, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Fails with [`DpsError::DataItemDelete`] when the key is absent.
    fn remove(&mut self, store: u64, key: &[u8]) -> Result<()>;

    fn remove_safe(&mut self, store: u64, key: &[u8]) -> Result<()>;

    fn has(&mut self, store: u64, key: &[u8]) -> Result<bool>;

    fn has_safe(&mut self, store: u64, key: &[u8]) -> Result<bool>;

    /// Store an expiring value outside any store. `ttl` zero keeps it forever.
    fn put_ttl(&mut self, key: &[u8], value: &[u8], ttl: u32, encoding: TtlEncoding) -> Result<()>;

    fn get_ttl(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<Option<Vec<u8>>>;

    fn has_ttl(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<bool>;

    fn remove_ttl(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<()>;

    fn new_iterator(&mut self, store: u64) -> Result<StoreIterator>;

    /// Next decoded key/value pair, `None` once the iterator is exhausted.
    fn get_next(&mut self, store: u64, iter: &mut StoreIterator) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// Dispose of an iterator; it must belong to `store`.
    fn delete_iterator(&mut self, store: u64, iter: StoreIterator) -> Result<()> {
        iter.check_store(store)
    }

    fn create_or_get_lock(&mut self, name: &str) -> Result<u64>;

    /// Block until the lock is ours for `lease`, giving up after `max_wait`.
    fn acquire_lock(&mut self, lock: u64, lease: Duration, max_wait: Duration) -> Result<()>;

    /// Deletes the lock record without checking who holds it.
    fn release_lock(&mut self, lock: u64) -> Result<()>;

    fn remove_lock(&mut self, lock: u64) -> Result<()>;

    /// Pid of the process that last acquired the lock named `name`.
    fn get_pid_for_lock(&mut self, name: &str) -> Result<u32>;

    /// Ask the backend to make recent writes durable.
    fn persist(&mut self) -> Result<()> {
        Ok(())
    }

    /// Raw command passthrough; the reply is flattened to text.
    fn run_command(&mut self, tokens: &[String]) -> Result<String> {
        let _ = tokens;
        Err(DpsError::FeatureNotSupported(format!(
            "{} has no raw command passthrough",
            self.product_name()
        )))
    }

    /// Structured HTTP request against the document store.
    fn run_http_command(&mut self, command: &HttpCommand) -> Result<HttpCommandReply> {
        let _ = command;
        Err(DpsError::FeatureNotSupported(format!(
            "{} does not accept HTTP commands",
            self.product_name()
        )))
    }
}

/// Builds a connected engine from a config.
pub type Connector = fn(&DpsConfig) -> Result<Box<dyn DpsEngine>>;

/// Engine constructors keyed by the `backend` config value.
pub struct EngineFactory {
    connectors: HashMap<String, Connector>,
}

impl EngineFactory {
    /// A factory with no backends registered.
    pub fn empty() -> Self {
        EngineFactory {
            connectors: HashMap::new(),
        }
    }

    /// A factory knowing `memcached`, `redis-cluster` and `cloudant`.
    pub fn with_defaults() -> Self {
        let mut factory = Self::empty();
        factory.register("memcached", connect_memcached);
        factory.register("redis-cluster", connect_redis_cluster);
        factory.register("cloudant", connect_cloudant);
        factory
    }

    /// Register or replace the connector for `backend`.
    pub fn register(&mut self, backend: impl Into<String>, connector: Connector) {
        self.connectors.insert(backend.into(), connector);
    }

    #[allow(missing_docs)]
    pub fn backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Connect the engine named by `config.backend`.
    pub fn connect(&self, config: &DpsConfig) -> Result<Box<dyn DpsEngine>> {
        let connector = self
            .connectors
            .get(&config.backend)
            .ok_or_else(|| DpsError::UnknownBackend(config.backend.clone()))?;
        connector(config)
    }
}

impl Default for EngineFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn connect_memcached(config: &DpsConfig) -> Result<Box<dyn DpsEngine>> {
    let client = MemcachedClient::connect(&config.servers, config.options.clone())?;
    Ok(Box::new(MemcachedEngine::from_config(client, config)?))
}

fn connect_redis_cluster(config: &DpsConfig) -> Result<Box<dyn DpsEngine>> {
    let client = RedisClusterClient::connect(&config.servers, config.options.clone())?;
    Ok(Box::new(RedisClusterEngine::from_config(client, config)?))
}

fn connect_cloudant(config: &DpsConfig) -> Result<Box<dyn DpsEngine>> {
    let client = CloudantHttpClient::new(&config.options)?;
    Ok(Box::new(CloudantEngine::from_config(client, config)?))
}
