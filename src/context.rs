use std::time::Duration;

use log::debug;

use crate::catalog::StoreInfo;
use crate::config::DpsConfig;
use crate::engines::{DpsEngine, EngineFactory, HttpCommand, HttpCommandReply, TtlEncoding};
use crate::iterator::StoreIterator;
use crate::{ErrorChannel, Result};

/// One caller's handle on a store backend.
///
/// Every call still returns a `Result`, and its outcome is also recorded in
/// the context: TTL operations land in [`DpsContext::last_ttl_error`], all
/// others in [`DpsContext::last_error`]. A success clears its channel.
pub struct DpsContext {
    engine: Box<dyn DpsEngine>,
    error: ErrorChannel,
    ttl_error: ErrorChannel,
}

impl DpsContext {
    /// Wrap an already connected engine.
    pub fn new(engine: Box<dyn DpsEngine>) -> Self {
        DpsContext {
            engine,
            error: ErrorChannel::default(),
            ttl_error: ErrorChannel::default(),
        }
    }

    /// Connect the backend named by `config.backend`.
    pub fn connect(config: &DpsConfig) -> Result<Self> {
        Self::connect_with(&EngineFactory::default(), config)
    }

    /// Connect through a custom factory.
    pub fn connect_with(factory: &EngineFactory, config: &DpsConfig) -> Result<Self> {
        let engine = factory.connect(config)?;
        debug!("connected to {} via {:?}", engine.product_name(), config.servers);
        Ok(Self::new(engine))
    }

    /// Outcome of the last non-TTL operation.
    pub fn last_error(&self) -> &ErrorChannel {
        &self.error
    }

    /// Outcome of the last TTL operation.
    pub fn last_ttl_error(&self) -> &ErrorChannel {
        &self.ttl_error
    }

    /// Direct engine access; calls made this way are not recorded.
    pub fn engine_mut(&mut self) -> &mut dyn DpsEngine {
        self.engine.as_mut()
    }

    fn track<T>(&mut self, f: impl FnOnce(&mut dyn DpsEngine) -> Result<T>) -> Result<T> {
        let result = f(self.engine.as_mut());
        self.error.record(&result);
        result
    }

    fn track_ttl<T>(&mut self, f: impl FnOnce(&mut dyn DpsEngine) -> Result<T>) -> Result<T> {
        let result = f(self.engine.as_mut());
        self.ttl_error.record(&result);
        result
    }

    #[allow(missing_docs)]
    pub fn product_name(&self) -> &'static str {
        self.engine.product_name()
    }

    #[allow(missing_docs)]
    pub fn is_connected(&mut self) -> bool {
        self.engine.is_connected()
    }

    #[allow(missing_docs)]
    pub fn reconnect(&mut self) -> Result<()> {
        self.track(|e| e.reconnect())
    }

    /// Fails with `StoreExists` when the name is taken.
    pub fn create_store(&mut self, name: &str, key_type: &str, value_type: &str) -> Result<u64> {
        self.track(|e| e.create_store(name, key_type, value_type))
    }

    #[allow(missing_docs)]
    pub fn create_or_get_store(&mut self, name: &str, key_type: &str, value_type: &str) -> Result<u64> {
        self.track(|e| e.create_or_get_store(name, key_type, value_type))
    }

    #[allow(missing_docs)]
    pub fn find_store(&mut self, name: &str) -> Result<u64> {
        self.track(|e| e.find_store(name))
    }

    #[allow(missing_docs)]
    pub fn remove_store(&mut self, store: u64) -> Result<()> {
        self.track(|e| e.remove_store(store))
    }

    #[allow(missing_docs)]
    pub fn store_info(&mut self, store: u64) -> Result<StoreInfo> {
        self.track(|e| e.store_info(store))
    }

    #[allow(missing_docs)]
    pub fn store_name(&mut self, store: u64) -> Result<String> {
        self.track(|e| e.store_name(store))
    }

    #[allow(missing_docs)]
    pub fn key_type_name(&mut self, store: u64) -> Result<String> {
        self.track(|e| e.key_type_name(store))
    }

    #[allow(missing_docs)]
    pub fn value_type_name(&mut self, store: u64) -> Result<String> {
        self.track(|e| e.value_type_name(store))
    }

    #[allow(missing_docs)]
    pub fn size(&mut self, store: u64) -> Result<u64> {
        self.track(|e| e.size(store))
    }

    #[allow(missing_docs)]
    pub fn clear(&mut self, store: u64) -> Result<()> {
        self.track(|e| e.clear(store))
    }

    /// No existence check and no store lock.
    pub fn put(&mut self, store: u64, key: &[u8], value: &[u8]) -> Result<()> {
        self.track(|e| e.put(store, key, value))
    }

    #[allow(missing_docs)]
    pub fn put_safe(&mut self, store: u64, key: &[u8], value: &[u8]) -> Result<()> {
        self.track(|e| e.put_safe(store, key, value))
    }

    #[allow(missing_docs)]
    pub fn get(&mut self, store: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.track(|e| e.get(store, key))
    }

    #[allow(missing_docs)]
    pub fn get_safe(&mut self, store: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.track(|e| e.get_safe(store, key))
    }

    #[allow(missing_docs)]
    pub fn remove(&mut self, store: u64, key: &[u8]) -> Result<()> {
        self.track(|e| e.remove(store, key))
    }

    #[allow(missing_docs)]
    pub fn remove_safe(&mut self, store: u64, key: &[u8]) -> Result<()> {
        self.track(|e| e.remove_safe(store, key))
    }

    #[allow(missing_docs)]
    pub fn has(&mut self, store: u64, key: &[u8]) -> Result<bool> {
        self.track(|e| e.has(store, key))
    }

    #[allow(missing_docs)]
    pub fn has_safe(&mut self, store: u64, key: &[u8]) -> Result<bool> {
        self.track(|e| e.has_safe(store, key))
    }

    /// Keys and values both encoded.
    pub fn put_ttl(&mut self, key: &[u8], value: &[u8], ttl: u32) -> Result<()> {
        self.put_ttl_with(key, value, ttl, TtlEncoding::default())
    }

    #[allow(missing_docs)]
    pub fn put_ttl_with(&mut self, key: &[u8], value: &[u8], ttl: u32, encoding: TtlEncoding) -> Result<()> {
        self.track_ttl(|e| e.put_ttl(key, value, ttl, encoding))
    }

    #[allow(missing_docs)]
    pub fn get_ttl(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_ttl_with(key, TtlEncoding::default())
    }

    #[allow(missing_docs)]
    pub fn get_ttl_with(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<Option<Vec<u8>>> {
        self.track_ttl(|e| e.get_ttl(key, encoding))
    }

    #[allow(missing_docs)]
    pub fn has_ttl(&mut self, key: &[u8]) -> Result<bool> {
        self.has_ttl_with(key, TtlEncoding::default())
    }

    #[allow(missing_docs)]
    pub fn has_ttl_with(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<bool> {
        self.track_ttl(|e| e.has_ttl(key, encoding))
    }

    #[allow(missing_docs)]
    pub fn remove_ttl(&mut self, key: &[u8]) -> Result<()> {
        self.remove_ttl_with(key, TtlEncoding::default())
    }

    #[allow(missing_docs)]
    pub fn remove_ttl_with(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<()> {
        self.track_ttl(|e| e.remove_ttl(key, encoding))
    }

    #[allow(missing_docs)]
    pub fn new_iterator(&mut self, store: u64) -> Result<StoreIterator> {
        self.track(|e| e.new_iterator(store))
    }

    /// `None` once every item has been served.
    pub fn get_next(&mut self, store: u64, iter: &mut StoreIterator) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.track(|e| e.get_next(store, iter))
    }

    #[allow(missing_docs)]
    pub fn delete_iterator(&mut self, store: u64, iter: StoreIterator) -> Result<()> {
        self.track(|e| e.delete_iterator(store, iter))
    }

    #[allow(missing_docs)]
    pub fn create_or_get_lock(&mut self, name: &str) -> Result<u64> {
        self.track(|e| e.create_or_get_lock(name))
    }

    /// Block until the lock is held for `lease`, failing with `LockTimeout`
    /// after `max_wait`.
    pub fn acquire_lock(&mut self, lock: u64, lease: Duration, max_wait: Duration) -> Result<()> {
        self.track(|e| e.acquire_lock(lock, lease, max_wait))
    }

    #[allow(missing_docs)]
    pub fn release_lock(&mut self, lock: u64) -> Result<()> {
        self.track(|e| e.release_lock(lock))
    }

    #[allow(missing_docs)]
    pub fn remove_lock(&mut self, lock: u64) -> Result<()> {
        self.track(|e| e.remove_lock(lock))
    }

    #[allow(missing_docs)]
    pub fn get_pid_for_lock(&mut self, name: &str) -> Result<u32> {
        self.track(|e| e.get_pid_for_lock(name))
    }

    #[allow(missing_docs)]
    pub fn persist(&mut self) -> Result<()> {
        self.track(|e| e.persist())
    }

    #[allow(missing_docs)]
    pub fn run_command(&mut self, tokens: &[String]) -> Result<String> {
        self.track(|e| e.run_command(tokens))
    }

    #[allow(missing_docs)]
    pub fn run_http_command(&mut self, command: &HttpCommand) -> Result<HttpCommandReply> {
        self.track(|e| e.run_http_command(command))
    }
}
