use std::process;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::layout::*;
use super::{DpsEngine, TtlEncoding};
use crate::catalog::{self, SegmentedInfo, StoreInfo};
use crate::client::{MemcachedClient, MemcachedOps, is_valid_memcached_key};
use crate::config::{DpsConfig, LockPolicy};
use crate::encoding;
use crate::iterator::{ItemSource, StoreIterator};
use crate::lock::{self, Attempt, LockInfo};
use crate::{DpsError, Result};

// Larger exptimes are read by memcached as absolute Unix times.
const MAX_RELATIVE_EXPTIME: u64 = 30 * 24 * 60 * 60;

/// Adapter over the memcached text protocol.
///
/// Memcached has no container types and caps value sizes, so a store is an
/// info record plus a chain of catalog segments listing its encoded keys.
/// Each item value is prefixed with the index of the segment that holds its
/// key token.
pub struct MemcachedEngine<C: MemcachedOps = MemcachedClient> {
    client: C,
    policy: LockPolicy,
    max_segment_size: usize,
}

impl<C: MemcachedOps> MemcachedEngine<C> {
    /// Wrap a connected client and make sure the id counter exists.
    pub fn new(client: C, policy: LockPolicy, max_segment_size: usize) -> Result<Self> {
        let mut engine = MemcachedEngine {
            client,
            policy,
            max_segment_size,
        };
        engine.ensure_guid()?;
        Ok(engine)
    }

    #[allow(missing_docs)]
    pub fn from_config(client: C, config: &DpsConfig) -> Result<Self> {
        Self::new(client, config.lock.clone(), config.max_catalog_segment_size)
    }

    fn ensure_guid(&mut self) -> Result<()> {
        let guid = self
            .client
            .get(GUID_KEY)
            .map_err(|e| DpsError::Connection(format!("cannot read the id counter: {e}")))?;
        if guid.is_none() {
            // Losing this race to another process is fine.
            self.client
                .add(GUID_KEY, b"0", 0)
                .map_err(|e| DpsError::Connection(format!("cannot create the id counter: {e}")))?;
        }
        Ok(())
    }

    fn next_id(&mut self) -> Result<u64> {
        self.client
            .incr(GUID_KEY, 1)?
            .ok_or_else(|| DpsError::StoreCreation("the id counter is missing".to_string()))
    }

    // Best effort; a failure leaves orphaned records behind.
    fn compensate(&mut self, keys: &[&str]) {
        for key in keys {
            if let Err(e) = self.client.delete(key) {
                error!("compensating delete of '{}' failed, metadata may be inconsistent: {}", key, e);
            }
        }
    }

    fn acquire(&mut self, what: &str, key: &str, lease_secs: u64, max_wait: Option<Duration>) -> Result<()> {
        let policy = self.policy.clone();
        let client = &mut self.client;
        lock::acquire_with_retry(what, &policy, max_wait, || {
            Ok(if client.add(key, b"1", exptime(lease_secs))? {
                Attempt::Acquired
            } else {
                Attempt::Busy
            })
        })
    }

    fn release(&mut self, key: &str) {
        if let Err(e) = self.client.delete(key) {
            error!("releasing '{}' failed, it expires with its lease: {}", key, e);
        }
    }

    fn with_general_lock<T>(&mut self, entity: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let key = general_lock_key(entity);
        let lease = self.policy.lease_ttl_secs;
        self.acquire("general purpose lock", &key, lease, None)?;
        let result = f(self);
        self.release(&key);
        result
    }

    fn with_store_lock<T>(&mut self, store: u64, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let key = store_lock_key(store);
        let lease = self.policy.lease_ttl_secs;
        self.acquire(&format!("store lock {store}"), &key, lease, None)?;
        let result = f(self);
        self.release(&key);
        result
    }

    fn store_exists(&mut self, store: u64) -> Result<bool> {
        self.client
            .get(&store_info_key(store))
            .map(|v| v.is_some())
            .map_err(|e| DpsError::KeyExistenceCheck(format!("store {store}: {e}")))
    }

    fn ensure_store(&mut self, store: u64) -> Result<()> {
        if self.store_exists(store)? {
            Ok(())
        } else {
            Err(DpsError::InvalidStoreId(store.to_string()))
        }
    }

    fn read_info(&mut self, store: u64) -> Result<SegmentedInfo> {
        let raw = self
            .client
            .get(&store_info_key(store))?
            .ok_or_else(|| DpsError::InvalidStoreId(store.to_string()))?;
        SegmentedInfo::parse(&text(raw, "store info")?)
    }

    fn write_info(&mut self, store: u64, info: &SegmentedInfo) -> Result<()> {
        self.client
            .set(&store_info_key(store), info.format().as_bytes(), 0)
            .map_err(|e| DpsError::StoreInfo(format!("cannot update info of store {store}: {e}")))
    }

    fn read_segment(&mut self, store: u64, segment: u32) -> Result<String> {
        let raw = self
            .client
            .get(&catalog_key(store, segment))
            .map_err(|e| DpsError::CatalogRead(e.to_string()))?
            .ok_or_else(|| DpsError::CatalogRead(format!("segment {segment} of store {store} is missing")))?;
        text(raw, "catalog segment")
    }

    fn write_segment(&mut self, store: u64, segment: u32, content: &str) -> Result<()> {
        self.client
            .set(&catalog_key(store, segment), content.as_bytes(), 0)
            .map_err(|e| DpsError::CatalogWrite(format!("segment {segment} of store {store}: {e}")))
    }

    fn restore_segment(&mut self, store: u64, segment: u32, content: &str) {
        if let Err(e) = self.write_segment(store, segment, content) {
            error!("restoring segment {} of store {} failed: {}", segment, store, e);
        }
    }

    fn put_item(&mut self, store: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let token = encoding::encode(key);
        let data_key = item_key(store, &token);

        let existing = self
            .client
            .get(&data_key)
            .map_err(|e| DpsError::KeyExistenceCheck(e.to_string()))?;
        if let Some(raw) = existing {
            let (segment, _) = catalog::split_tagged_value(&raw)?;
            return self
                .client
                .set(&data_key, &catalog::tag_value(segment, value), 0)
                .map_err(|e| DpsError::DataItemWrite(e.to_string()));
        }

        if token.len() > self.max_segment_size {
            return Err(DpsError::CatalogSegmentCreation(format!(
                "an encoded key of {} bytes cannot fit a {} byte segment",
                token.len(),
                self.max_segment_size
            )));
        }

        let mut info = self.read_info(store)?;
        if !catalog::fits(info.last_segment_size, &token, self.max_segment_size) {
            let next = info.segment_count + 1;
            self.client
                .set(&catalog_key(store, next), b"", 0)
                .map_err(|e| DpsError::CatalogSegmentCreation(e.to_string()))?;
            info.segment_count = next;
            info.last_segment_size = 0;
        }
        let segment = info.segment_count;
        let previous = self.read_segment(store, segment)?;

        self.client
            .set(&data_key, &catalog::tag_value(segment, value), 0)
            .map_err(|e| DpsError::DataItemWrite(e.to_string()))?;

        let mut updated = previous.clone();
        catalog::append_token(&mut updated, &token);
        if let Err(e) = self.write_segment(store, segment, &updated) {
            self.compensate(&[data_key.as_str()]);
            return Err(e);
        }

        info.item_count += 1;
        info.last_segment_size = updated.len();
        if let Err(e) = self.write_info(store, &info) {
            self.restore_segment(store, segment, &previous);
            self.compensate(&[data_key.as_str()]);
            return Err(e);
        }
        Ok(())
    }

    fn remove_item(&mut self, store: u64, key: &[u8]) -> Result<()> {
        let token = encoding::encode(key);
        let data_key = item_key(store, &token);
        let raw = self
            .client
            .get(&data_key)?
            .ok_or_else(|| DpsError::DataItemDelete(format!("no such key in store {store}")))?;
        let (segment, _) = catalog::split_tagged_value(&raw)?;

        let info = self.read_info(store)?;
        let content = self.read_segment(store, segment)?;
        let remaining = catalog::remove_token(&content, &token).ok_or_else(|| {
            DpsError::CatalogRead(format!("key missing from segment {segment} of store {store}"))
        })?;

        // The catalog goes first; the item is deleted only once nothing lists it.
        self.write_segment(store, segment, &remaining)?;
        let mut updated = info.clone();
        updated.item_count = updated.item_count.saturating_sub(1);
        if segment == updated.segment_count {
            updated.last_segment_size = remaining.len();
        }
        if let Err(e) = self.write_info(store, &updated) {
            self.restore_segment(store, segment, &content);
            return Err(e);
        }

        match self.client.delete(&data_key) {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!("item of store {} vanished before its delete", store);
                Ok(())
            }
            Err(e) => {
                self.restore_segment(store, segment, &content);
                if let Err(restore) = self.write_info(store, &info) {
                    error!("restoring info of store {} failed: {}", store, restore);
                }
                Err(DpsError::DataItemDelete(format!("store {store}: {e}")))
            }
        }
    }

    fn read_item_value(&mut self, store: u64, encoded_key: &str) -> Result<Option<Vec<u8>>> {
        let raw = self
            .client
            .get(&item_key(store, encoded_key))
            .map_err(|e| DpsError::DataItemRead(e.to_string()))?;
        match raw {
            Some(raw) => {
                let (_, value) = catalog::split_tagged_value(&raw)?;
                Ok(Some(encoding::owned_copy(value)?))
            }
            None => Ok(None),
        }
    }

    fn read_lock_info(&mut self, lock: u64) -> Result<LockInfo> {
        let raw = self
            .client
            .get(&lock_info_key(lock))
            .map_err(|e| DpsError::LockInfo(e.to_string()))?
            .ok_or_else(|| DpsError::InvalidLockId(lock.to_string()))?;
        LockInfo::parse(&text(raw, "lock info")?)
    }

    fn write_lock_info(&mut self, lock: u64, info: &LockInfo) -> Result<()> {
        self.client
            .set(&lock_info_key(lock), info.format().as_bytes(), 0)
            .map_err(|e| DpsError::LockInfo(format!("cannot update info of lock {lock}: {e}")))
    }

    fn record_holder(&mut self, lock: u64, lease_secs: u64) -> Result<()> {
        let mut info = self.read_lock_info(lock)?;
        info.use_count += 1;
        info.expiry = lock::now_secs() + lease_secs;
        info.pid = process::id();
        self.write_lock_info(lock, &info)
    }

    fn clear_holder(&mut self, lock: u64) -> Result<()> {
        let mut info = self.read_lock_info(lock)?;
        info.expiry = 0;
        info.pid = 0;
        self.write_lock_info(lock, &info)
    }

    /// Drops a lock record whose holder let its recorded lease run out.
    fn release_if_stale(&mut self, lock: u64, key: &str) -> Result<()> {
        let info = self.read_lock_info(lock)?;
        if info.is_expired(lock::now_secs()) {
            warn!("lock {} held by pid {} outlived its lease ending at {}, releasing it", lock, info.pid, info.expiry);
            self.client.delete(key)?;
        }
        Ok(())
    }
}

fn text(raw: Vec<u8>, what: &str) -> Result<String> {
    String::from_utf8(raw).map_err(|_| DpsError::Protocol(format!("{what} is not utf-8")))
}

fn exptime(secs: u64) -> u32 {
    let exptime = if secs > MAX_RELATIVE_EXPTIME {
        lock::now_secs().saturating_add(secs)
    } else {
        secs
    };
    u32::try_from(exptime).unwrap_or(u32::MAX)
}

fn ttl_key(key: &[u8], encoding: TtlEncoding) -> Result<String> {
    if encoding.key {
        return Ok(encoding::encode(key));
    }
    match String::from_utf8(key.to_vec()) {
        Ok(text) if is_valid_memcached_key(&text) => Ok(text),
        _ => Err(DpsError::DataItemWrite(
            "an unencoded TTL key must be 1..=250 printable bytes".to_string(),
        )),
    }
}

impl<C: MemcachedOps> ItemSource for MemcachedEngine<C> {
    fn store_exists(&mut self, store: u64) -> Result<bool> {
        MemcachedEngine::store_exists(self, store)
    }

    fn list_keys(&mut self, store: u64) -> Result<Vec<String>> {
        let info = self.read_info(store)?;
        let mut keys = Vec::with_capacity(info.item_count as usize);
        for segment in 1..=info.segment_count {
            let content = self.read_segment(store, segment)?;
            keys.extend(catalog::tokens(&content).map(str::to_string));
        }
        Ok(keys)
    }

    fn read_item(&mut self, store: u64, encoded_key: &str) -> Result<Option<Vec<u8>>> {
        self.read_item_value(store, encoded_key)
    }

    fn decode_key(&self, encoded_key: &str) -> Result<Vec<u8>> {
        encoding::decode(encoded_key)
    }
}

impl<C: MemcachedOps> DpsEngine for MemcachedEngine<C> {
    fn product_name(&self) -> &'static str {
        "memcached"
    }

    fn is_connected(&mut self) -> bool {
        self.client.version().is_ok()
    }

    fn reconnect(&mut self) -> Result<()> {
        self.client.reconnect()?;
        self.ensure_guid()?;
        info!("reconnected to memcached");
        Ok(())
    }

    fn create_store(&mut self, name: &str, key_type: &str, value_type: &str) -> Result<u64> {
        let encoded_name = encoding::encode(name.as_bytes());
        self.with_general_lock(&encoded_name, |this| {
            let name_key = store_name_key(&encoded_name);
            let existing = this
                .client
                .get(&name_key)
                .map_err(|e| DpsError::KeyExistenceCheck(e.to_string()))?;
            if existing.is_some() {
                return Err(DpsError::StoreExists(name.to_string()));
            }

            let id = this.next_id()?;
            this.client
                .set(&name_key, id.to_string().as_bytes(), 0)
                .map_err(|e| DpsError::StoreCreation(format!("name record of '{name}': {e}")))?;

            let info_key = store_info_key(id);
            let info = SegmentedInfo::empty(name, key_type, value_type);
            if let Err(e) = this.client.set(&info_key, info.format().as_bytes(), 0) {
                this.compensate(&[name_key.as_str()]);
                return Err(DpsError::StoreCreation(format!("info record of '{name}': {e}")));
            }
            if let Err(e) = this.client.set(&catalog_key(id, 1), b"", 0) {
                this.compensate(&[name_key.as_str(), info_key.as_str()]);
                return Err(DpsError::StoreCreation(format!("catalog of '{name}': {e}")));
            }

            info!("created store '{}' with id {}", name, id);
            Ok(id)
        })
    }

    fn find_store(&mut self, name: &str) -> Result<u64> {
        let name_key = store_name_key(&encoding::encode(name.as_bytes()));
        let raw = self
            .client
            .get(&name_key)
            .map_err(|e| DpsError::KeyExistenceCheck(e.to_string()))?
            .ok_or_else(|| DpsError::StoreDoesNotExist(name.to_string()))?;
        text(raw, "store id")?
            .parse()
            .map_err(|_| DpsError::StoreInfo(format!("corrupt id record for store '{name}'")))
    }

    fn remove_store(&mut self, store: u64) -> Result<()> {
        self.ensure_store(store)?;
        self.with_store_lock(store, |this| {
            let info = this.read_info(store)?;
            for segment in 1..=info.segment_count {
                if let Ok(content) = this.read_segment(store, segment) {
                    for token in catalog::tokens(&content) {
                        this.client.delete(&item_key(store, token))?;
                    }
                }
                this.client.delete(&catalog_key(store, segment))?;
            }
            this.client.delete(&store_info_key(store))?;
            this.client.delete(&store_name_key(&info.encoded_name))?;
            info!("removed store {}", store);
            Ok(())
        })
    }

    fn store_info(&mut self, store: u64) -> Result<StoreInfo> {
        self.read_info(store)?.to_store_info(store)
    }

    fn size(&mut self, store: u64) -> Result<u64> {
        Ok(self.read_info(store)?.item_count)
    }

    fn clear(&mut self, store: u64) -> Result<()> {
        self.ensure_store(store)?;
        self.with_store_lock(store, |this| {
            let mut info = this.read_info(store)?;
            for segment in 1..=info.segment_count {
                let content = this.read_segment(store, segment)?;
                for token in catalog::tokens(&content) {
                    this.client.delete(&item_key(store, token))?;
                }
                if segment > 1 {
                    this.client.delete(&catalog_key(store, segment))?;
                }
            }
            this.write_segment(store, 1, "")?;
            info.item_count = 0;
            info.segment_count = 1;
            info.last_segment_size = 0;
            this.write_info(store, &info)
        })
    }

    fn put(&mut self, store: u64, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_item(store, key, value)
    }

    fn put_safe(&mut self, store: u64, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_store(store)?;
        self.with_store_lock(store, |this| this.put_item(store, key, value))
    }

    fn get(&mut self, store: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_item_value(store, &encoding::encode(key))
    }

    fn get_safe(&mut self, store: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_store(store)?;
        self.get(store, key)
    }

    fn remove(&mut self, store: u64, key: &[u8]) -> Result<()> {
        self.remove_item(store, key)
    }

    fn remove_safe(&mut self, store: u64, key: &[u8]) -> Result<()> {
        self.ensure_store(store)?;
        self.with_store_lock(store, |this| this.remove_item(store, key))
    }

    fn has(&mut self, store: u64, key: &[u8]) -> Result<bool> {
        self.client
            .get(&item_key(store, &encoding::encode(key)))
            .map(|v| v.is_some())
            .map_err(|e| DpsError::KeyExistenceCheck(e.to_string()))
    }

    fn has_safe(&mut self, store: u64, key: &[u8]) -> Result<bool> {
        self.ensure_store(store)?;
        self.has(store, key)
    }

    fn put_ttl(&mut self, key: &[u8], value: &[u8], ttl: u32, encoding: TtlEncoding) -> Result<()> {
        let ttl_key = ttl_key(key, encoding)?;
        let stored = if encoding.value {
            encoding::encode(value).into_bytes()
        } else {
            value.to_vec()
        };
        self.client
            .set(&ttl_key, &stored, exptime(u64::from(ttl)))
            .map_err(|e| DpsError::DataItemWrite(format!("TTL key: {e}")))
    }

    fn get_ttl(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<Option<Vec<u8>>> {
        let ttl_key = ttl_key(key, encoding)?;
        let raw = self
            .client
            .get(&ttl_key)
            .map_err(|e| DpsError::DataItemRead(format!("TTL key: {e}")))?;
        match raw {
            Some(raw) if encoding.value => Ok(Some(encoding::decode(&text(raw, "TTL value")?)?)),
            Some(raw) => Ok(Some(raw)),
            None => Ok(None),
        }
    }

    fn has_ttl(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<bool> {
        let ttl_key = ttl_key(key, encoding)?;
        self.client
            .get(&ttl_key)
            .map(|v| v.is_some())
            .map_err(|e| DpsError::KeyExistenceCheck(format!("TTL key: {e}")))
    }

    fn remove_ttl(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<()> {
        let ttl_key = ttl_key(key, encoding)?;
        if self.client.delete(&ttl_key)? {
            Ok(())
        } else {
            Err(DpsError::DataItemDelete("no such TTL key".to_string()))
        }
    }

    fn new_iterator(&mut self, store: u64) -> Result<StoreIterator> {
        self.ensure_store(store)?;
        Ok(StoreIterator::new(store))
    }

    fn get_next(&mut self, store: u64, iter: &mut StoreIterator) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        iter.next_item(store, self)
    }

    fn create_or_get_lock(&mut self, name: &str) -> Result<u64> {
        let encoded_name = encoding::encode(name.as_bytes());
        self.with_general_lock(&encoded_name, |this| {
            let name_key = lock_name_key(&encoded_name);
            if let Some(raw) = this.client.get(&name_key)? {
                return text(raw, "lock id")?
                    .parse()
                    .map_err(|_| DpsError::LockInfo(format!("corrupt id record for lock '{name}'")));
            }

            let id = this
                .client
                .incr(GUID_KEY, 1)?
                .ok_or_else(|| DpsError::LockInfo("the id counter is missing".to_string()))?;
            this.client
                .set(&name_key, id.to_string().as_bytes(), 0)
                .map_err(|e| DpsError::LockInfo(format!("name record of lock '{name}': {e}")))?;
            if let Err(e) = this.write_lock_info(id, &LockInfo::fresh(encoded_name.as_str())) {
                this.compensate(&[name_key.as_str()]);
                return Err(e);
            }
            Ok(id)
        })
    }

    fn acquire_lock(&mut self, lock: u64, lease: Duration, max_wait: Duration) -> Result<()> {
        self.read_lock_info(lock)?;
        let lease_secs = (lease.as_secs_f64().ceil() as u64).max(1);
        let key = lock_key(lock);
        let policy = self.policy.clone();
        lock::acquire_with_retry(&format!("lock {lock}"), &policy, Some(max_wait), || {
            if self.client.add(&key, b"1", exptime(lease_secs))? {
                return Ok(Attempt::Acquired);
            }
            self.release_if_stale(lock, &key)?;
            Ok(Attempt::Busy)
        })?;

        if let Err(e) = self.record_holder(lock, lease_secs) {
            self.release(&key);
            return Err(e);
        }
        Ok(())
    }

    fn release_lock(&mut self, lock: u64) -> Result<()> {
        if let Err(e) = self.clear_holder(lock) {
            error!("lock {} released without clearing its holder: {}", lock, e);
        }
        self.client.delete(&lock_key(lock))?;
        Ok(())
    }

    fn remove_lock(&mut self, lock: u64) -> Result<()> {
        let info = self.read_lock_info(lock)?;
        self.acquire_lock(lock, Duration::from_secs(25), Duration::from_secs(40))?;
        let name_key = lock_name_key(&info.encoded_name);
        if let Err(e) = self.client.delete(&name_key) {
            self.release(&lock_key(lock));
            return Err(DpsError::LockRemoval(format!("lock {lock}: {e}")));
        }
        if let Err(e) = self.client.delete(&lock_info_key(lock)) {
            error!("lock {} lost its name but kept its info record: {}", lock, e);
        }
        self.client.delete(&lock_key(lock))?;
        Ok(())
    }

    fn get_pid_for_lock(&mut self, name: &str) -> Result<u32> {
        let name_key = lock_name_key(&encoding::encode(name.as_bytes()));
        let raw = self
            .client
            .get(&name_key)?
            .ok_or_else(|| DpsError::InvalidLockId(name.to_string()))?;
        let lock: u64 = text(raw, "lock id")?
            .parse()
            .map_err(|_| DpsError::LockInfo(format!("corrupt id record for lock '{name}'")))?;
        Ok(self.read_lock_info(lock)?.pid)
    }
}
