use std::process;
use std::time::Duration;

use log::{error, info, warn};

use super::layout::*;
use super::{DpsEngine, TtlEncoding};
use crate::catalog::{self, KEY_TYPE_FIELD, RESERVED_FIELDS, STORE_NAME_FIELD, StoreInfo, VALUE_TYPE_FIELD};
use crate::client::{RedisClusterClient, RedisOps, RespValue};
use crate::config::{DpsConfig, LockPolicy};
use crate::encoding;
use crate::iterator::{ItemSource, StoreIterator};
use crate::lock::{self, Attempt, LockInfo};
use crate::{DpsError, Result};

type ErrorKind = fn(String) -> DpsError;

/// Adapter over Redis Cluster.
///
/// A store is one hash, `1<id>`, holding the three reserved metadata fields
/// and one field per encoded key; values are stored raw.
pub struct RedisClusterEngine<C: RedisOps = RedisClusterClient> {
    client: C,
    policy: LockPolicy,
}

impl<C: RedisOps> RedisClusterEngine<C> {
    /// Wrap a connected client and make sure the id counter exists.
    pub fn new(client: C, policy: LockPolicy) -> Result<Self> {
        let mut engine = RedisClusterEngine { client, policy };
        engine.ensure_guid()?;
        Ok(engine)
    }

    #[allow(missing_docs)]
    pub fn from_config(client: C, config: &DpsConfig) -> Result<Self> {
        Self::new(client, config.lock.clone())
    }

    fn ensure_guid(&mut self) -> Result<()> {
        self.call(&[b"SET", GUID_KEY.as_bytes(), b"0", b"NX"], DpsError::Connection)?;
        Ok(())
    }

    /// Error replies become `kind`, transport failures pass through.
    fn call(&mut self, args: &[&[u8]], kind: ErrorKind) -> Result<RespValue> {
        match self.client.command(args)? {
            RespValue::Error(msg) => Err(kind(msg)),
            reply => Ok(reply),
        }
    }

    fn integer(&mut self, args: &[&[u8]], kind: ErrorKind) -> Result<i64> {
        let reply = self.call(args, kind)?;
        reply
            .as_integer()
            .ok_or_else(|| kind(format!("expected an integer reply, got {reply:?}")))
    }

    fn bulk(&mut self, args: &[&[u8]], kind: ErrorKind) -> Result<Option<Vec<u8>>> {
        match self.call(args, kind)? {
            RespValue::BulkString(data) => Ok(Some(encoding::owned_copy(&data)?)),
            RespValue::Null => Ok(None),
            other => Err(kind(format!("expected a bulk reply, got {other:?}"))),
        }
    }

    fn parse_id(&mut self, key: &str, what: &str, kind: ErrorKind) -> Result<Option<u64>> {
        match self.bulk(&[b"GET", key.as_bytes()], kind)? {
            Some(raw) => String::from_utf8_lossy(&raw)
                .parse()
                .map(Some)
                .map_err(|_| kind(format!("corrupt id record for {what}"))),
            None => Ok(None),
        }
    }

    fn next_id(&mut self, kind: ErrorKind) -> Result<u64> {
        let id = self.integer(&[b"INCR", GUID_KEY.as_bytes()], kind)?;
        u64::try_from(id).map_err(|_| kind(format!("id counter went negative: {id}")))
    }

    fn compensate(&mut self, keys: &[&str]) {
        for key in keys {
            if let Err(e) = self.call(&[b"DEL", key.as_bytes()], DpsError::DataItemDelete) {
                error!("compensating delete of '{}' failed, metadata may be inconsistent: {}", key, e);
            }
        }
    }

    fn try_lock(&mut self, key: &str, expiry_unit: &[u8], expiry: u64) -> Result<Attempt> {
        let expiry = expiry.to_string();
        let reply = self.call(
            &[b"SET", key.as_bytes(), b"1", b"NX", expiry_unit, expiry.as_bytes()],
            DpsError::LockAcquisition,
        )?;
        Ok(match reply {
            RespValue::Null => Attempt::Busy,
            _ => Attempt::Acquired,
        })
    }

    fn acquire(&mut self, what: &str, key: &str, expiry_unit: &[u8], expiry: u64, max_wait: Option<Duration>) -> Result<()> {
        let policy = self.policy.clone();
        lock::acquire_with_retry(what, &policy, max_wait, || self.try_lock(key, expiry_unit, expiry))
    }

    fn release(&mut self, key: &str) {
        if let Err(e) = self.call(&[b"DEL", key.as_bytes()], DpsError::LockRemoval) {
            error!("releasing '{}' failed, it expires with its lease: {}", key, e);
        }
    }

    fn with_general_lock<T>(&mut self, entity: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let key = general_lock_key(entity);
        let lease = self.policy.lease_ttl_secs;
        self.acquire("general purpose lock", &key, b"EX", lease, None)?;
        let result = f(self);
        self.release(&key);
        result
    }

    fn with_store_lock<T>(&mut self, store: u64, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let key = store_lock_key(store);
        let lease = self.policy.lease_ttl_secs;
        self.acquire(&format!("store lock {store}"), &key, b"EX", lease, None)?;
        let result = f(self);
        self.release(&key);
        result
    }

    fn store_exists(&mut self, store: u64) -> Result<bool> {
        let hash = store_info_key(store);
        Ok(self.integer(&[b"EXISTS", hash.as_bytes()], DpsError::KeyExistenceCheck)? == 1)
    }

    fn ensure_store(&mut self, store: u64) -> Result<()> {
        if self.store_exists(store)? {
            Ok(())
        } else {
            Err(DpsError::InvalidStoreId(store.to_string()))
        }
    }

    /// The reserved fields, still encoded, in [`RESERVED_FIELDS`] order.
    fn reserved_fields(&mut self, store: u64) -> Result<[String; 3]> {
        let hash = store_info_key(store);
        let reply = self.call(
            &[
                b"HMGET",
                hash.as_bytes(),
                STORE_NAME_FIELD.as_bytes(),
                KEY_TYPE_FIELD.as_bytes(),
                VALUE_TYPE_FIELD.as_bytes(),
            ],
            DpsError::StoreInfo,
        )?;
        let RespValue::Array(values) = reply else {
            return Err(DpsError::StoreInfo(format!("unexpected HMGET reply {reply:?}")));
        };
        let mut fields = values.into_iter().map(|v| match v {
            RespValue::BulkString(b) => Ok(String::from_utf8_lossy(&b).to_string()),
            _ => Err(DpsError::InvalidStoreId(store.to_string())),
        });
        let mut next = || {
            fields
                .next()
                .unwrap_or_else(|| Err(DpsError::StoreInfo("short HMGET reply".to_string())))
        };
        Ok([next()?, next()?, next()?])
    }

    fn write_reserved_fields(&mut self, store: u64, fields: &[String; 3]) -> Result<()> {
        let hash = store_info_key(store);
        for (field, value) in RESERVED_FIELDS.iter().zip(fields) {
            self.call(
                &[b"HSET", hash.as_bytes(), field.as_bytes(), value.as_bytes()],
                DpsError::StoreCreation,
            )?;
        }
        Ok(())
    }

    fn put_item(&mut self, store: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let hash = store_info_key(store);
        let field = encoding::encode(key);
        self.call(&[b"HSET", hash.as_bytes(), field.as_bytes(), value], DpsError::DataItemWrite)?;
        Ok(())
    }

    fn remove_item(&mut self, store: u64, key: &[u8]) -> Result<()> {
        let hash = store_info_key(store);
        let field = encoding::encode(key);
        match self.integer(&[b"HDEL", hash.as_bytes(), field.as_bytes()], DpsError::DataItemDelete)? {
            0 => Err(DpsError::DataItemDelete(format!("no such key in store {store}"))),
            _ => Ok(()),
        }
    }

    fn read_field(&mut self, store: u64, field: &str) -> Result<Option<Vec<u8>>> {
        let hash = store_info_key(store);
        self.bulk(&[b"HGET", hash.as_bytes(), field.as_bytes()], DpsError::DataItemRead)
    }

    fn read_lock_info(&mut self, lock: u64) -> Result<LockInfo> {
        let key = lock_info_key(lock);
        let raw = self
            .bulk(&[b"GET", key.as_bytes()], DpsError::LockInfo)?
            .ok_or_else(|| DpsError::InvalidLockId(lock.to_string()))?;
        LockInfo::parse(&String::from_utf8_lossy(&raw))
    }

    fn write_lock_info(&mut self, lock: u64, info: &LockInfo) -> Result<()> {
        let key = lock_info_key(lock);
        let value = info.format();
        self.call(&[b"SET", key.as_bytes(), value.as_bytes()], DpsError::LockInfo)?;
        Ok(())
    }

    fn record_holder(&mut self, lock: u64, lease: Duration) -> Result<()> {
        let mut info = self.read_lock_info(lock)?;
        info.use_count += 1;
        info.expiry = lock::now_secs() + lease.as_secs_f64().ceil() as u64;
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
            self.call(&[b"DEL", key.as_bytes()], DpsError::LockRemoval)?;
        }
        Ok(())
    }
}

fn ttl_key(key: &[u8], encoding: TtlEncoding) -> Vec<u8> {
    if encoding.key {
        encoding::encode(key).into_bytes()
    } else {
        key.to_vec()
    }
}

fn flatten(reply: RespValue) -> Result<String> {
    match reply {
        RespValue::Error(msg) => Err(DpsError::Command(msg)),
        RespValue::Null => Err(DpsError::Command("nil reply".to_string())),
        RespValue::Array(items) => Ok(items
            .into_iter()
            .map(|item| match item {
                RespValue::Null => Ok(String::new()),
                other => flatten(other),
            })
            .collect::<Result<Vec<_>>>()?
            .join("\n")),
        RespValue::Integer(n) => Ok(n.to_string()),
        RespValue::SimpleString(s) => Ok(s),
        RespValue::BulkString(b) => Ok(String::from_utf8_lossy(&b).to_string()),
    }
}

impl<C: RedisOps> ItemSource for RedisClusterEngine<C> {
    fn store_exists(&mut self, store: u64) -> Result<bool> {
        RedisClusterEngine::store_exists(self, store)
    }

    fn list_keys(&mut self, store: u64) -> Result<Vec<String>> {
        let hash = store_info_key(store);
        let reply = self.call(&[b"HKEYS", hash.as_bytes()], DpsError::StoreIteration)?;
        let RespValue::Array(fields) = reply else {
            return Err(DpsError::StoreIteration(format!("unexpected HKEYS reply {reply:?}")));
        };
        Ok(fields
            .into_iter()
            .filter_map(|f| match f {
                RespValue::BulkString(b) => Some(String::from_utf8_lossy(&b).to_string()),
                _ => None,
            })
            .filter(|f| !catalog::is_reserved(f))
            .collect())
    }

    fn read_item(&mut self, store: u64, encoded_key: &str) -> Result<Option<Vec<u8>>> {
        self.read_field(store, encoded_key)
    }

    fn decode_key(&self, encoded_key: &str) -> Result<Vec<u8>> {
        encoding::decode(encoded_key)
    }
}

impl<C: RedisOps> DpsEngine for RedisClusterEngine<C> {
    fn product_name(&self) -> &'static str {
        "redis-cluster"
    }

    fn is_connected(&mut self) -> bool {
        matches!(self.client.command(&[b"PING"]), Ok(RespValue::SimpleString(s)) if s == "PONG")
    }

    fn reconnect(&mut self) -> Result<()> {
        self.client.reconnect()?;
        self.ensure_guid()?;
        info!("reconnected to redis cluster");
        Ok(())
    }

    fn create_store(&mut self, name: &str, key_type: &str, value_type: &str) -> Result<u64> {
        let encoded_name = encoding::encode(name.as_bytes());
        self.with_general_lock(&encoded_name, |this| {
            let name_key = store_name_key(&encoded_name);
            if this.integer(&[b"EXISTS", name_key.as_bytes()], DpsError::KeyExistenceCheck)? == 1 {
                return Err(DpsError::StoreExists(name.to_string()));
            }

            let id = this.next_id(DpsError::StoreCreation)?;
            let id_text = id.to_string();
            this.call(&[b"SET", name_key.as_bytes(), id_text.as_bytes()], DpsError::StoreCreation)?;

            let fields = [
                encoded_name.clone(),
                encoding::encode(key_type.as_bytes()),
                encoding::encode(value_type.as_bytes()),
            ];
            if let Err(e) = this.write_reserved_fields(id, &fields) {
                let hash = store_info_key(id);
                this.compensate(&[hash.as_str(), name_key.as_str()]);
                return Err(e);
            }

            info!("created store '{}' with id {}", name, id);
            Ok(id)
        })
    }

    fn find_store(&mut self, name: &str) -> Result<u64> {
        let name_key = store_name_key(&encoding::encode(name.as_bytes()));
        self.parse_id(&name_key, name, DpsError::KeyExistenceCheck)?
            .ok_or_else(|| DpsError::StoreDoesNotExist(name.to_string()))
    }

    fn remove_store(&mut self, store: u64) -> Result<()> {
        self.ensure_store(store)?;
        self.with_store_lock(store, |this| {
            let [encoded_name, _, _] = this.reserved_fields(store)?;
            let hash = store_info_key(store);
            let name_key = store_name_key(&encoded_name);
            this.call(&[b"DEL", hash.as_bytes()], DpsError::DataItemDelete)?;
            this.call(&[b"DEL", name_key.as_bytes()], DpsError::DataItemDelete)?;
            info!("removed store {}", store);
            Ok(())
        })
    }

    fn store_info(&mut self, store: u64) -> Result<StoreInfo> {
        let [name, key_type, value_type] = self.reserved_fields(store)?;
        Ok(StoreInfo {
            id: store,
            name: catalog::decode_text(&name)?,
            key_type: catalog::decode_text(&key_type)?,
            value_type: catalog::decode_text(&value_type)?,
            item_count: self.size(store)?,
        })
    }

    fn size(&mut self, store: u64) -> Result<u64> {
        let hash = store_info_key(store);
        let len = self.integer(&[b"HLEN", hash.as_bytes()], DpsError::StoreInfo)?;
        if len == 0 {
            return Err(DpsError::InvalidStoreId(store.to_string()));
        }
        Ok((len as u64).saturating_sub(RESERVED_FIELDS.len() as u64))
    }

    fn clear(&mut self, store: u64) -> Result<()> {
        self.ensure_store(store)?;
        self.with_store_lock(store, |this| {
            let fields = this.reserved_fields(store)?;
            let hash = store_info_key(store);
            this.call(&[b"DEL", hash.as_bytes()], DpsError::StoreInfo)?;
            this.write_reserved_fields(store, &fields).map_err(|e| {
                error!("store {} lost its metadata while clearing: {}", store, e);
                DpsError::StoreInfo(format!("metadata of store {store} could not be restored: {e}"))
            })
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
        self.read_field(store, &encoding::encode(key))
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
        let hash = store_info_key(store);
        let field = encoding::encode(key);
        Ok(self.integer(&[b"HEXISTS", hash.as_bytes(), field.as_bytes()], DpsError::KeyExistenceCheck)? == 1)
    }

    fn has_safe(&mut self, store: u64, key: &[u8]) -> Result<bool> {
        self.ensure_store(store)?;
        self.has(store, key)
    }

    fn put_ttl(&mut self, key: &[u8], value: &[u8], ttl: u32, encoding: TtlEncoding) -> Result<()> {
        let ttl_key = ttl_key(key, encoding);
        let stored = if encoding.value {
            encoding::encode(value).into_bytes()
        } else {
            value.to_vec()
        };
        if ttl > 0 {
            let secs = ttl.to_string();
            self.call(&[b"SET", &ttl_key, &stored, b"EX", secs.as_bytes()], DpsError::DataItemWrite)?;
        } else {
            self.call(&[b"SET", &ttl_key, &stored], DpsError::DataItemWrite)?;
        }
        Ok(())
    }

    fn get_ttl(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<Option<Vec<u8>>> {
        let ttl_key = ttl_key(key, encoding);
        match self.bulk(&[b"GET", &ttl_key], DpsError::DataItemRead)? {
            Some(raw) if encoding.value => Ok(Some(encoding::decode(&String::from_utf8_lossy(&raw))?)),
            other => Ok(other),
        }
    }

    fn has_ttl(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<bool> {
        let ttl_key = ttl_key(key, encoding);
        Ok(self.integer(&[b"EXISTS", &ttl_key], DpsError::KeyExistenceCheck)? == 1)
    }

    fn remove_ttl(&mut self, key: &[u8], encoding: TtlEncoding) -> Result<()> {
        let ttl_key = ttl_key(key, encoding);
        match self.integer(&[b"DEL", &ttl_key], DpsError::DataItemDelete)? {
            0 => Err(DpsError::DataItemDelete("no such TTL key".to_string())),
            _ => Ok(()),
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
            if let Some(id) = this.parse_id(&name_key, name, DpsError::LockInfo)? {
                return Ok(id);
            }

            let id = this.next_id(DpsError::LockInfo)?;
            let id_text = id.to_string();
            this.call(&[b"SET", name_key.as_bytes(), id_text.as_bytes()], DpsError::LockInfo)?;
            if let Err(e) = this.write_lock_info(id, &LockInfo::fresh(encoded_name.as_str())) {
                this.compensate(&[name_key.as_str()]);
                return Err(e);
            }
            Ok(id)
        })
    }

    fn acquire_lock(&mut self, lock: u64, lease: Duration, max_wait: Duration) -> Result<()> {
        self.read_lock_info(lock)?;
        let lease_ms = (lease.as_millis() as u64).max(1);
        let key = lock_key(lock);
        let policy = self.policy.clone();
        lock::acquire_with_retry(&format!("lock {lock}"), &policy, Some(max_wait), || {
            let attempt = self.try_lock(&key, b"PX", lease_ms)?;
            if attempt == Attempt::Busy {
                self.release_if_stale(lock, &key)?;
            }
            Ok(attempt)
        })?;

        if let Err(e) = self.record_holder(lock, lease) {
            self.release(&key);
            return Err(e);
        }
        Ok(())
    }

    fn release_lock(&mut self, lock: u64) -> Result<()> {
        if let Err(e) = self.clear_holder(lock) {
            error!("lock {} released without clearing its holder: {}", lock, e);
        }
        let key = lock_key(lock);
        self.call(&[b"DEL", key.as_bytes()], DpsError::LockRemoval)?;
        Ok(())
    }

    fn remove_lock(&mut self, lock: u64) -> Result<()> {
        let info = self.read_lock_info(lock)?;
        self.acquire_lock(lock, Duration::from_secs(25), Duration::from_secs(40))?;
        let name_key = lock_name_key(&info.encoded_name);
        let info_key = lock_info_key(lock);
        if let Err(e) = self.call(&[b"DEL", name_key.as_bytes()], DpsError::LockRemoval) {
            self.release(&lock_key(lock));
            return Err(e);
        }
        if let Err(e) = self.call(&[b"DEL", info_key.as_bytes()], DpsError::LockRemoval) {
            error!("lock {} lost its name but kept its info record: {}", lock, e);
        }
        let key = lock_key(lock);
        self.call(&[b"DEL", key.as_bytes()], DpsError::LockRemoval)?;
        Ok(())
    }

    fn get_pid_for_lock(&mut self, name: &str) -> Result<u32> {
        let name_key = lock_name_key(&encoding::encode(name.as_bytes()));
        let lock = self
            .parse_id(&name_key, name, DpsError::LockInfo)?
            .ok_or_else(|| DpsError::InvalidLockId(name.to_string()))?;
        Ok(self.read_lock_info(lock)?.pid)
    }

    fn persist(&mut self) -> Result<()> {
        self.integer(&[b"WAIT", b"1", b"0"], DpsError::Persist)?;
        Ok(())
    }

    fn run_command(&mut self, tokens: &[String]) -> Result<String> {
        if tokens.is_empty() {
            return Err(DpsError::Command("empty command".to_string()));
        }
        let args: Vec<&[u8]> = tokens.iter().map(|t| t.as_bytes()).collect();
        flatten(self.client.command(&args)?)
    }
}
