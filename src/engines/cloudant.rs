use std::process;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::{Map, Value, json};
use xxhash_rust::xxh3::xxh3_64;

use super::layout::*;
use super::{DpsEngine, TtlEncoding};
use crate::catalog::{self, KEY_TYPE_FIELD, RESERVED_FIELDS, STORE_NAME_FIELD, StoreInfo, VALUE_TYPE_FIELD};
use crate::client::{CloudantHttpClient, HttpOps, HttpReply, HttpVerb};
use crate::config::{DpsConfig, LockPolicy};
use crate::encoding;
use crate::iterator::{ItemSource, StoreIterator};
use crate::lock::{self, Attempt, LockInfo};
use crate::{DpsError, Result};

/// Database holding store names, lock names, lock info and lock documents.
pub const META_DB: &str = "dps_dl_meta_data";

const CONNECT_ATTEMPTS: u32 = 5;

type ErrorKind = fn(String) -> DpsError;

/// Which part of the Cloudant API a raw request addresses.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandScope {
    Database = 1,
    Document = 2,
}

/// A raw request for [`DpsEngine::run_http_command`].
#[derive(Debug, Clone)]
pub struct HttpCommand {
    #[allow(missing_docs)]
    pub scope: CommandScope,
    #[allow(missing_docs)]
    pub verb: HttpVerb,
    /// Empty means the connected base URL. Must not end with `/`.
    pub base_url: String,
    /// Must start and must not end with `/`.
    pub endpoint: String,
    /// Appended after `?` when non-empty.
    pub query: String,
    /// Request body; ignored for database level requests.
    pub json: String,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCommandReply {
    pub json: String,
    pub status: u16,
}

/// Adapter over the Cloudant/CouchDB REST API.
///
/// Every store is its own database `dps_1_<id>` whose id is a hash of the
/// store name. Documents have the shape `{"_id": k, k: v}`.
pub struct CloudantEngine<H: HttpOps = CloudantHttpClient> {
    http: H,
    policy: LockPolicy,
    base_url: String,
}

fn derived_id(seed: &str) -> u64 {
    match xxh3_64(seed.as_bytes()) {
        0 => 1,
        id => id,
    }
}

/// Id of the store named `name`. The same name always maps to the same id.
pub fn store_id_for(name: &str) -> u64 {
    derived_id(&encoding::url_safe_encode(name.as_bytes()))
}

/// Id of the user lock named `name`.
pub fn lock_id_for(name: &str) -> u64 {
    derived_id(&lock_name_key(&encoding::url_safe_encode(name.as_bytes())))
}

fn store_db(store: u64) -> String {
    format!("dps_1_{store}")
}

fn accepted(status: u16) -> bool {
    status == 201 || status == 202
}

fn parse_json(body: &str, kind: ErrorKind) -> Result<Value> {
    serde_json::from_str(body).map_err(|e| kind(format!("malformed JSON reply: {e}")))
}

impl<H: HttpOps> CloudantEngine<H> {
    /// Use `base_url` and create the meta database if needed.
    pub fn new(http: H, policy: LockPolicy, base_url: &str) -> Result<Self> {
        let mut base_url = base_url.trim_end_matches('/').to_string();
        base_url.push('/');
        let mut engine = CloudantEngine {
            http,
            policy,
            base_url,
        };
        engine.ensure_meta_db()?;
        Ok(engine)
    }

    /// The first server string is the base URL.
    pub fn from_config(http: H, config: &DpsConfig) -> Result<Self> {
        let base_url = config
            .servers
            .first()
            .ok_or_else(|| DpsError::Connection("missing access URL".to_string()))?;
        Self::new(http, config.lock.clone(), base_url)
    }

    fn ensure_meta_db(&mut self) -> Result<()> {
        let url = self.db_url(META_DB);
        let mut last = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.http.send(HttpVerb::Put, &url, None) {
                Ok(reply) if accepted(reply.status) || reply.status == 412 => {
                    debug!("meta database ready after {} attempt(s)", attempt);
                    return Ok(());
                }
                Ok(reply) => last = format!("HTTP {}: {}", reply.status, reply.body),
                Err(e) => last = e.to_string(),
            }
            warn!("creating the meta database failed on attempt {}: {}", attempt, last);
            if attempt < CONNECT_ATTEMPTS {
                let sleep = rand::thread_rng().gen_range(0..=self.policy.max_retry_sleep_ms.max(1));
                thread::sleep(Duration::from_millis(sleep));
            }
        }
        Err(DpsError::Connection(format!("cannot create the meta database: {last}")))
    }

    fn db_url(&self, db: &str) -> String {
        format!("{}{}", self.base_url, db)
    }

    fn doc_url(&self, db: &str, id: &str) -> String {
        format!("{}{}/{}", self.base_url, db, id)
    }

    fn send(&mut self, verb: HttpVerb, url: &str, body: Option<&str>) -> Result<HttpReply> {
        self.http.send(verb, url, body)
    }

    /// The `_rev` and the `id` field of a document, `None` on 404.
    fn read_doc(&mut self, db: &str, id: &str, kind: ErrorKind) -> Result<Option<(String, Option<String>)>> {
        let url = self.doc_url(db, id);
        let reply = self.send(HttpVerb::Get, &url, None)?;
        match reply.status {
            200 => {
                let doc = parse_json(&reply.body, kind)?;
                let rev = doc
                    .get("_rev")
                    .and_then(Value::as_str)
                    .ok_or_else(|| kind(format!("document '{id}' has no revision")))?
                    .to_string();
                let field = doc.get(id).and_then(Value::as_str).map(str::to_string);
                Ok(Some((rev, field)))
            }
            404 => Ok(None),
            status => Err(kind(format!("reading '{id}' from {db} failed with HTTP {status}"))),
        }
    }

    fn read_field(&mut self, db: &str, id: &str, kind: ErrorKind) -> Result<Option<String>> {
        Ok(self.read_doc(db, id, kind)?.and_then(|(_, field)| field))
    }

    /// PUT `{"_id": id, id: value}`, carrying `rev` when updating.
    fn put_doc(&mut self, db: &str, id: &str, value: &str, rev: Option<&str>) -> Result<u16> {
        let mut doc = Map::new();
        doc.insert("_id".to_string(), json!(id));
        doc.insert(id.to_string(), json!(value));
        if let Some(rev) = rev {
            doc.insert("_rev".to_string(), json!(rev));
        }
        let body = Value::Object(doc).to_string();
        let url = self.doc_url(db, id);
        Ok(self.send(HttpVerb::Put, &url, Some(&body))?.status)
    }

    /// Insert only. `false` when the document already exists.
    fn create_doc(&mut self, db: &str, id: &str, value: &str, kind: ErrorKind) -> Result<bool> {
        match self.put_doc(db, id, value, None)? {
            status if accepted(status) => Ok(true),
            409 => Ok(false),
            status => Err(kind(format!("creating '{id}' in {db} failed with HTTP {status}"))),
        }
    }

    /// Insert or overwrite.
    fn write_doc(&mut self, db: &str, id: &str, value: &str, kind: ErrorKind) -> Result<()> {
        let rev = self.read_doc(db, id, kind)?.map(|(rev, _)| rev);
        match self.put_doc(db, id, value, rev.as_deref())? {
            status if accepted(status) => Ok(()),
            status => Err(kind(format!("writing '{id}' to {db} failed with HTTP {status}"))),
        }
    }

    /// `false` when the document did not exist.
    fn delete_doc(&mut self, db: &str, id: &str, kind: ErrorKind) -> Result<bool> {
        let Some((rev, _)) = self.read_doc(db, id, kind)? else {
            return Ok(false);
        };
        let url = format!("{}?rev={}", self.doc_url(db, id), rev);
        match self.send(HttpVerb::Delete, &url, None)?.status {
            200 | 202 => Ok(true),
            404 => Ok(false),
            status => Err(kind(format!("deleting '{id}' from {db} failed with HTTP {status}"))),
        }
    }

    fn compensate_doc(&mut self, db: &str, id: &str) {
        if let Err(e) = self.delete_doc(db, id, DpsError::DataItemDelete) {
            error!("compensating delete of '{}' in {} failed, metadata may be inconsistent: {}", id, db, e);
        }
    }

    fn drop_db(&mut self, db: &str, kind: ErrorKind) -> Result<()> {
        let url = self.db_url(db);
        match self.send(HttpVerb::Delete, &url, None)?.status {
            200 | 202 | 404 => Ok(()),
            status => Err(kind(format!("deleting database {db} failed with HTTP {status}"))),
        }
    }

    /// One attempt at the lock document `key`. A stale holder is taken over
    /// by rewriting its revision; losing that write to a concurrent
    /// contender is a miss.
    fn try_lock(&mut self, key: &str, lease_secs: u64) -> Result<Attempt> {
        let now = lock::now_secs();
        let expiry = (now + lease_secs).to_string();
        if self.create_doc(META_DB, key, &expiry, DpsError::LockAcquisition)? {
            return Ok(Attempt::Acquired);
        }

        let Some((rev, held_until)) = self.read_doc(META_DB, key, DpsError::LockAcquisition)? else {
            return Ok(Attempt::Busy);
        };
        let held_until: u64 = held_until.and_then(|v| v.parse().ok()).unwrap_or(0);
        if held_until >= now {
            return Ok(Attempt::Busy);
        }

        match self.put_doc(META_DB, key, &expiry, Some(&rev))? {
            status if accepted(status) => {
                warn!("took over '{}', its lease ran out at {}", key, held_until);
                Ok(Attempt::Acquired)
            }
            409 => Ok(Attempt::Busy),
            status => Err(DpsError::LockAcquisition(format!(
                "taking over '{key}' failed with HTTP {status}"
            ))),
        }
    }

    fn acquire(&mut self, what: &str, key: &str, lease_secs: u64, max_wait: Option<Duration>) -> Result<()> {
        let policy = self.policy.clone();
        lock::acquire_with_retry(what, &policy, max_wait, || self.try_lock(key, lease_secs))
    }

    fn release(&mut self, key: &str) {
        if let Err(e) = self.delete_doc(META_DB, key, DpsError::LockRemoval) {
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
        let url = self.db_url(&store_db(store));
        match self.send(HttpVerb::Get, &url, None)?.status {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(DpsError::KeyExistenceCheck(format!(
                "checking store {store} failed with HTTP {status}"
            ))),
        }
    }

    fn ensure_store(&mut self, store: u64) -> Result<()> {
        if self.store_exists(store)? {
            Ok(())
        } else {
            Err(DpsError::InvalidStoreId(store.to_string()))
        }
    }

    /// The reserved documents, still encoded, in [`RESERVED_FIELDS`] order.
    fn reserved_fields(&mut self, store: u64) -> Result<[String; 3]> {
        let db = store_db(store);
        let mut read = |field: &str| -> Result<String> {
            self.read_field(&db, field, DpsError::StoreInfo)?
                .ok_or_else(|| DpsError::InvalidStoreId(store.to_string()))
        };
        Ok([read(STORE_NAME_FIELD)?, read(KEY_TYPE_FIELD)?, read(VALUE_TYPE_FIELD)?])
    }

    fn write_reserved_fields(&mut self, store: u64, fields: &[String; 3]) -> Result<()> {
        let db = store_db(store);
        for (field, value) in RESERVED_FIELDS.iter().zip(fields) {
            self.write_doc(&db, field, value, DpsError::StoreCreation)?;
        }
        Ok(())
    }

    fn put_item(&mut self, store: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let id = encoding::url_safe_encode(key);
        let value = encoding::url_safe_encode(value);
        self.write_doc(&store_db(store), &id, &value, DpsError::DataItemWrite)
    }

    fn remove_item(&mut self, store: u64, key: &[u8]) -> Result<()> {
        let id = encoding::url_safe_encode(key);
        if self.delete_doc(&store_db(store), &id, DpsError::DataItemDelete)? {
            Ok(())
        } else {
            Err(DpsError::DataItemDelete(format!("no such key in store {store}")))
        }
    }

    fn read_item_value(&mut self, store: u64, encoded_key: &str) -> Result<Option<Vec<u8>>> {
        match self.read_field(&store_db(store), encoded_key, DpsError::DataItemRead)? {
            Some(value) => Ok(Some(encoding::url_safe_decode(&value)?)),
            None => Ok(None),
        }
    }

    fn read_lock_info(&mut self, lock: u64) -> Result<LockInfo> {
        let raw = self
            .read_field(META_DB, &lock_info_key(lock), DpsError::LockInfo)?
            .ok_or_else(|| DpsError::InvalidLockId(lock.to_string()))?;
        LockInfo::parse(&raw)
    }

    fn write_lock_info(&mut self, lock: u64, info: &LockInfo) -> Result<()> {
        self.write_doc(META_DB, &lock_info_key(lock), &info.format(), DpsError::LockInfo)
    }

    fn not_supported(&self, what: &str) -> DpsError {
        DpsError::FeatureNotSupported(format!("{what} is not supported by cloudant"))
    }

    fn command_url(&self, command: &HttpCommand) -> Result<String> {
        let mut url = if command.base_url.is_empty() {
            self.base_url.trim_end_matches('/').to_string()
        } else {
            command.base_url.clone()
        };
        if url.ends_with('/') {
            return Err(DpsError::Command(
                "base URL is not valid, it ends with a forward slash".to_string(),
            ));
        }
        if command.endpoint.is_empty() {
            return Err(DpsError::Command("API endpoint is empty".to_string()));
        }
        if !command.endpoint.starts_with('/') {
            return Err(DpsError::Command(
                "API endpoint does not begin with a forward slash".to_string(),
            ));
        }
        if command.endpoint.len() > 1 && command.endpoint.ends_with('/') {
            return Err(DpsError::Command(
                "API endpoint ends with a forward slash".to_string(),
            ));
        }
        url.push_str(&command.endpoint);
        if !command.query.is_empty() {
            url.push('?');
            url.push_str(&command.query);
        }
        Ok(url)
    }
}

impl<H: HttpOps> ItemSource for CloudantEngine<H> {
    fn store_exists(&mut self, store: u64) -> Result<bool> {
        CloudantEngine::store_exists(self, store)
    }

    fn list_keys(&mut self, store: u64) -> Result<Vec<String>> {
        let url = format!("{}/_all_docs", self.db_url(&store_db(store)));
        let reply = self.send(HttpVerb::Get, &url, None)?;
        match reply.status {
            200 => {}
            404 => return Err(DpsError::InvalidStoreId(store.to_string())),
            status => {
                return Err(DpsError::StoreIteration(format!(
                    "listing store {store} failed with HTTP {status}"
                )));
            }
        }
        let listing = parse_json(&reply.body, DpsError::StoreIteration)?;
        let rows = listing
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| DpsError::StoreIteration("listing has no rows".to_string()))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str))
            .filter(|id| !catalog::is_reserved(id))
            .map(str::to_string)
            .collect())
    }

    fn read_item(&mut self, store: u64, encoded_key: &str) -> Result<Option<Vec<u8>>> {
        self.read_item_value(store, encoded_key)
    }

    fn decode_key(&self, encoded_key: &str) -> Result<Vec<u8>> {
        encoding::url_safe_decode(encoded_key)
    }
}

impl<H: HttpOps> DpsEngine for CloudantEngine<H> {
    fn product_name(&self) -> &'static str {
        "cloudant"
    }

    fn is_connected(&mut self) -> bool {
        let url = self.base_url.clone();
        matches!(self.send(HttpVerb::Get, &url, None), Ok(reply) if reply.status == 200)
    }

    fn reconnect(&mut self) -> Result<()> {
        self.ensure_meta_db()
    }

    fn create_store(&mut self, name: &str, key_type: &str, value_type: &str) -> Result<u64> {
        let encoded_name = encoding::url_safe_encode(name.as_bytes());
        self.with_general_lock(&encoded_name, |this| {
            let name_key = store_name_key(&encoded_name);
            if this.read_doc(META_DB, &name_key, DpsError::KeyExistenceCheck)?.is_some() {
                return Err(DpsError::StoreExists(name.to_string()));
            }

            let id = store_id_for(name);
            let db = store_db(id);
            this.write_doc(META_DB, &name_key, &id.to_string(), DpsError::StoreCreation)?;

            let url = this.db_url(&db);
            let status = match this.send(HttpVerb::Put, &url, None) {
                Ok(reply) => reply.status,
                Err(e) => {
                    this.compensate_doc(META_DB, &name_key);
                    return Err(e);
                }
            };
            if !accepted(status) {
                this.compensate_doc(META_DB, &name_key);
                return Err(DpsError::StoreCreation(format!(
                    "creating database {db} failed with HTTP {status}"
                )));
            }

            let fields = [
                encoded_name.clone(),
                encoding::url_safe_encode(key_type.as_bytes()),
                encoding::url_safe_encode(value_type.as_bytes()),
            ];
            if let Err(e) = this.write_reserved_fields(id, &fields) {
                if let Err(drop_err) = this.drop_db(&db, DpsError::StoreCreation) {
                    error!("compensating drop of {} failed: {}", db, drop_err);
                }
                this.compensate_doc(META_DB, &name_key);
                return Err(e);
            }

            info!("created store '{}' with id {}", name, id);
            Ok(id)
        })
    }

    fn find_store(&mut self, name: &str) -> Result<u64> {
        let name_key = store_name_key(&encoding::url_safe_encode(name.as_bytes()));
        let id = self
            .read_field(META_DB, &name_key, DpsError::KeyExistenceCheck)?
            .ok_or_else(|| DpsError::StoreDoesNotExist(name.to_string()))?;
        id.parse()
            .map_err(|_| DpsError::KeyExistenceCheck(format!("corrupt id record for {name}")))
    }

    fn remove_store(&mut self, store: u64) -> Result<()> {
        self.ensure_store(store)?;
        self.with_store_lock(store, |this| {
            let [encoded_name, _, _] = this.reserved_fields(store)?;
            this.drop_db(&store_db(store), DpsError::DataItemDelete)?;
            if !this.delete_doc(META_DB, &store_name_key(&encoded_name), DpsError::DataItemDelete)? {
                warn!("store {} had no name record", store);
            }
            info!("removed store {}", store);
            Ok(())
        })
    }

    fn store_info(&mut self, store: u64) -> Result<StoreInfo> {
        let [name, key_type, value_type] = self.reserved_fields(store)?;
        let text = |token: &str| -> Result<String> {
            Ok(String::from_utf8_lossy(&encoding::url_safe_decode(token)?).to_string())
        };
        Ok(StoreInfo {
            id: store,
            name: text(&name)?,
            key_type: text(&key_type)?,
            value_type: text(&value_type)?,
            item_count: self.size(store)?,
        })
    }

    fn size(&mut self, store: u64) -> Result<u64> {
        let url = self.db_url(&store_db(store));
        let reply = self.send(HttpVerb::Get, &url, None)?;
        match reply.status {
            200 => {}
            404 => return Err(DpsError::InvalidStoreId(store.to_string())),
            status => {
                return Err(DpsError::StoreInfo(format!(
                    "reading store {store} failed with HTTP {status}"
                )));
            }
        }
        let info = parse_json(&reply.body, DpsError::StoreInfo)?;
        let count = info
            .get("doc_count")
            .and_then(Value::as_u64)
            .ok_or_else(|| DpsError::StoreInfo(format!("store {store} reported no doc_count")))?;
        Ok(count.saturating_sub(RESERVED_FIELDS.len() as u64))
    }

    fn clear(&mut self, store: u64) -> Result<()> {
        self.ensure_store(store)?;
        self.with_store_lock(store, |this| {
            let fields = this.reserved_fields(store)?;
            let db = store_db(store);
            this.drop_db(&db, DpsError::StoreInfo)?;
            let url = this.db_url(&db);
            let status = this.send(HttpVerb::Put, &url, None)?.status;
            if !accepted(status) {
                error!("store {} lost its database while clearing: HTTP {}", store, status);
                return Err(DpsError::StoreInfo(format!(
                    "recreating database {db} failed with HTTP {status}"
                )));
            }
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
        self.read_item_value(store, &encoding::url_safe_encode(key))
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
        let id = encoding::url_safe_encode(key);
        Ok(self.read_doc(&store_db(store), &id, DpsError::KeyExistenceCheck)?.is_some())
    }

    fn has_safe(&mut self, store: u64, key: &[u8]) -> Result<bool> {
        self.ensure_store(store)?;
        self.has(store, key)
    }

    fn put_ttl(&mut self, _key: &[u8], _value: &[u8], _ttl: u32, _encoding: TtlEncoding) -> Result<()> {
        Err(self.not_supported("putTTL"))
    }

    fn get_ttl(&mut self, _key: &[u8], _encoding: TtlEncoding) -> Result<Option<Vec<u8>>> {
        Err(self.not_supported("getTTL"))
    }

    fn has_ttl(&mut self, _key: &[u8], _encoding: TtlEncoding) -> Result<bool> {
        Err(self.not_supported("hasTTL"))
    }

    fn remove_ttl(&mut self, _key: &[u8], _encoding: TtlEncoding) -> Result<()> {
        Err(self.not_supported("removeTTL"))
    }

    fn new_iterator(&mut self, store: u64) -> Result<StoreIterator> {
        self.ensure_store(store)?;
        Ok(StoreIterator::new(store))
    }

    fn get_next(&mut self, store: u64, iter: &mut StoreIterator) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        iter.next_item(store, self)
    }

    fn create_or_get_lock(&mut self, name: &str) -> Result<u64> {
        let encoded_name = encoding::url_safe_encode(name.as_bytes());
        self.with_general_lock(&encoded_name, |this| {
            let name_key = lock_name_key(&encoded_name);
            let id = lock_id_for(name);
            if this.read_doc(META_DB, &name_key, DpsError::LockInfo)?.is_some() {
                return Ok(id);
            }

            this.write_doc(META_DB, &name_key, &id.to_string(), DpsError::LockInfo)?;
            if let Err(e) = this.write_lock_info(id, &LockInfo::fresh(encoded_name.as_str())) {
                this.compensate_doc(META_DB, &name_key);
                return Err(e);
            }
            Ok(id)
        })
    }

    fn acquire_lock(&mut self, lock: u64, lease: Duration, max_wait: Duration) -> Result<()> {
        self.read_lock_info(lock)?;
        let lease_secs = (lease.as_secs_f64().ceil() as u64).max(1);
        let key = lock_key(lock);
        self.acquire(&format!("lock {lock}"), &key, lease_secs, Some(max_wait))?;

        let mut info = match self.read_lock_info(lock) {
            Ok(info) => info,
            Err(e) => {
                self.release(&key);
                return Err(e);
            }
        };
        info.use_count += 1;
        info.expiry = lock::now_secs() + lease_secs;
        info.pid = process::id();
        if let Err(e) = self.write_lock_info(lock, &info) {
            self.release(&key);
            return Err(e);
        }
        Ok(())
    }

    fn release_lock(&mut self, lock: u64) -> Result<()> {
        self.delete_doc(META_DB, &lock_key(lock), DpsError::LockRemoval)?;
        Ok(())
    }

    fn remove_lock(&mut self, lock: u64) -> Result<()> {
        let info = self.read_lock_info(lock)?;
        self.acquire_lock(lock, Duration::from_secs(25), Duration::from_secs(40))?;
        let name_key = lock_name_key(&info.encoded_name);
        if let Err(e) = self.delete_doc(META_DB, &name_key, DpsError::LockRemoval) {
            self.release(&lock_key(lock));
            return Err(e);
        }
        if let Err(e) = self.delete_doc(META_DB, &lock_info_key(lock), DpsError::LockRemoval) {
            error!("lock {} lost its name but kept its info record: {}", lock, e);
        }
        self.release_lock(lock)
    }

    fn get_pid_for_lock(&mut self, name: &str) -> Result<u32> {
        let lock = lock_id_for(name);
        Ok(self.read_lock_info(lock)?.pid)
    }

    fn run_http_command(&mut self, command: &HttpCommand) -> Result<HttpCommandReply> {
        let url = self.command_url(command)?;
        let body = match (command.scope, command.verb) {
            (CommandScope::Document, HttpVerb::Put | HttpVerb::Post) => Some(command.json.as_str()),
            _ => None,
        };
        let reply = self.send(command.verb, &url, body)?;
        Ok(HttpCommandReply {
            json: reply.body,
            status: reply.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_stable_and_nonzero() {
        assert_eq!(store_id_for("orders"), store_id_for("orders"));
        assert_ne!(store_id_for("orders"), store_id_for("customers"));
        assert_ne!(store_id_for(""), 0);
        assert_ne!(lock_id_for("orders"), store_id_for("orders"));
    }

    #[test]
    fn store_database_names() {
        assert_eq!(store_db(42), "dps_1_42");
    }
}
