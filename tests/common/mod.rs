#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};

use dps::Result;
use dps::client::{HttpOps, HttpReply, HttpVerb, MemcachedOps, RedisOps, RespValue};
use dps::config::LockPolicy;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn quick_policy() -> LockPolicy {
    LockPolicy {
        max_attempts: 10_000,
        lease_ttl_secs: 5,
        max_retry_sleep_ms: 5,
    }
}

fn deadline(secs: u64) -> Option<Instant> {
    (secs > 0).then(|| Instant::now() + Duration::from_secs(secs))
}

fn expired(at: &Option<Instant>) -> bool {
    matches!(at, Some(at) if Instant::now() >= *at)
}

/// A memcached server in memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct FakeMemcached {
    items: Arc<Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>>,
}

impl FakeMemcached {
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let items = self.items.lock();
        let mut keys: Vec<String> = items
            .iter()
            .filter(|(k, (_, at))| k.starts_with(prefix) && !expired(at))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        let items = self.items.lock();
        items.get(key).filter(|(_, at)| !expired(at)).map(|(v, _)| v.clone())
    }
}

impl MemcachedOps for FakeMemcached {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.raw(key))
    }

    fn set(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<()> {
        self.items
            .lock()
            .insert(key.to_string(), (value.to_vec(), deadline(exptime as u64)));
        Ok(())
    }

    fn add(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<bool> {
        let mut items = self.items.lock();
        if let Some((_, at)) = items.get(key) {
            if !expired(at) {
                return Ok(false);
            }
        }
        items.insert(key.to_string(), (value.to_vec(), deadline(exptime as u64)));
        Ok(true)
    }

    fn delete(&mut self, key: &str) -> Result<bool> {
        Ok(matches!(self.items.lock().remove(key), Some((_, at)) if !expired(&at)))
    }

    fn incr(&mut self, key: &str, delta: u64) -> Result<Option<u64>> {
        let mut items = self.items.lock();
        match items.get_mut(key) {
            Some((value, at)) if !expired(at) => {
                let next = String::from_utf8_lossy(value).parse::<u64>().unwrap_or(0) + delta;
                *value = next.to_string().into_bytes();
                Ok(Some(next))
            }
            _ => Ok(None),
        }
    }

    fn version(&mut self) -> Result<String> {
        Ok("1.6.21".to_string())
    }

    fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

enum Entry {
    Text(Vec<u8>, Option<Instant>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
}

/// Just enough of a Redis node for the adapter. Clones share the same data.
#[derive(Clone, Default)]
pub struct FakeRedis {
    data: Arc<Mutex<HashMap<Vec<u8>, Entry>>>,
}

fn bulk(data: &[u8]) -> RespValue {
    RespValue::BulkString(Bytes::copy_from_slice(data))
}

fn wrong_type() -> RespValue {
    RespValue::Error("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
}

impl FakeRedis {
    pub fn key_count(&self) -> usize {
        self.data.lock().len()
    }

    fn purge(data: &mut HashMap<Vec<u8>, Entry>, key: &[u8]) {
        if matches!(data.get(key), Some(Entry::Text(_, at)) if expired(at)) {
            data.remove(key);
        }
    }

    fn execute(data: &mut HashMap<Vec<u8>, Entry>, args: &[&[u8]]) -> RespValue {
        let name = String::from_utf8_lossy(args[0]).to_ascii_uppercase();
        if let Some(key) = args.get(1) {
            Self::purge(data, key);
        }
        let int = |n: usize| RespValue::Integer(n as i64);
        match (name.as_str(), &args[1..]) {
            ("PING", _) => RespValue::SimpleString("PONG".to_string()),
            ("WAIT", _) => RespValue::Integer(0),
            ("SET", [key, value, options @ ..]) => {
                let mut nx = false;
                let mut expiry = None;
                let mut i = 0;
                while i < options.len() {
                    let option = String::from_utf8_lossy(options[i]).to_ascii_uppercase();
                    match option.as_str() {
                        "NX" => nx = true,
                        "EX" | "PX" => {
                            let n: u64 = String::from_utf8_lossy(options[i + 1]).parse().unwrap();
                            let ttl = if option == "EX" {
                                Duration::from_secs(n)
                            } else {
                                Duration::from_millis(n)
                            };
                            expiry = Some(Instant::now() + ttl);
                            i += 1;
                        }
                        _ => return RespValue::Error("ERR syntax error".to_string()),
                    }
                    i += 1;
                }
                if nx && data.contains_key(*key) {
                    return RespValue::Null;
                }
                data.insert(key.to_vec(), Entry::Text(value.to_vec(), expiry));
                RespValue::ok()
            }
            ("GET", [key]) => match data.get(*key) {
                Some(Entry::Text(v, _)) => bulk(v),
                Some(Entry::Hash(_)) => wrong_type(),
                None => RespValue::Null,
            },
            ("DEL", keys) => {
                let mut removed = 0;
                for key in keys {
                    Self::purge(data, key);
                    if data.remove(*key).is_some() {
                        removed += 1;
                    }
                }
                int(removed)
            }
            ("EXISTS", [key]) => int(data.contains_key(*key) as usize),
            ("INCR", [key]) => {
                let current = match data.get(*key) {
                    Some(Entry::Text(v, _)) => String::from_utf8_lossy(v).parse::<i64>().unwrap_or(0),
                    Some(Entry::Hash(_)) => return wrong_type(),
                    None => 0,
                };
                let next = current + 1;
                data.insert(key.to_vec(), Entry::Text(next.to_string().into_bytes(), None));
                RespValue::Integer(next)
            }
            ("HSET", [key, field, value]) => {
                let entry = data.entry(key.to_vec()).or_insert_with(|| Entry::Hash(BTreeMap::new()));
                match entry {
                    Entry::Hash(h) => int(h.insert(field.to_vec(), value.to_vec()).is_none() as usize),
                    Entry::Text(..) => wrong_type(),
                }
            }
            ("HDEL", [key, field]) => {
                let removed = match data.get_mut(*key) {
                    Some(Entry::Hash(h)) => h.remove(*field).is_some(),
                    Some(Entry::Text(..)) => return wrong_type(),
                    None => false,
                };
                if matches!(data.get(*key), Some(Entry::Hash(h)) if h.is_empty()) {
                    data.remove(*key);
                }
                int(removed as usize)
            }
            (cmd, [key, fields @ ..]) if cmd.starts_with('H') => {
                let empty = BTreeMap::new();
                let hash = match data.get(*key) {
                    Some(Entry::Hash(h)) => h,
                    Some(Entry::Text(..)) => return wrong_type(),
                    None => &empty,
                };
                match (cmd, fields) {
                    ("HGET", [field]) => hash.get(*field).map(|v| bulk(v)).unwrap_or(RespValue::Null),
                    ("HMGET", fields) => RespValue::Array(
                        fields
                            .iter()
                            .map(|f| hash.get(*f).map(|v| bulk(v)).unwrap_or(RespValue::Null))
                            .collect(),
                    ),
                    ("HEXISTS", [field]) => int(hash.contains_key(*field) as usize),
                    ("HLEN", []) => int(hash.len()),
                    ("HKEYS", []) => RespValue::Array(hash.keys().map(|k| bulk(k)).collect()),
                    _ => RespValue::Error(format!("ERR wrong number of arguments for '{cmd}'")),
                }
            }
            _ => RespValue::Error(format!("ERR unknown command '{name}'")),
        }
    }
}

impl RedisOps for FakeRedis {
    fn command(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        let mut data = self.data.lock();
        Ok(Self::execute(&mut data, args))
    }

    fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

pub const COUCH_URL: &str = "http://couch.test";

#[derive(Default)]
struct Couch {
    dbs: HashMap<String, BTreeMap<String, (u64, Value)>>,
    /// Doc id whose next revision-carrying PUT loses to a concurrent writer.
    steal: Option<(String, String)>,
}

/// A CouchDB server in memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct FakeCouch {
    state: Arc<Mutex<Couch>>,
}

fn reply(status: u16, body: Value) -> HttpReply {
    HttpReply {
        status,
        body: body.to_string(),
    }
}

fn with_rev(doc: &Value, rev: u64) -> Value {
    let mut doc = doc.clone();
    doc["_rev"] = json!(format!("{rev}-fake"));
    doc
}

impl FakeCouch {
    pub fn has_db(&self, db: &str) -> bool {
        self.state.lock().dbs.contains_key(db)
    }

    /// Write a document directly, bypassing revision checks.
    pub fn put_raw(&self, db: &str, id: &str, value: &str) {
        let mut state = self.state.lock();
        let docs = state.dbs.entry(db.to_string()).or_default();
        let rev = docs.get(id).map_or(1, |(rev, _)| rev + 1);
        docs.insert(id.to_string(), (rev, json!({ "_id": id, id: value })));
    }

    pub fn field(&self, db: &str, id: &str) -> Option<String> {
        let state = self.state.lock();
        state.dbs.get(db)?.get(id)?.1.get(id)?.as_str().map(str::to_string)
    }

    /// The next PUT with a `_rev` on `id` finds it already rewritten to `value`.
    pub fn steal_on_takeover(&self, id: &str, value: &str) {
        self.state.lock().steal = Some((id.to_string(), value.to_string()));
    }

    fn handle(state: &mut Couch, verb: HttpVerb, url: &str, body: Option<&str>) -> HttpReply {
        let path = url.strip_prefix(COUCH_URL).unwrap_or(url).trim_start_matches('/');
        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        let rev_param = query.strip_prefix("rev=");
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();

        match (verb, parts.as_slice()) {
            (HttpVerb::Get, []) => reply(200, json!({ "couchdb": "Welcome" })),
            (HttpVerb::Put, [db]) => {
                if state.dbs.contains_key(*db) {
                    reply(412, json!({ "error": "file_exists" }))
                } else {
                    state.dbs.insert(db.to_string(), BTreeMap::new());
                    reply(201, json!({ "ok": true }))
                }
            }
            (HttpVerb::Delete, [db]) => match state.dbs.remove(*db) {
                Some(_) => reply(200, json!({ "ok": true })),
                None => reply(404, json!({ "error": "not_found" })),
            },
            (HttpVerb::Get, [db]) => match state.dbs.get(*db) {
                Some(docs) => reply(200, json!({ "db_name": db, "doc_count": docs.len() })),
                None => reply(404, json!({ "error": "not_found" })),
            },
            (HttpVerb::Get, [db, "_all_docs"]) => match state.dbs.get(*db) {
                Some(docs) => {
                    let rows: Vec<Value> = docs.keys().map(|id| json!({ "id": id, "key": id })).collect();
                    reply(200, json!({ "total_rows": rows.len(), "rows": rows }))
                }
                None => reply(404, json!({ "error": "not_found" })),
            },
            (verb, [db, id]) => {
                let steal = state.steal.clone();
                let Some(docs) = state.dbs.get_mut(*db) else {
                    return reply(404, json!({ "error": "not_found", "reason": "Database does not exist." }));
                };
                let current = docs.get(*id).map(|(rev, _)| format!("{rev}-fake"));
                match verb {
                    HttpVerb::Get | HttpVerb::Head => match docs.get(*id) {
                        Some((rev, doc)) => reply(200, with_rev(doc, *rev)),
                        None => reply(404, json!({ "error": "not_found" })),
                    },
                    HttpVerb::Put | HttpVerb::Post => {
                        let doc: Value = serde_json::from_str(body.unwrap_or("{}")).unwrap();
                        let sent = doc.get("_rev").and_then(Value::as_str).map(str::to_string);
                        if let (Some((steal_id, value)), Some(_)) = (&steal, &sent) {
                            if steal_id == id {
                                let rev = docs.get(*id).map_or(1, |(rev, _)| rev + 1);
                                docs.insert(id.to_string(), (rev, json!({ "_id": id, *id: value })));
                                state.steal = None;
                                return reply(409, json!({ "error": "conflict" }));
                            }
                        }
                        if sent != current {
                            return reply(409, json!({ "error": "conflict" }));
                        }
                        let rev = docs.get(*id).map_or(1, |(rev, _)| rev + 1);
                        let mut stored = doc;
                        if let Some(map) = stored.as_object_mut() {
                            map.remove("_rev");
                        }
                        docs.insert(id.to_string(), (rev, stored));
                        reply(201, json!({ "ok": true, "id": id, "rev": format!("{rev}-fake") }))
                    }
                    HttpVerb::Delete => match current {
                        None => reply(404, json!({ "error": "not_found" })),
                        Some(rev) if Some(rev.as_str()) == rev_param => {
                            docs.remove(*id);
                            reply(200, json!({ "ok": true }))
                        }
                        Some(_) => reply(409, json!({ "error": "conflict" })),
                    },
                }
            }
            _ => reply(400, json!({ "error": "bad_request" })),
        }
    }
}

impl HttpOps for FakeCouch {
    fn send(&mut self, verb: HttpVerb, url: &str, body: Option<&str>) -> Result<HttpReply> {
        let mut state = self.state.lock();
        Ok(Self::handle(&mut state, verb, url, body))
    }
}
