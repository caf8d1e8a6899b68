use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use dps::client::{HttpOps, HttpReply, HttpVerb};
use dps::engines::{
    CLOUDANT_META_DB as META_DB, CloudantEngine, CommandScope, HttpCommand, cloudant_lock_id as lock_id_for,
    cloudant_store_id as store_id_for,
};
use dps::{DpsEngine, DpsError, Result, TtlEncoding, encoding, lock};

mod common;
use common::{COUCH_URL, FakeCouch, init_logging, quick_policy};

fn engine(server: &FakeCouch) -> CloudantEngine<FakeCouch> {
    init_logging();
    CloudantEngine::new(server.clone(), quick_policy(), COUCH_URL).unwrap()
}

fn drain(engine: &mut dyn DpsEngine, store: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = engine.new_iterator(store).unwrap();
    let mut items = Vec::new();
    while let Some(item) = engine.get_next(store, &mut iter).unwrap() {
        items.push(item);
    }
    items
}

fn lock_doc(lock: u64) -> String {
    format!("7{lock}dl_lock")
}

/// Records every request and answers 500 to PUTs on one URL.
#[derive(Clone)]
struct Recorder {
    inner: FakeCouch,
    seen: Arc<Mutex<Vec<(HttpVerb, String)>>>,
    refused_put: Arc<Mutex<Option<String>>>,
}

impl Recorder {
    fn new(inner: FakeCouch) -> Self {
        Recorder {
            inner,
            seen: Arc::default(),
            refused_put: Arc::default(),
        }
    }

    fn first(&self, verb: HttpVerb, url: &str) -> Option<usize> {
        self.seen.lock().iter().position(|(v, u)| *v == verb && u == url)
    }
}

impl HttpOps for Recorder {
    fn send(&mut self, verb: HttpVerb, url: &str, body: Option<&str>) -> Result<HttpReply> {
        self.seen.lock().push((verb, url.to_string()));
        if verb == HttpVerb::Put && self.refused_put.lock().as_deref() == Some(url) {
            return Ok(HttpReply {
                status: 500,
                body: r#"{"error":"internal"}"#.to_string(),
            });
        }
        self.inner.send(verb, url, body)
    }
}

#[test]
fn connecting_twice_reuses_the_meta_database() {
    let server = FakeCouch::default();
    let _first = engine(&server);
    let mut second = engine(&server);
    assert!(server.has_db(META_DB));
    assert!(second.is_connected());
    second.reconnect().unwrap();
}

#[test]
fn store_ids_derive_from_names() {
    let server = FakeCouch::default();
    let mut engine = engine(&server);

    let id = engine.create_store("orders", "rstring", "int32").unwrap();
    assert_eq!(id, store_id_for("orders"));
    assert!(server.has_db(&format!("dps_1_{id}")));
    assert!(matches!(
        engine.create_store("orders", "rstring", "int32"),
        Err(DpsError::StoreExists(_))
    ));
    assert_eq!(engine.find_store("orders").unwrap(), id);

    let info = engine.store_info(id).unwrap();
    assert_eq!(info.name, "orders");
    assert_eq!(info.key_type, "rstring");
    assert_eq!(info.value_type, "int32");
    assert_eq!(info.item_count, 0);
}

#[test]
fn name_record_is_written_before_the_database() {
    init_logging();
    let recorder = Recorder::new(FakeCouch::default());
    let mut engine = CloudantEngine::new(recorder.clone(), quick_policy(), COUCH_URL).unwrap();

    let id = engine.create_store("orders", "k", "v").unwrap();
    let name_doc = format!("{COUCH_URL}/{META_DB}/0{}", encoding::url_safe_encode(b"orders"));
    let database = format!("{COUCH_URL}/dps_1_{id}");
    let named = recorder.first(HttpVerb::Put, &name_doc).unwrap();
    let created = recorder.first(HttpVerb::Put, &database).unwrap();
    assert!(named < created);
}

#[test]
fn failed_database_creation_drops_the_name_record() {
    init_logging();
    let server = FakeCouch::default();
    let recorder = Recorder::new(server.clone());
    let mut engine = CloudantEngine::new(recorder.clone(), quick_policy(), COUCH_URL).unwrap();

    let id = store_id_for("orders");
    *recorder.refused_put.lock() = Some(format!("{COUCH_URL}/dps_1_{id}"));
    assert!(matches!(
        engine.create_store("orders", "k", "v"),
        Err(DpsError::StoreCreation(_))
    ));
    assert!(matches!(engine.find_store("orders"), Err(DpsError::StoreDoesNotExist(_))));

    *recorder.refused_put.lock() = None;
    assert_eq!(engine.create_store("orders", "k", "v").unwrap(), id);
    assert!(server.has_db(&format!("dps_1_{id}")));
}

#[test]
fn orders_scenario() {
    let server = FakeCouch::default();
    let mut engine = engine(&server);
    let id = engine.create_store("orders", "rstring", "int32").unwrap();

    engine.put_safe(id, b"o-1", b"10").unwrap();
    engine.put_safe(id, b"o-2", b"20").unwrap();
    engine.put_safe(id, b"o-3", b"30").unwrap();
    engine.put(id, b"o-3", b"31").unwrap();
    engine.remove_safe(id, b"o-2").unwrap();

    assert_eq!(engine.size(id).unwrap(), 2);
    let items: BTreeSet<_> = drain(&mut engine, id).into_iter().collect();
    assert_eq!(
        items,
        BTreeSet::from([(b"o-1".to_vec(), b"10".to_vec()), (b"o-3".to_vec(), b"31".to_vec())])
    );
    assert!(matches!(engine.remove(id, b"o-2"), Err(DpsError::DataItemDelete(_))));
}

#[test]
fn keys_are_stored_url_safe() {
    let server = FakeCouch::default();
    let mut engine = engine(&server);
    let id = engine.create_store("bin", "blob", "blob").unwrap();
    let key = [0xfbu8, 0xff, 0xbf];

    engine.put_safe(id, &key, &key).unwrap();
    let doc_id = encoding::url_safe_encode(&key);
    assert_eq!(doc_id, "-~-~");
    assert_eq!(server.field(&format!("dps_1_{id}"), &doc_id), Some(doc_id.clone()));
    assert_eq!(engine.get(id, &key).unwrap(), Some(key.to_vec()));
    assert!(engine.has(id, &key).unwrap());
}

#[test]
fn clear_and_remove() {
    let server = FakeCouch::default();
    let mut engine = engine(&server);
    let id = engine.create_store("orders", "k", "v").unwrap();
    for i in 0..6u8 {
        engine.put(id, &[i], &[i]).unwrap();
    }

    engine.clear(id).unwrap();
    assert_eq!(engine.size(id).unwrap(), 0);
    assert_eq!(engine.store_name(id).unwrap(), "orders");
    assert!(drain(&mut engine, id).is_empty());

    engine.remove_store(id).unwrap();
    assert!(!server.has_db(&format!("dps_1_{id}")));
    assert!(matches!(engine.find_store("orders"), Err(DpsError::StoreDoesNotExist(_))));
    assert!(matches!(engine.put_safe(id, b"a", b"b"), Err(DpsError::InvalidStoreId(_))));
    assert!(matches!(engine.size(id), Err(DpsError::InvalidStoreId(_))));
    assert_eq!(engine.create_store("orders", "k", "v").unwrap(), id);
}

#[test]
fn stale_lock_is_taken_over() {
    let server = FakeCouch::default();
    let mut first = engine(&server);
    let mut second = engine(&server);
    let lock = first.create_or_get_lock("jobs").unwrap();
    assert_eq!(lock, lock_id_for("jobs"));
    assert_eq!(second.create_or_get_lock("jobs").unwrap(), lock);

    first.acquire_lock(lock, Duration::from_secs(1), Duration::from_secs(1)).unwrap();
    assert!(matches!(
        second.acquire_lock(lock, Duration::from_secs(5), Duration::from_millis(50)),
        Err(DpsError::LockTimeout(_))
    ));

    thread::sleep(Duration::from_millis(2100));
    second.acquire_lock(lock, Duration::from_secs(5), Duration::from_secs(1)).unwrap();
    let held_until: u64 = server.field(META_DB, &lock_doc(lock)).unwrap().parse().unwrap();
    assert!(held_until >= lock::now_secs() + 3);
    assert_eq!(second.get_pid_for_lock("jobs").unwrap(), std::process::id());
}

#[test]
fn use_count_spans_every_holder() {
    let server = FakeCouch::default();
    let mut first = engine(&server);
    let mut second = engine(&server);
    let lock = first.create_or_get_lock("jobs").unwrap();

    for _ in 0..2 {
        first.acquire_lock(lock, Duration::from_secs(5), Duration::from_secs(1)).unwrap();
        first.release_lock(lock).unwrap();
        second.acquire_lock(lock, Duration::from_secs(5), Duration::from_secs(1)).unwrap();
        second.release_lock(lock).unwrap();
    }
    let raw = server.field(META_DB, &format!("6{lock}")).unwrap();
    assert_eq!(lock::LockInfo::parse(&raw).unwrap().use_count, 4);
}

#[test]
fn losing_the_takeover_race_is_not_a_win() {
    let server = FakeCouch::default();
    let mut engine = engine(&server);
    let lock = engine.create_or_get_lock("jobs").unwrap();

    // the holder's lease ran out long ago
    server.put_raw(META_DB, &lock_doc(lock), "1");
    let rival_until = (lock::now_secs() + 3600).to_string();
    server.steal_on_takeover(&lock_doc(lock), &rival_until);

    assert!(matches!(
        engine.acquire_lock(lock, Duration::from_secs(5), Duration::from_millis(100)),
        Err(DpsError::LockTimeout(_))
    ));
    assert_eq!(server.field(META_DB, &lock_doc(lock)), Some(rival_until));
}

#[test]
fn removed_lock_loses_its_records() {
    let server = FakeCouch::default();
    let mut engine = engine(&server);
    let lock = engine.create_or_get_lock("gone").unwrap();
    engine.remove_lock(lock).unwrap();
    assert!(server.field(META_DB, &lock_doc(lock)).is_none());
    assert!(matches!(engine.get_pid_for_lock("gone"), Err(DpsError::InvalidLockId(_))));
}

#[test]
fn ttl_operations_are_not_supported() {
    let server = FakeCouch::default();
    let mut engine = engine(&server);
    let enc = TtlEncoding::default();
    assert!(engine.put_ttl(b"k", b"v", 10, enc).unwrap_err().is_not_supported());
    assert!(engine.get_ttl(b"k", enc).unwrap_err().is_not_supported());
    assert!(engine.has_ttl(b"k", enc).unwrap_err().is_not_supported());
    assert!(engine.remove_ttl(b"k", enc).unwrap_err().is_not_supported());
    assert!(engine.run_command(&["GET".to_string()]).unwrap_err().is_not_supported());
}

#[test]
fn http_commands_are_validated_and_forwarded() {
    let server = FakeCouch::default();
    let mut engine = engine(&server);
    let command = |scope, verb, base_url: &str, endpoint: &str, json: &str| HttpCommand {
        scope,
        verb,
        base_url: base_url.to_string(),
        endpoint: endpoint.to_string(),
        query: String::new(),
        json: json.to_string(),
    };

    let reply = engine
        .run_http_command(&command(CommandScope::Database, HttpVerb::Put, "", "/scratch", ""))
        .unwrap();
    assert_eq!(reply.status, 201);
    assert!(server.has_db("scratch"));

    let reply = engine
        .run_http_command(&command(
            CommandScope::Document,
            HttpVerb::Put,
            COUCH_URL,
            "/scratch/doc1",
            r#"{"_id":"doc1","doc1":"hello"}"#,
        ))
        .unwrap();
    assert_eq!(reply.status, 201);
    assert_eq!(server.field("scratch", "doc1"), Some("hello".to_string()));

    let reply = engine
        .run_http_command(&command(CommandScope::Document, HttpVerb::Get, "", "/scratch/doc1", ""))
        .unwrap();
    assert_eq!(reply.status, 200);
    assert!(reply.json.contains("hello"));

    for (base, endpoint) in [("http://couch.test/", "/scratch"), ("", ""), ("", "scratch"), ("", "/scratch/")] {
        assert!(matches!(
            engine.run_http_command(&command(CommandScope::Database, HttpVerb::Get, base, endpoint, "")),
            Err(DpsError::Command(_))
        ));
    }
}
