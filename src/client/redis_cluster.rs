use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};

use log::{debug, info, warn};

use super::resp::{self, RespValue};
use crate::client::RedisOps;
use crate::config::ConnectionOptions;
use crate::{DpsError, Result};

const SLOT_COUNT: usize = 16384;
const DEFAULT_PORT: u16 = 6379;
const MAX_REDIRECTS: usize = 5;

/// Cluster slot of `key`, honouring `{hash tags}`.
pub fn hash_slot(key: &[u8]) -> u16 {
    let hashed = match key.iter().position(|b| *b == b'{') {
        Some(open) => match key[open + 1..].iter().position(|b| *b == b'}') {
            Some(len) if len > 0 => &key[open + 1..open + 1 + len],
            _ => key,
        },
        None => key,
    };
    crc16(hashed) % SLOT_COUNT as u16
}

// CRC16-CCITT (XModem), the checksum the cluster key space is defined over.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeAddr {
    host: String,
    port: u16,
    password: Option<String>,
}

impl NodeAddr {
    /// `host`, `host:port` or `host:port:password`.
    fn parse(server: &str, fallback_password: Option<&str>) -> Result<Self> {
        let mut parts = server.splitn(3, ':');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(|| {
            DpsError::Connection(format!("malformed redis server string '{server}'"))
        })?;
        let port = match parts.next() {
            Some(p) if !p.is_empty() => p
                .parse()
                .map_err(|_| DpsError::Connection(format!("bad port in '{server}'")))?,
            _ => DEFAULT_PORT,
        };
        let password = parts
            .next()
            .filter(|p| !p.is_empty())
            .or(fallback_password)
            .map(str::to_string);
        Ok(NodeAddr {
            host: host.to_string(),
            port,
            password,
        })
    }

    fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct NodeConnection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl NodeConnection {
    fn open(node: &NodeAddr, options: &ConnectionOptions) -> Result<Self> {
        let socket = (node.host.as_str(), node.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| DpsError::Connection(format!("cannot resolve {}", node.key())))?;
        let stream = match options.connect_timeout() {
            Some(timeout) => TcpStream::connect_timeout(&socket, timeout)?,
            None => TcpStream::connect(socket)?,
        };
        stream.set_read_timeout(options.io_timeout())?;
        stream.set_write_timeout(options.io_timeout())?;
        stream.set_nodelay(true)?;
        let tcp_writer = stream.try_clone()?;
        let mut conn = NodeConnection {
            reader: BufReader::new(stream),
            writer: BufWriter::new(tcp_writer),
        };
        if let Some(password) = &node.password {
            match conn.call(&[b"AUTH", password.as_bytes()])? {
                RespValue::Error(e) => {
                    return Err(DpsError::Connection(format!(
                        "authentication to {} failed: {e}",
                        node.key()
                    )));
                }
                _ => debug!("authenticated to {}", node.key()),
            }
        }
        Ok(conn)
    }

    fn call(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        resp::write_command(&mut self.writer, args)?;
        resp::read_value(&mut self.reader)
    }
}

enum Redirect {
    Moved(u16, String),
    Ask(String),
}

fn redirect_of(reply: &RespValue) -> Option<Redirect> {
    let RespValue::Error(msg) = reply else {
        return None;
    };
    let mut parts = msg.split(' ');
    let kind = parts.next()?;
    let slot = parts.next()?.parse().ok()?;
    let addr = parts.next()?.to_string();
    match kind {
        "MOVED" => Some(Redirect::Moved(slot, addr)),
        "ASK" => Some(Redirect::Ask(addr)),
        _ => None,
    }
}

fn checked_slot(slot: u16) -> Result<usize> {
    let slot = usize::from(slot);
    if slot < SLOT_COUNT {
        Ok(slot)
    } else {
        Err(DpsError::Protocol(format!("redirect to slot {slot} is outside the key space")))
    }
}

// Commands whose first argument is not a key.
fn routing_key<'a>(args: &[&'a [u8]]) -> Option<&'a [u8]> {
    let name = String::from_utf8_lossy(args.first()?).to_ascii_uppercase();
    match name.as_str() {
        "PING" | "WAIT" | "CLUSTER" | "INFO" | "AUTH" | "ECHO" | "DBSIZE" => None,
        _ => args.get(1).copied(),
    }
}

/// Redis client that follows the cluster slot map.
///
/// Credentials, TLS and timeouts arrive through [`ConnectionOptions`]; a
/// password embedded in a server string wins over the shared one. A server
/// with cluster support disabled is treated as owning every slot.
pub struct RedisClusterClient {
    seeds: Vec<NodeAddr>,
    options: ConnectionOptions,
    nodes: HashMap<String, NodeConnection>,
    slots: Vec<Option<String>>,
    default_node: String,
}

impl RedisClusterClient {
    /// Connect through the first reachable seed and load the slot map.
    pub fn connect(servers: &[String], options: ConnectionOptions) -> Result<Self> {
        if servers.is_empty() {
            return Err(DpsError::Connection("no redis servers configured".to_string()));
        }
        if options.tls {
            return Err(DpsError::Connection(
                "TLS is not available for the built-in redis transport".to_string(),
            ));
        }
        let seeds = servers
            .iter()
            .map(|s| NodeAddr::parse(s, options.password.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        let mut client = RedisClusterClient {
            seeds,
            options,
            nodes: HashMap::new(),
            slots: vec![None; SLOT_COUNT],
            default_node: String::new(),
        };
        client.bootstrap()?;
        Ok(client)
    }

    fn bootstrap(&mut self) -> Result<()> {
        let mut last_err = None;
        for seed in self.seeds.clone() {
            match NodeConnection::open(&seed, &self.options) {
                Ok(conn) => {
                    self.default_node = seed.key();
                    self.nodes.insert(seed.key(), conn);
                    self.refresh_slots()?;
                    info!("connected to redis cluster through {}", seed.key());
                    return Ok(());
                }
                Err(e) => {
                    warn!("redis seed {} unreachable: {}", seed.key(), e);
                    last_err = Some(e);
                }
            }
        }
        Err(DpsError::Connection(format!(
            "no redis server reachable: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn refresh_slots(&mut self) -> Result<()> {
        let default_node = self.default_node.clone();
        let reply = self.node(&default_node)?.call(&[b"CLUSTER", b"SLOTS"])?;
        let ranges = match reply {
            RespValue::Array(ranges) => ranges,
            RespValue::Error(e) if e.contains("cluster support disabled") => {
                debug!("{} is a standalone server", default_node);
                self.slots = vec![Some(default_node); SLOT_COUNT];
                return Ok(());
            }
            other => {
                return Err(DpsError::Protocol(format!("unexpected CLUSTER SLOTS reply {other:?}")));
            }
        };

        for range in ranges {
            let RespValue::Array(fields) = range else {
                continue;
            };
            let (Some(start), Some(end), Some(RespValue::Array(master))) = (
                fields.first().and_then(RespValue::as_integer),
                fields.get(1).and_then(RespValue::as_integer),
                fields.get(2),
            ) else {
                continue;
            };
            let host = match master.first() {
                Some(RespValue::BulkString(h)) => String::from_utf8_lossy(h).to_string(),
                _ => continue,
            };
            let Some(port) = master.get(1).and_then(RespValue::as_integer) else {
                continue;
            };
            let addr = format!("{host}:{port}");
            for slot in start.max(0) as usize..=(end as usize).min(SLOT_COUNT - 1) {
                self.slots[slot] = Some(addr.clone());
            }
        }
        Ok(())
    }

    fn node(&mut self, addr: &str) -> Result<&mut NodeConnection> {
        if !self.nodes.contains_key(addr) {
            let node = self.node_addr(addr)?;
            let conn = NodeConnection::open(&node, &self.options)?;
            self.nodes.insert(addr.to_string(), conn);
        }
        self.nodes
            .get_mut(addr)
            .ok_or_else(|| DpsError::Connection(format!("no connection to {addr}")))
    }

    // Nodes discovered via the slot map inherit the seeds' password.
    fn node_addr(&self, addr: &str) -> Result<NodeAddr> {
        let password = self
            .seeds
            .iter()
            .find(|s| s.key() == addr)
            .or_else(|| self.seeds.first())
            .and_then(|s| s.password.clone());
        NodeAddr::parse(addr, password.as_deref())
    }

    fn call_at(&mut self, addr: &str, args: &[&[u8]]) -> Result<RespValue> {
        let result = self.node(addr)?.call(args);
        if result.is_err() {
            // A broken stream is never reused.
            self.nodes.remove(addr);
        }
        result
    }
}

impl RedisOps for RedisClusterClient {
    fn command(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        let mut addr = match routing_key(args) {
            Some(key) => self.slots[hash_slot(key) as usize]
                .clone()
                .unwrap_or_else(|| self.default_node.clone()),
            None => self.default_node.clone(),
        };

        for _ in 0..MAX_REDIRECTS {
            let reply = self.call_at(&addr, args)?;
            match redirect_of(&reply) {
                Some(Redirect::Moved(slot, target)) => {
                    debug!("slot {} moved to {}", slot, target);
                    self.slots[checked_slot(slot)?] = Some(target.clone());
                    addr = target;
                }
                Some(Redirect::Ask(target)) => {
                    debug!("asked to retry at {}", target);
                    self.call_at(&target, &[b"ASKING"])?;
                    return self.call_at(&target, args);
                }
                None => return Ok(reply),
            }
        }
        Err(DpsError::Connection(format!("too many cluster redirects for {addr}")))
    }

    fn reconnect(&mut self) -> Result<()> {
        self.nodes.clear();
        self.slots = vec![None; SLOT_COUNT];
        self.bootstrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_match_the_cluster_key_space() {
        assert_eq!(crc16(b"123456789"), 0x31c3);
        assert_eq!(hash_slot(b"foo"), 12182);
        assert_eq!(hash_slot(b"{user1000}.following"), hash_slot(b"user1000"));
        // An empty tag means the whole key is hashed.
        assert_eq!(hash_slot(b"foo{}{bar}"), crc16(b"foo{}{bar}") % 16384);
    }

    #[test]
    fn server_strings() {
        let node = NodeAddr::parse("10.0.0.1", None).unwrap();
        assert_eq!(node.key(), "10.0.0.1:6379");
        assert_eq!(node.password, None);

        let node = NodeAddr::parse("10.0.0.1:7000:s3cret", Some("shared")).unwrap();
        assert_eq!(node.port, 7000);
        assert_eq!(node.password.as_deref(), Some("s3cret"));

        let node = NodeAddr::parse("10.0.0.1:7000", Some("shared")).unwrap();
        assert_eq!(node.password.as_deref(), Some("shared"));

        assert!(NodeAddr::parse(":7000", None).is_err());
        assert!(NodeAddr::parse("host:port", None).is_err());
    }

    #[test]
    fn redirects_are_recognised() {
        let moved = RespValue::Error("MOVED 3999 127.0.0.1:6381".to_string());
        assert!(matches!(redirect_of(&moved), Some(Redirect::Moved(3999, a)) if a == "127.0.0.1:6381"));
        let ask = RespValue::Error("ASK 3999 127.0.0.1:6382".to_string());
        assert!(matches!(redirect_of(&ask), Some(Redirect::Ask(a)) if a == "127.0.0.1:6382"));
        assert!(redirect_of(&RespValue::Error("ERR wrong type".to_string())).is_none());
        assert!(redirect_of(&RespValue::ok()).is_none());
    }

    #[test]
    fn redirect_slots_are_bounds_checked() {
        assert_eq!(checked_slot(16383).unwrap(), 16383);
        let moved = RespValue::Error("MOVED 40000 127.0.0.1:6381".to_string());
        let Some(Redirect::Moved(slot, _)) = redirect_of(&moved) else {
            panic!("not a redirect");
        };
        assert!(matches!(checked_slot(slot), Err(DpsError::Protocol(_))));
    }

    #[test]
    fn keyless_commands_use_the_default_node() {
        let wait: [&[u8]; 3] = [b"WAIT", b"1", b"0"];
        assert!(routing_key(&wait).is_none());
        let get: [&[u8]; 2] = [b"get", b"k"];
        assert_eq!(routing_key(&get), Some(&b"k"[..]));
    }
}
