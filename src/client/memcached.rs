use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use log::{debug, info};

use crate::client::MemcachedOps;
use crate::config::ConnectionOptions;
use crate::{DpsError, Result};

const DEFAULT_PORT: u16 = 11211;
const MAX_KEY_LEN: usize = 250;
// The largest item size memcached can be configured for (`-I 1024m`).
const MAX_VALUE_LEN: usize = 1024 * 1024 * 1024;

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn open(addr: &str, options: &ConnectionOptions) -> Result<Self> {
        let socket = resolve(addr)?;
        let stream = match options.connect_timeout() {
            Some(timeout) => TcpStream::connect_timeout(&socket, timeout)?,
            None => TcpStream::connect(socket)?,
        };
        stream.set_read_timeout(options.io_timeout())?;
        stream.set_write_timeout(options.io_timeout())?;
        stream.set_nodelay(true)?;
        let tcp_writer = stream.try_clone()?;
        Ok(Connection {
            reader: BufReader::new(stream),
            writer: BufWriter::new(tcp_writer),
        })
    }

    fn send(&mut self, line: &str, payload: Option<&[u8]>) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        if let Some(data) = payload {
            self.writer.write_all(data)?;
            self.writer.write_all(b"\r\n")?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(DpsError::Connection("memcached closed the connection".to_string()));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
            return Err(DpsError::Protocol(line));
        }
        Ok(line)
    }
}

/// Whether `key` can travel as a text-protocol token: 1..=250 bytes with no
/// whitespace or control characters.
pub fn is_valid_key(key: &str) -> bool {
    (1..=MAX_KEY_LEN).contains(&key.len()) && key.bytes().all(|b| b > b' ' && b != 0x7f)
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    let with_port = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{DEFAULT_PORT}")
    };
    with_port
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| DpsError::Connection(format!("cannot resolve memcached server '{addr}'")))
}

/// Memcached text-protocol client spreading keys over a server list.
///
/// A key always goes to the server picked by the crc32 of the key, so
/// every process sharing the same server list agrees on placement.
pub struct MemcachedClient {
    servers: Vec<String>,
    options: ConnectionOptions,
    connections: Vec<Connection>,
}

impl MemcachedClient {
    /// Connect to every server in `servers` (`host` or `host:port`).
    pub fn connect(servers: &[String], options: ConnectionOptions) -> Result<Self> {
        if servers.is_empty() {
            return Err(DpsError::Connection("no memcached servers configured".to_string()));
        }
        if options.tls {
            return Err(DpsError::Connection(
                "TLS is not available for the memcached text protocol".to_string(),
            ));
        }
        let connections = open_all(servers, &options)?;
        info!("connected to {} memcached server(s)", connections.len());
        Ok(MemcachedClient {
            servers: servers.to_vec(),
            options,
            connections,
        })
    }

    fn route(&mut self, key: &str) -> Result<&mut Connection> {
        if !is_valid_key(key) {
            return Err(DpsError::Protocol(format!(
                "memcached keys must be 1..={MAX_KEY_LEN} printable bytes, got {:?}",
                key
            )));
        }
        let idx = crc32fast::hash(key.as_bytes()) as usize % self.connections.len();
        Ok(&mut self.connections[idx])
    }

    fn store(&mut self, verb: &str, key: &str, value: &[u8], exptime: u32) -> Result<bool> {
        let conn = self.route(key)?;
        conn.send(&format!("{verb} {key} 0 {exptime} {}", value.len()), Some(value))?;
        match conn.read_line()?.as_str() {
            "STORED" => Ok(true),
            "NOT_STORED" | "EXISTS" => Ok(false),
            other => Err(DpsError::Protocol(format!("unexpected {verb} reply '{other}'"))),
        }
    }
}

fn open_all(servers: &[String], options: &ConnectionOptions) -> Result<Vec<Connection>> {
    servers
        .iter()
        .map(|addr| {
            Connection::open(addr, options).map_err(|e| {
                DpsError::Connection(format!("memcached server '{addr}' unreachable: {e}"))
            })
        })
        .collect()
}

impl MemcachedOps for MemcachedClient {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.route(key)?;
        conn.send(&format!("get {key}"), None)?;
        let header = conn.read_line()?;
        if header == "END" {
            return Ok(None);
        }

        // VALUE <key> <flags> <bytes>
        let len: usize = header
            .strip_prefix("VALUE ")
            .and_then(|rest| rest.split(' ').nth(2))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| DpsError::Protocol(format!("unexpected get reply '{header}'")))?;
        if len > MAX_VALUE_LEN {
            return Err(DpsError::Protocol(format!("value too large: {len}")));
        }
        let mut data = vec![0u8; len + 2];
        conn.reader.read_exact(&mut data)?;
        data.truncate(len);

        let end = conn.read_line()?;
        if end != "END" {
            return Err(DpsError::Protocol(format!("expected END, got '{end}'")));
        }
        Ok(Some(data))
    }

    fn set(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<()> {
        if self.store("set", key, value, exptime)? {
            Ok(())
        } else {
            Err(DpsError::DataItemWrite(format!("memcached refused to store '{key}'")))
        }
    }

    fn add(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<bool> {
        self.store("add", key, value, exptime)
    }

    fn delete(&mut self, key: &str) -> Result<bool> {
        let conn = self.route(key)?;
        conn.send(&format!("delete {key}"), None)?;
        match conn.read_line()?.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(DpsError::Protocol(format!("unexpected delete reply '{other}'"))),
        }
    }

    fn incr(&mut self, key: &str, delta: u64) -> Result<Option<u64>> {
        let conn = self.route(key)?;
        conn.send(&format!("incr {key} {delta}"), None)?;
        let reply = conn.read_line()?;
        if reply == "NOT_FOUND" {
            return Ok(None);
        }
        reply
            .parse()
            .map(Some)
            .map_err(|_| DpsError::Protocol(format!("unexpected incr reply '{reply}'")))
    }

    fn version(&mut self) -> Result<String> {
        let conn = self
            .connections
            .first_mut()
            .ok_or_else(|| DpsError::Connection("no memcached connection".to_string()))?;
        conn.send("version", None)?;
        let reply = conn.read_line()?;
        reply
            .strip_prefix("VERSION ")
            .map(str::to_string)
            .ok_or_else(|| DpsError::Protocol(format!("unexpected version reply '{reply}'")))
    }

    fn reconnect(&mut self) -> Result<()> {
        debug!("reconnecting to memcached servers {:?}", self.servers);
        self.connections = open_all(&self.servers, &self.options)?;
        Ok(())
    }
}
