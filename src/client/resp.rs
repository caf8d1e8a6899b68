//! RESP2 encoding of commands and blocking decoding of replies.

use std::io::{BufRead, Read, Write};

use bytes::Bytes;

use crate::{DpsError, Result};

const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;
const MAX_DEPTH: usize = 32;
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// A decoded RESP2 reply.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Array(Vec<RespValue>),
    Null,
}

impl RespValue {
    /// Bulk string from anything byte-like.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    #[allow(missing_docs)]
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Integer payload, also accepting integers sent as strings.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            RespValue::SimpleString(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Write `args` as a RESP array of bulk strings.
pub fn write_command<W: Write>(writer: &mut W, args: &[&[u8]]) -> Result<()> {
    write!(writer, "*{}\r\n", args.len())?;
    for arg in args {
        write!(writer, "${}\r\n", arg.len())?;
        writer.write_all(arg)?;
        writer.write_all(b"\r\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Read exactly one reply.
pub fn read_value<R: BufRead>(reader: &mut R) -> Result<RespValue> {
    read_nested(reader, 0)
}

fn read_nested<R: BufRead>(reader: &mut R, depth: usize) -> Result<RespValue> {
    if depth > MAX_DEPTH {
        return Err(DpsError::Protocol("reply nested too deeply".to_string()));
    }
    let line = read_line(reader)?;
    let (kind, rest) = line
        .split_at_checked(1)
        .ok_or_else(|| DpsError::Protocol("empty reply line".to_string()))?;

    match kind {
        "+" => Ok(RespValue::SimpleString(rest.to_string())),
        "-" => Ok(RespValue::Error(rest.to_string())),
        ":" => Ok(RespValue::Integer(parse_len(rest)?)),
        "$" => {
            let len = parse_len(rest)?;
            if len < 0 {
                return Ok(RespValue::Null);
            }
            let len = len as usize;
            if len > MAX_BULK_SIZE {
                return Err(DpsError::Protocol(format!("bulk string too large: {len}")));
            }
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf)?;
            if &buf[len..] != b"\r\n" {
                return Err(DpsError::Protocol("missing CRLF after bulk string".to_string()));
            }
            buf.truncate(len);
            Ok(RespValue::BulkString(Bytes::from(buf)))
        }
        "*" => {
            let len = parse_len(rest)?;
            if len < 0 {
                return Ok(RespValue::Null);
            }
            let len = len as usize;
            if len > MAX_ARRAY_LEN {
                return Err(DpsError::Protocol(format!("array reply too long: {len}")));
            }
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(read_nested(reader, depth + 1)?);
            }
            Ok(RespValue::Array(items))
        }
        other => Err(DpsError::Protocol(format!("unknown reply type '{other}'"))),
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(DpsError::Connection("connection closed by server".to_string()));
    }
    if !line.ends_with("\r\n") {
        return Err(DpsError::Protocol(format!("reply line not CRLF terminated: {line:?}")));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_len(s: &str) -> Result<i64> {
    s.parse()
        .map_err(|_| DpsError::Protocol(format!("invalid integer '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(raw: &[u8]) -> RespValue {
        read_value(&mut Cursor::new(raw.to_vec())).unwrap()
    }

    #[test]
    fn encodes_binary_safe_commands() {
        let mut out = Vec::new();
        let args: [&[u8]; 3] = [b"HSET", b"1 7", b"a\r\nb"];
        write_command(&mut out, &args).unwrap();
        assert_eq!(out, b"*3\r\n$4\r\nHSET\r\n$3\r\n1 7\r\n$4\r\na\r\nb\r\n".to_vec());
    }

    #[test]
    fn decodes_scalars() {
        assert_eq!(parse(b"+OK\r\n"), RespValue::ok());
        assert_eq!(parse(b":42\r\n"), RespValue::Integer(42));
        assert_eq!(parse(b"$-1\r\n"), RespValue::Null);
        assert_eq!(parse(b"$5\r\nhe\r\no\r\n"), RespValue::bulk(&b"he\r\no"[..]));
        assert_eq!(
            parse(b"-MOVED 3999 127.0.0.1:7001\r\n"),
            RespValue::Error("MOVED 3999 127.0.0.1:7001".to_string())
        );
    }

    #[test]
    fn oversized_lengths_are_refused() {
        let mut huge_array = Cursor::new(b"*9223372036854775807\r\n".to_vec());
        assert!(matches!(read_value(&mut huge_array), Err(DpsError::Protocol(_))));
        let mut huge_bulk = Cursor::new(b"$9223372036854775807\r\n".to_vec());
        assert!(matches!(read_value(&mut huge_bulk), Err(DpsError::Protocol(_))));
    }

    #[test]
    fn decodes_nested_arrays() {
        let value = parse(b"*2\r\n*1\r\n:1\r\n$3\r\nfoo\r\n");
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Array(vec![RespValue::Integer(1)]),
                RespValue::bulk(&b"foo"[..]),
            ])
        );
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(read_value(&mut Cursor::new(b"$5\r\nab".to_vec())).is_err());
        assert!(read_value(&mut Cursor::new(Vec::new())).is_err());
        assert!(read_value(&mut Cursor::new(b"?x\r\n".to_vec())).is_err());
    }

    #[test]
    fn integers_from_strings() {
        assert_eq!(RespValue::bulk(&b"17"[..]).as_integer(), Some(17));
        assert_eq!(RespValue::Null.as_integer(), None);
    }
}
