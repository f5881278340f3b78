//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and decode server replies and push frames
//! incrementally from a socket read buffer.
//!
//! ## Design Principles
//! 1. **Incremental Decoding**: `decode` returns `Ok(None)` until a whole value
//!    is buffered and only then consumes bytes, so it is safe to call after
//!    every partial read.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{Buf, BytesMut};

use crate::error::{ClientError, ClientResult};

/// Upper bound for array pre-allocation; larger arrays grow as they parse.
const MAX_PREALLOC_ITEMS: usize = 1024;
/// Deepest array nesting accepted from the server.
const MAX_NESTING: usize = 32;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays (scan replies and pub/sub push frames).
    Array(Vec<RespValue>),
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Decodes one RESP value from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when the value is incomplete.
pub fn decode(buf: &mut BytesMut) -> ClientResult<Option<RespValue>> {
    match parse_value(&buf[..], 0, 0)? {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Parses a value starting at `pos`; returns it with the offset just past it.
fn parse_value(
    data: &[u8],
    pos: usize,
    depth: usize,
) -> ClientResult<Option<(RespValue, usize)>> {
    let (line, next) = match read_line(data, pos)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line[0] {
        b'+' => Ok(Some((RespValue::Simple(line[1..].to_vec()), next))),
        b'-' => Ok(Some((RespValue::Error(line[1..].to_vec()), next))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(&line[1..])?), next))),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            parse_bulk(data, len, next)
        }
        b'*' => {
            let len = parse_i64(&line[1..])?;
            parse_array(data, len, next, depth)
        }
        _ => Err(ClientError::Protocol),
    }
}

fn parse_bulk(data: &[u8], len: i64, start: usize) -> ClientResult<Option<(RespValue, usize)>> {
    if len < 0 {
        return Ok(Some((RespValue::Bulk(None), start)));
    }
    let end = start + len as usize;
    if data.len() < end + 2 {
        return Ok(None);
    }
    if data[end..end + 2] != [b'\r', b'\n'] {
        return Err(ClientError::Protocol);
    }
    Ok(Some((RespValue::Bulk(Some(data[start..end].to_vec())), end + 2)))
}

fn parse_array(
    data: &[u8],
    len: i64,
    start: usize,
    depth: usize,
) -> ClientResult<Option<(RespValue, usize)>> {
    if len <= 0 {
        return Ok(Some((RespValue::Array(Vec::new()), start)));
    }
    if depth >= MAX_NESTING {
        return Err(ClientError::Protocol);
    }

    let mut items = Vec::with_capacity((len as usize).min(MAX_PREALLOC_ITEMS));
    let mut cursor = start;
    for _ in 0..len {
        match parse_value(data, cursor, depth + 1)? {
            Some((item, next)) => {
                items.push(item);
                cursor = next;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(items), cursor)))
}

/// Finds the CRLF-terminated line at `pos`, returning it without the CRLF.
fn read_line(data: &[u8], pos: usize) -> ClientResult<Option<(&[u8], usize)>> {
    let rest = &data[pos..];
    let idx = match rest.iter().position(|&b| b == b'\n') {
        Some(idx) => idx,
        None => return Ok(None),
    };
    if idx == 0 || rest[idx - 1] != b'\r' {
        return Err(ClientError::Protocol);
    }
    Ok(Some((&rest[..idx - 1], pos + idx + 1)))
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol);
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }
    if idx == data.len() {
        return Err(ClientError::Protocol);
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

/// Parses a decimal integer carried inside a bulk string (SCAN cursors).
pub(crate) fn parse_bulk_u64(data: &[u8]) -> ClientResult<u64> {
    match parse_i64(data)? {
        value if value >= 0 => Ok(value as u64),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
