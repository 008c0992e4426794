//! RESP2 protocol implementation
//!
//! This module implements the Redis Serialization Protocol (RESP2) for
//! encoding command requests and decoding server replies.

use crate::command::Command;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use redlink_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";

/// Encodes commands into RESP request frames
pub struct RespEncoder;

impl RespEncoder {
    /// Encode one command as `*N` followed by N length-prefixed bulks.
    ///
    /// Every argument is coerced to a byte string: integers render as
    /// decimal text, bulk arguments pass through untouched.
    #[must_use]
    pub fn encode_command(command: &Command) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_command_into(command, &mut buf);
        buf.freeze()
    }

    /// Encode several commands back-to-back into one contiguous buffer
    #[must_use]
    pub fn encode_batch(commands: &[Command]) -> Bytes {
        let mut buf = BytesMut::new();
        for command in commands {
            Self::encode_command_into(command, &mut buf);
        }
        buf.freeze()
    }

    fn encode_command_into(command: &Command, buf: &mut BytesMut) {
        buf.put_u8(b'*');
        buf.put_slice((1 + command.args.len()).to_string().as_bytes());
        buf.put_slice(CRLF);

        Self::put_bulk(buf, command.name.as_bytes());
        for arg in &command.args {
            match arg {
                RespValue::BulkString(data) => Self::put_bulk(buf, data),
                RespValue::SimpleString(s) => Self::put_bulk(buf, s.as_bytes()),
                RespValue::Integer(i) => Self::put_bulk(buf, i.to_string().as_bytes()),
                // Nested values never appear in request position.
                RespValue::Error(_) | RespValue::Null | RespValue::Array(_) => {
                    Self::put_bulk(buf, b"");
                }
            }
        }
    }

    fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u8(b'$');
        buf.put_slice(data.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        buf.put_slice(data);
        buf.put_slice(CRLF);
    }
}

/// Decodes RESP frames from bytes
pub struct RespDecoder;

impl RespDecoder {
    /// Decode one frame from a buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; the cursor position is only meaningful on `Ok(Some(_))`.
    ///
    /// # Errors
    ///
    /// [`RedisError::InvalidState`] on a framing violation.
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let type_byte = buf.chunk()[0];

        match type_byte {
            b'+' => Self::decode_simple_string(buf),
            b'-' => Self::decode_error(buf),
            b':' => Self::decode_integer(buf),
            b'$' => Self::decode_bulk_string(buf),
            b'*' => Self::decode_array(buf),
            _ => Err(RedisError::InvalidState(format!(
                "invalid RESP type byte: {:#04x}",
                type_byte
            ))),
        }
    }

    fn decode_simple_string(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1); // Skip '+'

        match Self::read_line(buf)? {
            Some(line) => Ok(Some(RespValue::SimpleString(line_to_string(&line)?))),
            None => Ok(None),
        }
    }

    fn decode_error(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1); // Skip '-'

        match Self::read_line(buf)? {
            Some(line) => Ok(Some(RespValue::Error(line_to_string(&line)?))),
            None => Ok(None),
        }
    }

    fn decode_integer(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1); // Skip ':'

        match Self::read_line(buf)? {
            Some(line) => Ok(Some(RespValue::Integer(parse_decimal(&line)?))),
            None => Ok(None),
        }
    }

    fn decode_bulk_string(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1); // Skip '$'

        let len_line = match Self::read_line(buf)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let len = parse_decimal(&len_line)?;

        if len == -1 {
            return Ok(Some(RespValue::Null));
        }
        if len < 0 {
            return Err(RedisError::InvalidState(format!(
                "invalid bulk string length: {len}"
            )));
        }

        let len = len as usize;
        if buf.remaining() < len + 2 {
            return Ok(None);
        }

        let mut data = vec![0u8; len];
        data.copy_from_slice(&buf.chunk()[..len]);
        buf.advance(len);
        buf.advance(2); // Trailing CRLF

        Ok(Some(RespValue::BulkString(Bytes::from(data))))
    }

    fn decode_array(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1); // Skip '*'

        let len_line = match Self::read_line(buf)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let len = parse_decimal(&len_line)?;

        if len == -1 {
            return Ok(Some(RespValue::Null));
        }
        if len < 0 {
            return Err(RedisError::InvalidState(format!(
                "invalid array length: {len}"
            )));
        }

        let len = len as usize;
        let mut arr = Vec::with_capacity(len);

        for _ in 0..len {
            match Self::decode(buf)? {
                Some(value) => arr.push(value),
                None => return Ok(None),
            }
        }

        Ok(Some(RespValue::Array(arr)))
    }

    fn read_line(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Vec<u8>>> {
        let start = buf.position() as usize;
        let slice = buf.get_ref();

        for i in start..slice.len().saturating_sub(1) {
            if slice[i] == b'\r' && slice[i + 1] == b'\n' {
                let line = slice[start..i].to_vec();
                buf.set_position((i + 2) as u64);
                return Ok(Some(line));
            }
        }

        Ok(None)
    }
}

fn line_to_string(line: &[u8]) -> RedisResult<String> {
    String::from_utf8(line.to_vec())
        .map_err(|e| RedisError::InvalidState(format!("invalid UTF-8 in line: {e}")))
}

fn parse_decimal(line: &[u8]) -> RedisResult<i64> {
    line_to_string(line)?
        .parse::<i64>()
        .map_err(|e| RedisError::InvalidState(format!("invalid decimal: {e}")))
}
