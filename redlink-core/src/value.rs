//! RESP (`REdis` Serialization Protocol) reply values

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;

/// RESP protocol value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// Null bulk string ($-1\r\n) or null array (*-1\r\n)
    Null,
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
}

/// Observable reply type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespKind {
    /// Simple (status) string reply
    Status,
    /// Error reply
    Error,
    /// Integer reply
    Integer,
    /// Bulk string reply
    Bulk,
    /// Nil reply
    Null,
    /// Array reply
    Array,
}

impl RespValue {
    /// The reply's type tag
    #[must_use]
    pub const fn kind(&self) -> RespKind {
        match self {
            Self::SimpleString(_) => RespKind::Status,
            Self::Error(_) => RespKind::Error,
            Self::Integer(_) => RespKind::Integer,
            Self::BulkString(_) => RespKind::Bulk,
            Self::Null => RespKind::Null,
            Self::Array(_) => RespKind::Array,
        }
    }

    /// Convert to a string if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a string.
    pub fn as_string(&self) -> RedisResult<String> {
        match self {
            Self::SimpleString(s) => Ok(s.clone()),
            Self::BulkString(b) => String::from_utf8(b.to_vec())
                .map_err(|e| RedisError::Type(format!("invalid UTF-8: {e}"))),
            Self::Null => Err(RedisError::Type("value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "cannot convert {self:?} to string"
            ))),
        }
    }

    /// Convert to an integer if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an integer.
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::BulkString(b) => {
                let s = String::from_utf8(b.to_vec())
                    .map_err(|e| RedisError::Type(format!("invalid UTF-8: {e}")))?;
                s.parse::<i64>()
                    .map_err(|e| RedisError::Type(format!("cannot parse integer: {e}")))
            }
            _ => Err(RedisError::Type(format!(
                "cannot convert {self:?} to integer"
            ))),
        }
    }

    /// Convert to bytes if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to bytes.
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            Self::BulkString(b) => Ok(b.clone()),
            Self::SimpleString(s) => Ok(Bytes::from(s.as_bytes().to_vec())),
            Self::Null => Err(RedisError::Type("value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "cannot convert {self:?} to bytes"
            ))),
        }
    }

    /// Raw bytes of a bulk reply, untouched by any text decoding
    #[must_use]
    pub const fn buffer(&self) -> Option<&Bytes> {
        match self {
            Self::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// Convert to an array if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an array.
    pub fn as_array(&self) -> RedisResult<Vec<Self>> {
        match self {
            Self::Array(arr) => Ok(arr.clone()),
            _ => Err(RedisError::Type(format!(
                "cannot convert {self:?} to array"
            ))),
        }
    }

    /// Apply a parser to the raw bytes of a terminal (non-array) reply.
    ///
    /// Integers are rendered as decimal text first, so a parser written for
    /// bulk bytes also accepts integer replies.
    ///
    /// # Errors
    ///
    /// Returns an error for nil, error and array replies, or whatever the
    /// parser itself returns.
    pub fn parse_with<T, F>(self, parse: F) -> RedisResult<T>
    where
        F: FnOnce(&[u8]) -> RedisResult<T>,
    {
        match self {
            Self::SimpleString(s) => parse(s.as_bytes()),
            Self::BulkString(b) => parse(&b),
            Self::Integer(i) => parse(i.to_string().as_bytes()),
            Self::Error(e) => Err(RedisError::ErrorReply(e)),
            Self::Null => Err(RedisError::Type("value is null".to_string())),
            Self::Array(_) => Err(RedisError::Type(
                "cannot parse an array as a terminal value".to_string(),
            )),
        }
    }

    /// Check if this is a nil value
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this is an error reply
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Extract the error message if this is an error reply
    #[must_use]
    pub fn into_error(self) -> Option<String> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}

impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::from(s.as_bytes().to_vec()))
    }
}

impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<Vec<u8>> for RespValue {
    fn from(b: Vec<u8>) -> Self {
        Self::BulkString(Bytes::from(b))
    }
}

impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}

impl TryFrom<RespValue> for String {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_string()
    }
}

impl TryFrom<RespValue> for i64 {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_int()
    }
}
