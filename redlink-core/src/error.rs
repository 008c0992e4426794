//! Error types for client operations

use std::io;
use thiserror::Error;

/// Result type for client operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Comprehensive error type for client operations
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Stream closed at a frame boundary before any reply byte
    #[error("EOF while waiting for a reply")]
    Eof,

    /// Protocol framing violation
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Server returned an error frame
    #[error("{0}")]
    ErrorReply(String),

    /// Handshake failure or invalid connect options
    #[error("connect error: {0}")]
    ConnectError(String),

    /// Retries exhausted, or the stream died mid-reply
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation on a closed or repurposed connection
    #[error("bad resource")]
    BadResource,

    /// Multi-key command spans slots in cluster mode
    #[error("{0}")]
    CrossSlot(String),

    /// Cluster exceeded the redirection budget for one command
    #[error("Too many Cluster redirections?")]
    TooManyRedirections,

    /// MOVED redirect in cluster mode
    #[error("MOVED redirect: slot {slot} to {host}:{port}")]
    Moved {
        /// Slot number that was moved
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// ASK redirect in cluster mode
    #[error("ASK redirect: slot {slot} to {host}:{port}")]
    Ask {
        /// Slot number for temporary redirect
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// Reply could not be converted to the requested type
    #[error("type conversion error: {0}")]
    Type(String),
}

impl RedisError {
    /// Classify a server error-frame line.
    ///
    /// `-MOVED` and `-ASK` become their redirect variants, `-CROSSSLOT` keeps
    /// the server's wording, everything else is an [`RedisError::ErrorReply`].
    #[must_use]
    pub fn from_reply_text(msg: &str) -> Self {
        if let Some(redirect) = Self::parse_redirect(msg) {
            return redirect;
        }
        if msg.starts_with("CROSSSLOT") {
            return Self::CrossSlot(msg.to_string());
        }
        Self::ErrorReply(msg.to_string())
    }

    /// Parse an error line to check for MOVED or ASK redirects
    #[must_use]
    pub fn parse_redirect(msg: &str) -> Option<Self> {
        let (moved, rest) = if let Some(rest) = msg.strip_prefix("MOVED ") {
            (true, rest)
        } else if let Some(rest) = msg.strip_prefix("ASK ") {
            (false, rest)
        } else {
            return None;
        };

        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() != 2 {
            return None;
        }
        let slot = parts[0].parse::<u16>().ok()?;
        let (host, port) = parts[1].rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;

        Some(if moved {
            Self::Moved {
                slot,
                host: host.to_string(),
                port,
            }
        } else {
            Self::Ask {
                slot,
                host: host.to_string(),
                port,
            }
        })
    }

    /// Check if this error is a redirect (MOVED or ASK)
    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        matches!(self, Self::Moved { .. } | Self::Ask { .. })
    }

    /// Get the target address from a redirect error
    #[must_use]
    pub fn redirect_target(&self) -> Option<(String, u16)> {
        match self {
            Self::Moved { host, port, .. } | Self::Ask { host, port, .. } => {
                Some((host.clone(), *port))
            }
            _ => None,
        }
    }

    /// True for failures where the reply never started and a replay is safe
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Eof)
    }
}
