//! Core types shared by the `redlink` client crates: the RESP reply value,
//! the error enum, and connection options.

#![deny(warnings)]
#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod error;
pub mod value;

pub use config::{BackoffPolicy, ConnectOpts};
pub use error::{RedisError, RedisResult};
pub use value::{RespKind, RespValue};
