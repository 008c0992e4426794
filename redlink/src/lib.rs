//! Async client for Redis-compatible servers
//!
//! `redlink` connects to one or more servers, issues commands over RESP2,
//! and layers coordination primitives on top: pipelines, `MULTI`/`EXEC`
//! transactions, pub/sub subscriptions, and cluster-aware routing with
//! transparent `-MOVED`/`-ASK` handling.
//!
//! # Quick start
//!
//! ```no_run
//! use redlink::{Client, ConnectOpts};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect(ConnectOpts::new("127.0.0.1", 6379)).await?;
//!
//!     client.set("mykey", "myvalue").await?;
//!     let value = client.get("mykey").await?;
//!     println!("value: {:?}", value);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Pipelines
//!
//! ```no_run
//! # use redlink::{Client, ConnectOpts};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let client = Client::connect(ConnectOpts::new("127.0.0.1", 6379)).await?;
//! let pipe = client.pipeline()?;
//! pipe.set("a", "1").set("b", "2").mget(&["a", "b"]);
//! let replies = pipe.flush().await?;
//! assert_eq!(replies.len(), 3);
//! # Ok(())
//! # }
//! ```

#![deny(warnings)]
#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::future_not_send)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::significant_drop_tightening)]

pub mod client;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod executor;
pub mod pipeline;
pub mod protocol;
pub mod pubsub;
mod transport;

pub use client::Client;
pub use cluster::{calculate_slot, ClusterExecutor, ClusterOpts, ConnectionFactory};
pub use command::Command;
pub use connection::{Connection, ConnectionState};
pub use executor::{DirectExecutor, Executor};
pub use pipeline::Pipeline;
pub use pubsub::{PubSubMessage, Subscription};

pub use redlink_core::{
    config::{BackoffPolicy, ConnectOpts},
    error::{RedisError, RedisResult},
    value::{RespKind, RespValue},
};
