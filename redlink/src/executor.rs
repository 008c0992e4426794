//! The command executor seam
//!
//! Every way of running a command (directly, queued into a pipeline or
//! transaction, routed through the cluster dispatcher) implements
//! [`Executor`]. The client facade only ever talks to this trait.

use crate::command::Command;
use crate::connection::Connection;
use redlink_core::{error::RedisResult, value::RespValue};
use std::sync::Arc;

/// Executes commands and owns the resources behind them
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Run one command and return its reply
    async fn exec(&self, command: Command) -> RedisResult<RespValue>;

    /// The single connection behind this executor, when there is one.
    ///
    /// The cluster dispatcher answers `None`; pipelines and direct executors
    /// expose the connection they are bound to.
    fn connection(&self) -> Option<Arc<Connection>>;

    /// Release the executor's resources
    async fn close(&self);
}

/// Serializes one command at a time on a connection
pub struct DirectExecutor {
    conn: Arc<Connection>,
}

impl DirectExecutor {
    /// Bind an executor to a connection
    #[must_use]
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl Executor for DirectExecutor {
    async fn exec(&self, command: Command) -> RedisResult<RespValue> {
        self.conn.exec(&command).await
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.conn.clone())
    }

    async fn close(&self) {
        self.conn.close().await;
    }
}
