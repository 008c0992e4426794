//! Pipeline and transaction execution
//!
//! Commands enqueue locally; [`Pipeline::flush`] writes the whole batch as
//! one contiguous payload and reads the replies back in order. Concurrent
//! flushes are legal: batches enter an in-flight FIFO and at most one batch
//! is on the wire per connection, with waiters resolving in enqueue order.
//! In transaction mode the batch is wrapped in `MULTI`/`EXEC` and the
//! caller receives the element list of the `EXEC` reply.

use crate::client::Client;
use crate::command::Command;
use crate::connection::Connection;
use crate::executor::Executor;
use redlink_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::oneshot;
use tracing::debug;

struct InflightBatch {
    commands: Arc<Vec<Command>>,
    waiter: Option<oneshot::Sender<RedisResult<Vec<RespValue>>>>,
}

pub(crate) struct PipelineShared {
    conn: Arc<Connection>,
    tx_mode: bool,
    pending: StdMutex<Vec<Command>>,
    inflight: StdMutex<VecDeque<InflightBatch>>,
}

impl PipelineShared {
    fn enqueue(&self, command: Command) {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(command);
    }

    fn queued_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    async fn flush(self: Arc<Self>) -> RedisResult<Vec<RespValue>> {
        let snapshot = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let batch = if self.tx_mode {
            let mut wrapped = Vec::with_capacity(snapshot.len() + 2);
            wrapped.push(Command::new("MULTI", vec![]));
            wrapped.extend(snapshot);
            wrapped.push(Command::new("EXEC", vec![]));
            wrapped
        } else {
            snapshot
        };

        let (done_tx, done_rx) = oneshot::channel();
        let start_drain = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inflight.push_back(InflightBatch {
                commands: Arc::new(batch),
                waiter: Some(done_tx),
            });
            inflight.len() == 1
        };

        if start_drain {
            let shared = Arc::clone(&self);
            tokio::spawn(async move { shared.drain().await });
        }

        // A dropped sender means the drain task died with the connection.
        done_rx.await.map_err(|_| RedisError::BadResource)?
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let commands = {
                let inflight = self
                    .inflight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                match inflight.front() {
                    Some(batch) => Arc::clone(&batch.commands),
                    None => return,
                }
            };

            debug!("flushing pipeline batch of {} commands", commands.len());
            let result = self.run_batch(&commands).await;

            // Pop and hand-off under one lock so a concurrent flush either
            // sees this entry still queued or an empty queue, never a
            // half-processed head.
            let more = {
                let mut inflight = self
                    .inflight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(mut batch) = inflight.pop_front() {
                    if let Some(waiter) = batch.waiter.take() {
                        let _ = waiter.send(result);
                    }
                }
                !inflight.is_empty()
            };
            if !more {
                return;
            }
        }
    }

    async fn run_batch(&self, commands: &[Command]) -> RedisResult<Vec<RespValue>> {
        let replies = self.conn.exec_batch(commands).await?;
        if !self.tx_mode {
            return Ok(replies);
        }

        // MULTI and the per-command QUEUED acknowledgements precede the EXEC
        // reply, which carries the actual results.
        match replies.into_iter().last() {
            Some(RespValue::Array(items)) => Ok(items),
            Some(RespValue::Null) | None => Ok(vec![RespValue::Null]),
            Some(other) => Ok(vec![other]),
        }
    }
}

/// Queues commands instead of sending them; `exec` resolves immediately
/// with the `+OK` sentinel and the real replies arrive from `flush`.
pub struct PipelineExecutor {
    shared: Arc<PipelineShared>,
}

#[async_trait::async_trait]
impl Executor for PipelineExecutor {
    async fn exec(&self, command: Command) -> RedisResult<RespValue> {
        self.shared.enqueue(command);
        Ok(RespValue::SimpleString("OK".to_string()))
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(Arc::clone(&self.shared.conn))
    }

    async fn close(&self) {
        self.shared.conn.close().await;
    }
}

/// A batch of commands bound to one connection.
///
/// Commands enqueue through the builder methods (or through the facade
/// surface available via `Deref<Target = Client>`, whose replies resolve to
/// the `+OK` sentinel); [`Pipeline::flush`] delivers the real replies.
pub struct Pipeline {
    client: Client,
    shared: Arc<PipelineShared>,
}

impl Pipeline {
    pub(crate) fn new(conn: Arc<Connection>, tx_mode: bool) -> Self {
        let shared = Arc::new(PipelineShared {
            conn,
            tx_mode,
            pending: StdMutex::new(Vec::new()),
            inflight: StdMutex::new(VecDeque::new()),
        });
        let executor = PipelineExecutor {
            shared: Arc::clone(&shared),
        };
        Self {
            client: Client::from_executor(Arc::new(executor)),
            shared,
        }
    }

    /// Enqueue a raw command
    pub fn cmd(&self, name: &str, args: Vec<RespValue>) -> &Self {
        self.shared.enqueue(Command::new(name, args));
        self
    }

    /// Enqueue `PING`
    pub fn ping(&self) -> &Self {
        self.cmd("PING", vec![])
    }

    /// Enqueue `SET key value`
    pub fn set(&self, key: &str, value: &str) -> &Self {
        self.cmd("SET", vec![key.into(), value.into()])
    }

    /// Enqueue `GET key`
    pub fn get(&self, key: &str) -> &Self {
        self.cmd("GET", vec![key.into()])
    }

    /// Enqueue `MGET key…`
    pub fn mget(&self, keys: &[&str]) -> &Self {
        self.cmd("MGET", keys.iter().map(|k| RespValue::from(*k)).collect())
    }

    /// Enqueue `DEL key…`
    pub fn del(&self, keys: &[&str]) -> &Self {
        self.cmd("DEL", keys.iter().map(|k| RespValue::from(*k)).collect())
    }

    /// Enqueue `INCR key`
    pub fn incr(&self, key: &str) -> &Self {
        self.cmd("INCR", vec![key.into()])
    }

    /// Enqueue `DECR key`
    pub fn decr(&self, key: &str) -> &Self {
        self.cmd("DECR", vec![key.into()])
    }

    /// Enqueue `APPEND key value`
    pub fn append(&self, key: &str, value: &str) -> &Self {
        self.cmd("APPEND", vec![key.into(), value.into()])
    }

    /// Enqueue `EXISTS key…`
    pub fn exists(&self, keys: &[&str]) -> &Self {
        self.cmd("EXISTS", keys.iter().map(|k| RespValue::from(*k)).collect())
    }

    /// Enqueue `EVAL script numkeys keys… args…`
    pub fn eval(&self, script: &str, keys: &[&str], args: &[&str]) -> &Self {
        let mut cmd_args: Vec<RespValue> = vec![
            script.into(),
            RespValue::Integer(keys.len() as i64),
        ];
        cmd_args.extend(keys.iter().map(|k| RespValue::from(*k)));
        cmd_args.extend(args.iter().map(|a| RespValue::from(*a)));
        self.cmd("EVAL", cmd_args)
    }

    /// Number of commands waiting for the next flush
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.queued_len()
    }

    /// True when no commands are queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send the queued batch and return one reply per command, in order.
    ///
    /// Server error frames are returned as [`RespValue::Error`] values in
    /// their slot; they do not abort the batch.
    ///
    /// # Errors
    ///
    /// [`RedisError::ConnectionClosed`] fails the whole batch on transport
    /// loss; [`RedisError::BadResource`] when the connection closed
    /// underneath the queued batch.
    pub async fn flush(&self) -> RedisResult<Vec<RespValue>> {
        Arc::clone(&self.shared).flush().await
    }
}

impl Deref for Pipeline {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}
