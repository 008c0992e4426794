//! High-level client facade
//!
//! A [`Client`] holds an [`Executor`] and exposes one method per supported
//! command. Each method is a thin encoder plus reply shaper; the raw escape
//! hatch is [`Client::send_command`]. Pipelines, transactions and
//! subscriptions are created from here and bind to the same connection.

use crate::cluster::{ClusterExecutor, ClusterOpts, ConnectionFactory};
use crate::command::Command;
use crate::connection::Connection;
use crate::executor::{DirectExecutor, Executor};
use crate::pipeline::Pipeline;
use crate::pubsub::Subscription;
use bytes::Bytes;
use redlink_core::{
    config::ConnectOpts,
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::sync::Arc;
use tracing::debug;

/// Client facade over an executor
#[derive(Clone)]
pub struct Client {
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Connect eagerly: the socket is opened and handshaken before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Dial and handshake failures.
    pub async fn connect(opts: ConnectOpts) -> RedisResult<Self> {
        let conn = Arc::new(Connection::new(opts));
        conn.establish().await?;
        Ok(Self::from_connection(conn))
    }

    /// Create a client whose connection opens on the first command.
    ///
    /// `is_connected` stays false until a command has actually dialed the
    /// socket.
    #[must_use]
    pub fn connect_lazy(opts: ConnectOpts) -> Self {
        Self::from_connection(Arc::new(Connection::new(opts)))
    }

    /// Connect using a `redis://`/`rediss://` URL.
    ///
    /// # Errors
    ///
    /// URL parse errors, dial and handshake failures.
    pub async fn connect_url(url: &str) -> RedisResult<Self> {
        Self::connect(ConnectOpts::from_url(url)?).await
    }

    /// Create a cluster-routed client over the given seed nodes.
    ///
    /// # Errors
    ///
    /// [`RedisError::ConnectError`] when no seed nodes were given.
    pub fn connect_cluster(opts: ClusterOpts) -> RedisResult<Self> {
        Ok(Self {
            executor: Arc::new(ClusterExecutor::new(opts)?),
        })
    }

    /// Cluster client with a custom connection factory (tests intercept the
    /// factory to simulate redirects).
    ///
    /// # Errors
    ///
    /// [`RedisError::ConnectError`] when no seed nodes were given.
    pub fn connect_cluster_with_factory(
        opts: ClusterOpts,
        factory: ConnectionFactory,
    ) -> RedisResult<Self> {
        Ok(Self {
            executor: Arc::new(ClusterExecutor::with_factory(opts, factory)?),
        })
    }

    /// Wrap an arbitrary executor
    #[must_use]
    pub fn from_executor(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    fn from_connection(conn: Arc<Connection>) -> Self {
        spawn_health_check(&conn);
        Self {
            executor: Arc::new(DirectExecutor::new(conn)),
        }
    }

    /// True while the underlying connection is up and handshaken
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.executor
            .connection()
            .is_some_and(|conn| conn.is_connected())
    }

    /// True once the underlying connection has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.executor
            .connection()
            .is_some_and(|conn| conn.is_closed())
    }

    /// Close the client and cancel queued commands
    pub async fn close(&self) {
        self.executor.close().await;
    }

    /// Raw escape hatch: run a command and return the tagged reply value
    ///
    /// # Errors
    ///
    /// Server error frames surface as [`RedisError::ErrorReply`].
    pub async fn send_command(&self, name: &str, args: Vec<RespValue>) -> RedisResult<RespValue> {
        self.executor.exec(Command::new(name, args)).await
    }

    /// Create a pipeline bound to this client's connection.
    ///
    /// # Errors
    ///
    /// [`RedisError::ConnectError`] on executors without a dedicated
    /// connection (cluster clients).
    pub fn pipeline(&self) -> RedisResult<Pipeline> {
        let conn = self.dedicated_connection()?;
        Ok(Pipeline::new(conn, false))
    }

    /// Create a `MULTI`/`EXEC` transaction bound to this client's connection.
    ///
    /// # Errors
    ///
    /// [`RedisError::ConnectError`] on executors without a dedicated
    /// connection (cluster clients).
    pub fn tx(&self) -> RedisResult<Pipeline> {
        let conn = self.dedicated_connection()?;
        Ok(Pipeline::new(conn, true))
    }

    /// Subscribe to channels; the connection switches into sub mode and
    /// regular commands on this client fail with
    /// [`RedisError::BadResource`] until it is closed.
    ///
    /// # Errors
    ///
    /// Dial failures, and [`RedisError::ConnectError`] on cluster clients.
    pub async fn subscribe(&self, channels: &[&str]) -> RedisResult<Subscription> {
        let conn = self.dedicated_connection()?;
        Subscription::start(conn, channels, &[]).await
    }

    /// Subscribe to patterns; see [`Client::subscribe`]
    ///
    /// # Errors
    ///
    /// Dial failures, and [`RedisError::ConnectError`] on cluster clients.
    pub async fn psubscribe(&self, patterns: &[&str]) -> RedisResult<Subscription> {
        let conn = self.dedicated_connection()?;
        Subscription::start(conn, &[], patterns).await
    }

    fn dedicated_connection(&self) -> RedisResult<Arc<Connection>> {
        self.executor.connection().ok_or_else(|| {
            RedisError::ConnectError(
                "operation requires a dedicated node connection".to_string(),
            )
        })
    }

    async fn exec(&self, name: &str, args: Vec<RespValue>) -> RedisResult<RespValue> {
        self.executor.exec(Command::new(name, args)).await
    }

    // --- command surface -------------------------------------------------

    /// `PING`
    pub async fn ping(&self) -> RedisResult<String> {
        self.exec("PING", vec![]).await?.as_string()
    }

    /// `GET key`
    pub async fn get(&self, key: &str) -> RedisResult<Option<String>> {
        let reply = self.exec("GET", vec![key.into()]).await?;
        if reply.is_null() {
            Ok(None)
        } else {
            Ok(Some(reply.as_string()?))
        }
    }

    /// `GET key`, returning the raw bulk bytes
    pub async fn get_buf(&self, key: &str) -> RedisResult<Option<Bytes>> {
        let reply = self.exec("GET", vec![key.into()]).await?;
        if reply.is_null() {
            Ok(None)
        } else {
            Ok(Some(reply.as_bytes()?))
        }
    }

    /// `SET key value`
    pub async fn set(&self, key: &str, value: &str) -> RedisResult<String> {
        self.exec("SET", vec![key.into(), value.into()])
            .await?
            .as_string()
    }

    /// `APPEND key value`
    pub async fn append(&self, key: &str, value: &str) -> RedisResult<i64> {
        self.exec("APPEND", vec![key.into(), value.into()])
            .await?
            .as_int()
    }

    /// `EXISTS key…`
    pub async fn exists(&self, keys: &[&str]) -> RedisResult<i64> {
        self.exec("EXISTS", to_args(keys)).await?.as_int()
    }

    /// `MGET key…`
    pub async fn mget(&self, keys: &[&str]) -> RedisResult<Vec<Option<String>>> {
        let reply = self.exec("MGET", to_args(keys)).await?;
        reply
            .as_array()?
            .into_iter()
            .map(|value| {
                if value.is_null() {
                    Ok(None)
                } else {
                    Ok(Some(value.as_string()?))
                }
            })
            .collect()
    }

    /// `MSET key value…`
    pub async fn mset(&self, pairs: &[(&str, &str)]) -> RedisResult<String> {
        self.exec("MSET", to_pair_args(pairs)).await?.as_string()
    }

    /// `MSETNX key value…`
    pub async fn msetnx(&self, pairs: &[(&str, &str)]) -> RedisResult<i64> {
        self.exec("MSETNX", to_pair_args(pairs)).await?.as_int()
    }

    /// `INCR key`
    pub async fn incr(&self, key: &str) -> RedisResult<i64> {
        self.exec("INCR", vec![key.into()]).await?.as_int()
    }

    /// `DECR key`
    pub async fn decr(&self, key: &str) -> RedisResult<i64> {
        self.exec("DECR", vec![key.into()]).await?.as_int()
    }

    /// `INCRBY key increment`
    pub async fn incrby(&self, key: &str, increment: i64) -> RedisResult<i64> {
        self.exec("INCRBY", vec![key.into(), RespValue::Integer(increment)])
            .await?
            .as_int()
    }

    /// `DECRBY key decrement`
    pub async fn decrby(&self, key: &str, decrement: i64) -> RedisResult<i64> {
        self.exec("DECRBY", vec![key.into(), RespValue::Integer(decrement)])
            .await?
            .as_int()
    }

    /// `INCRBYFLOAT key increment`
    pub async fn incrbyfloat(&self, key: &str, increment: f64) -> RedisResult<f64> {
        self.exec(
            "INCRBYFLOAT",
            vec![key.into(), increment.to_string().as_str().into()],
        )
        .await?
        .parse_with(|raw| {
            std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| RedisError::Type("expected a float reply".to_string()))
        })
    }

    /// `SETBIT key offset value`
    pub async fn setbit(&self, key: &str, offset: u64, value: bool) -> RedisResult<i64> {
        self.exec(
            "SETBIT",
            vec![
                key.into(),
                RespValue::Integer(offset as i64),
                RespValue::Integer(i64::from(value)),
            ],
        )
        .await?
        .as_int()
    }

    /// `GETBIT key offset`
    pub async fn getbit(&self, key: &str, offset: u64) -> RedisResult<i64> {
        self.exec("GETBIT", vec![key.into(), RespValue::Integer(offset as i64)])
            .await?
            .as_int()
    }

    /// `BITCOUNT key`
    pub async fn bitcount(&self, key: &str) -> RedisResult<i64> {
        self.exec("BITCOUNT", vec![key.into()]).await?.as_int()
    }

    /// `BITCOUNT key start end`
    pub async fn bitcount_range(&self, key: &str, start: i64, end: i64) -> RedisResult<i64> {
        self.exec(
            "BITCOUNT",
            vec![
                key.into(),
                RespValue::Integer(start),
                RespValue::Integer(end),
            ],
        )
        .await?
        .as_int()
    }

    /// `BITOP operation destkey key…`
    pub async fn bitop(&self, operation: &str, destkey: &str, keys: &[&str]) -> RedisResult<i64> {
        let mut args: Vec<RespValue> = vec![operation.into(), destkey.into()];
        args.extend(keys.iter().map(|k| RespValue::from(*k)));
        self.exec("BITOP", args).await?.as_int()
    }

    /// `BITPOS key bit`
    pub async fn bitpos(&self, key: &str, bit: bool) -> RedisResult<i64> {
        self.exec("BITPOS", vec![key.into(), RespValue::Integer(i64::from(bit))])
            .await?
            .as_int()
    }

    /// `BITFIELD key subcommand…`
    pub async fn bitfield(
        &self,
        key: &str,
        subcommands: &[&str],
    ) -> RedisResult<Vec<Option<i64>>> {
        let mut args: Vec<RespValue> = vec![key.into()];
        args.extend(subcommands.iter().map(|s| RespValue::from(*s)));
        let reply = self.exec("BITFIELD", args).await?;
        reply
            .as_array()?
            .into_iter()
            .map(|value| {
                if value.is_null() {
                    Ok(None)
                } else {
                    Ok(Some(value.as_int()?))
                }
            })
            .collect()
    }

    /// `GETRANGE key start end`
    pub async fn getrange(&self, key: &str, start: i64, end: i64) -> RedisResult<String> {
        self.exec(
            "GETRANGE",
            vec![
                key.into(),
                RespValue::Integer(start),
                RespValue::Integer(end),
            ],
        )
        .await?
        .as_string()
    }

    /// `SETRANGE key offset value`
    pub async fn setrange(&self, key: &str, offset: u64, value: &str) -> RedisResult<i64> {
        self.exec(
            "SETRANGE",
            vec![key.into(), RespValue::Integer(offset as i64), value.into()],
        )
        .await?
        .as_int()
    }

    /// `GETSET key value`
    pub async fn getset(&self, key: &str, value: &str) -> RedisResult<Option<String>> {
        let reply = self.exec("GETSET", vec![key.into(), value.into()]).await?;
        if reply.is_null() {
            Ok(None)
        } else {
            Ok(Some(reply.as_string()?))
        }
    }

    /// `STRLEN key`
    pub async fn strlen(&self, key: &str) -> RedisResult<i64> {
        self.exec("STRLEN", vec![key.into()]).await?.as_int()
    }

    /// `SETEX key seconds value`
    pub async fn setex(&self, key: &str, seconds: u64, value: &str) -> RedisResult<String> {
        self.exec(
            "SETEX",
            vec![key.into(), RespValue::Integer(seconds as i64), value.into()],
        )
        .await?
        .as_string()
    }

    /// `PSETEX key milliseconds value`
    pub async fn psetex(&self, key: &str, milliseconds: u64, value: &str) -> RedisResult<String> {
        self.exec(
            "PSETEX",
            vec![
                key.into(),
                RespValue::Integer(milliseconds as i64),
                value.into(),
            ],
        )
        .await?
        .as_string()
    }

    /// `SETNX key value`
    pub async fn setnx(&self, key: &str, value: &str) -> RedisResult<i64> {
        self.exec("SETNX", vec![key.into(), value.into()])
            .await?
            .as_int()
    }

    /// `DEL key…`
    pub async fn del(&self, keys: &[&str]) -> RedisResult<i64> {
        self.exec("DEL", to_args(keys)).await?.as_int()
    }

    /// `FLUSHDB`
    pub async fn flushdb(&self) -> RedisResult<String> {
        self.exec("FLUSHDB", vec![]).await?.as_string()
    }

    /// `EVAL script numkeys key… arg…`, returning the tagged reply
    pub async fn eval(
        &self,
        script: &str,
        keys: &[&str],
        args: &[&str],
    ) -> RedisResult<RespValue> {
        let mut cmd_args: Vec<RespValue> =
            vec![script.into(), RespValue::Integer(keys.len() as i64)];
        cmd_args.extend(keys.iter().map(|k| RespValue::from(*k)));
        cmd_args.extend(args.iter().map(|a| RespValue::from(*a)));
        self.exec("EVAL", cmd_args).await
    }

    /// `PUBLISH channel message`, returning the receiver count
    pub async fn publish(&self, channel: &str, message: &str) -> RedisResult<i64> {
        self.exec("PUBLISH", vec![channel.into(), message.into()])
            .await?
            .as_int()
    }
}

fn to_args(keys: &[&str]) -> Vec<RespValue> {
    keys.iter().map(|k| RespValue::from(*k)).collect()
}

fn to_pair_args(pairs: &[(&str, &str)]) -> Vec<RespValue> {
    let mut args = Vec::with_capacity(pairs.len() * 2);
    for (key, value) in pairs {
        args.push(RespValue::from(*key));
        args.push(RespValue::from(*value));
    }
    args
}

fn spawn_health_check(conn: &Arc<Connection>) {
    let Some(interval) = conn.opts().health_check_interval else {
        return;
    };
    let weak = Arc::downgrade(conn);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(conn) = weak.upgrade() else { break };
            if conn.is_closed() {
                break;
            }
            // Never dial on behalf of a lazy client, and never interfere
            // with a connection a subscription owns.
            if !conn.is_connected() || conn.in_sub_mode() {
                continue;
            }
            if let Err(e) = conn.exec(&Command::new("PING", vec![])).await {
                debug!("health check ping failed: {}", e);
            }
        }
    });
}
