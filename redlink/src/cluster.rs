//! Cluster-aware command dispatch
//!
//! Routes each command to the node owning its hash slot and transparently
//! follows `-MOVED` and `-ASK` redirections. The slot map starts empty and
//! is learned reactively: only a `-MOVED` reply updates it. Connections are
//! memoized per `host:port` and created through a factory so tests can
//! intercept them.

use crate::command::Command;
use crate::connection::Connection;
use crate::executor::Executor;
use crc16::{State, XMODEM};
use redlink_core::{
    config::ConnectOpts,
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Total number of hash slots in a cluster keyspace
pub const CLUSTER_SLOTS: u16 = 16384;

/// Calculate the hash slot for a key.
///
/// When the key contains a non-empty `{…}` hash tag, only the tag content is
/// hashed, so related keys can be pinned to one slot. The hash is
/// CRC16/XMODEM mod 16384.
#[must_use]
pub fn calculate_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(extract_hash_tag(key)) % CLUSTER_SLOTS
}

/// The keyslot rules hash only the content of the first `{…}` section when
/// that content is non-empty; an empty `{}` or an unclosed `{` leaves the
/// whole key as the hashing input.
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let inner = &key[open + 1..];
    match inner.iter().position(|&b| b == b'}') {
        Some(close) if close > 0 => &inner[..close],
        _ => key,
    }
}

/// Options for a cluster dispatcher
#[derive(Clone)]
pub struct ClusterOpts {
    /// Seed nodes used before the slot map has learned an owner
    pub nodes: Vec<(String, u16)>,
    /// Redirect hops tolerated for one command
    pub max_redirections: u32,
    /// Per-node connection template; hostname and port are overridden
    pub connect: ConnectOpts,
}

impl ClusterOpts {
    /// Options with the default redirection budget of 16
    #[must_use]
    pub fn new(nodes: Vec<(String, u16)>) -> Self {
        Self {
            nodes,
            max_redirections: 16,
            connect: ConnectOpts::default(),
        }
    }

    /// Set the redirection budget
    #[must_use]
    pub const fn with_max_redirections(mut self, max: u32) -> Self {
        self.max_redirections = max;
        self
    }

    /// Set the per-node connection template
    #[must_use]
    pub fn with_connect_opts(mut self, connect: ConnectOpts) -> Self {
        self.connect = connect;
        self
    }
}

/// Creates the connection for one node; tests swap this out
pub type ConnectionFactory = Arc<dyn Fn(ConnectOpts) -> Arc<Connection> + Send + Sync>;

/// Keyed routing layer over a pool of per-node connections
pub struct ClusterExecutor {
    opts: ClusterOpts,
    factory: ConnectionFactory,
    slot_map: RwLock<HashMap<u16, (String, u16)>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    closed: AtomicBool,
}

impl ClusterExecutor {
    /// Dispatcher with the default connection factory.
    ///
    /// # Errors
    ///
    /// [`RedisError::ConnectError`] when no seed nodes were given.
    pub fn new(opts: ClusterOpts) -> RedisResult<Self> {
        Self::with_factory(opts, Arc::new(|opts| Arc::new(Connection::new(opts))))
    }

    /// Dispatcher with a custom connection factory.
    ///
    /// # Errors
    ///
    /// [`RedisError::ConnectError`] when no seed nodes were given.
    pub fn with_factory(opts: ClusterOpts, factory: ConnectionFactory) -> RedisResult<Self> {
        if opts.nodes.is_empty() {
            return Err(RedisError::ConnectError(
                "no cluster nodes specified".to_string(),
            ));
        }
        Ok(Self {
            opts,
            factory,
            slot_map: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Current owner of a slot, when one has been learned
    pub async fn slot_owner(&self, slot: u16) -> Option<(String, u16)> {
        self.slot_map.read().await.get(&slot).cloned()
    }

    fn slot_for(&self, command: &Command) -> RedisResult<Option<u16>> {
        let keys = command.keys();
        let Some(first) = keys.first() else {
            return Ok(None);
        };
        let slot = calculate_slot(first);
        for key in &keys[1..] {
            if calculate_slot(key) != slot {
                return Err(RedisError::CrossSlot(
                    "CROSSSLOT Keys in request don't hash to the same slot".to_string(),
                ));
            }
        }
        Ok(Some(slot))
    }

    async fn route(&self, slot: Option<u16>) -> (String, u16) {
        if let Some(slot) = slot {
            if let Some(node) = self.slot_map.read().await.get(&slot) {
                return node.clone();
            }
        }
        self.opts.nodes[0].clone()
    }

    async fn connection_for(&self, node: &(String, u16)) -> Arc<Connection> {
        let key = format!("{}:{}", node.0, node.1);

        {
            let connections = self.connections.read().await;
            if let Some(conn) = connections.get(&key) {
                if !conn.is_closed() {
                    return Arc::clone(conn);
                }
            }
        }

        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get(&key) {
            if !conn.is_closed() {
                return Arc::clone(conn);
            }
        }

        let mut opts = self.opts.connect.clone();
        opts.hostname = node.0.clone();
        opts.port = node.1;
        let conn = (self.factory)(opts);
        connections.insert(key, Arc::clone(&conn));
        conn
    }

    /// Replay a command behind `ASKING` as one serialized batch
    async fn exec_asking(&self, conn: &Connection, command: &Command) -> RedisResult<RespValue> {
        let batch = vec![Command::new("ASKING", vec![]), command.clone()];
        let mut replies = conn.exec_batch(&batch).await?;
        match replies.pop() {
            Some(RespValue::Error(msg)) => Err(RedisError::from_reply_text(&msg)),
            Some(value) => Ok(value),
            None => Err(RedisError::ConnectionClosed),
        }
    }
}

#[async_trait::async_trait]
impl Executor for ClusterExecutor {
    async fn exec(&self, command: Command) -> RedisResult<RespValue> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RedisError::BadResource);
        }

        let slot = self.slot_for(&command)?;
        let mut target = self.route(slot).await;
        let mut asking = false;
        let mut redirections = 0u32;

        loop {
            let conn = self.connection_for(&target).await;
            let result = if asking {
                self.exec_asking(&conn, &command).await
            } else {
                conn.exec(&command).await
            };

            match result {
                Err(RedisError::Moved { slot, host, port }) => {
                    debug!("slot {} moved to {}:{}", slot, host, port);
                    self.slot_map
                        .write()
                        .await
                        .insert(slot, (host.clone(), port));
                    target = (host, port);
                    asking = false;
                }
                Err(RedisError::Ask { slot, host, port }) => {
                    debug!("slot {} asks for one-shot redirect to {}:{}", slot, host, port);
                    target = (host, port);
                    asking = true;
                }
                other => return other,
            }

            redirections += 1;
            if redirections > self.opts.max_redirections {
                warn!(
                    "redirection budget of {} exhausted for {}",
                    self.opts.max_redirections, command.name
                );
                return Err(RedisError::TooManyRedirections);
            }
        }
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        None
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut connections = self.connections.write().await;
        for (_, conn) in connections.drain() {
            conn.close().await;
        }
    }
}
