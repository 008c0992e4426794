//! Connection lifecycle: handshake, health state, reconnect policy
//!
//! A [`Connection`] wraps a [`Transport`] with the server handshake
//! (`AUTH`/`SELECT`/`CLIENT SETNAME`), a small state machine, and the
//! command-retry discipline: transport failures observed before any reply
//! byte trigger reconnect attempts with backoff, and the in-flight command
//! is replayed once the connection is ready again.

use crate::command::Command;
use crate::protocol::RespEncoder;
use crate::transport::Transport;
use redlink_core::{
    config::ConnectOpts,
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; nothing attempted yet or explicitly closed
    Closed,
    /// Dial or handshake in progress
    Connecting,
    /// Transport up and handshaken
    Ready,
    /// Transport lost; reconnect pending or retries exhausted
    Broken,
    /// Close in progress
    Draining,
}

/// A connection to one server.
///
/// All command traffic is serialized through a fair async mutex so replies
/// align with requests; the transport is created lazily on the first command
/// unless [`Connection::establish`] is called first.
pub struct Connection {
    opts: ConnectOpts,
    io: Mutex<Option<Transport>>,
    state: StdMutex<ConnectionState>,
    generation: AtomicU64,
    sub_mode: AtomicBool,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Connection {
    /// Create a connection; no socket work happens until the first command
    #[must_use]
    pub fn new(opts: ConnectOpts) -> Self {
        Self {
            opts,
            io: Mutex::new(None),
            state: StdMutex::new(ConnectionState::Closed),
            generation: AtomicU64::new(0),
            sub_mode: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    /// Connect options this connection was created with
    #[must_use]
    pub fn opts(&self) -> &ConnectOpts {
        &self.opts
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// True while the transport is up and handshaken
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready && !self.is_closed()
    }

    /// True once the connection has been explicitly closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True while a subscription owns the transport
    #[must_use]
    pub fn in_sub_mode(&self) -> bool {
        self.sub_mode.load(Ordering::SeqCst)
    }

    /// Bumped on every successful (re)connect
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    pub(crate) fn close_signal(&self) -> &Notify {
        &self.close_signal
    }

    /// Open the transport eagerly.
    ///
    /// # Errors
    ///
    /// Dial and handshake failures; no retry is applied here.
    pub async fn establish(&self) -> RedisResult<()> {
        if self.is_closed() {
            return Err(RedisError::BadResource);
        }
        let mut io = self.io.lock().await;
        if io.is_some() {
            return Ok(());
        }
        match self.dial().await {
            Ok(transport) => {
                *io = Some(transport);
                self.set_state(ConnectionState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Broken);
                Err(e)
            }
        }
    }

    /// Execute one command and return its reply.
    ///
    /// Server error frames come back as errors here; redirect frames are
    /// classified into their [`RedisError::Moved`]/[`RedisError::Ask`]
    /// variants for the cluster dispatcher.
    ///
    /// # Errors
    ///
    /// [`RedisError::BadResource`] after close or while a subscription owns
    /// the transport; [`RedisError::ConnectionClosed`] when the retry budget
    /// is exhausted or the stream died mid-reply.
    pub async fn exec(&self, command: &Command) -> RedisResult<RespValue> {
        if self.is_closed() || self.in_sub_mode() {
            return Err(RedisError::BadResource);
        }

        let mut io = self.io.lock().await;
        if self.is_closed() {
            return Err(RedisError::BadResource);
        }

        let payload = RespEncoder::encode_command(command);

        if io.is_none() {
            match self.dial().await {
                Ok(transport) => {
                    *io = Some(transport);
                    self.set_state(ConnectionState::Ready);
                }
                Err(e) if e.is_transport_error() => {
                    return self.reconnect_and_replay(&mut io, &payload).await;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Broken);
                    return Err(e);
                }
            }
        }

        let transport = match io.as_mut() {
            Some(transport) => transport,
            None => return Err(RedisError::ConnectionClosed),
        };

        match transport.send(&payload).await {
            Ok(value) => Self::finalize(value),
            Err(e) if e.is_transport_error() => {
                self.reconnect_and_replay(&mut io, &payload).await
            }
            Err(e) => {
                // Mid-reply loss or a framing violation: reply semantics are
                // unknown, so the command is not replayed.
                *io = None;
                self.set_state(ConnectionState::Broken);
                Err(e)
            }
        }
    }

    /// Write a batch of commands contiguously and read one reply per command.
    ///
    /// Error frames are returned in place inside the reply list. A transport
    /// failure fails the whole batch with [`RedisError::ConnectionClosed`]
    /// and is never retried; partially observed replies are discarded.
    pub async fn exec_batch(&self, commands: &[Command]) -> RedisResult<Vec<RespValue>> {
        if self.is_closed() || self.in_sub_mode() {
            return Err(RedisError::BadResource);
        }
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut io = self.io.lock().await;
        if self.is_closed() {
            return Err(RedisError::BadResource);
        }

        if io.is_none() {
            match self.dial().await {
                Ok(transport) => {
                    *io = Some(transport);
                    self.set_state(ConnectionState::Ready);
                }
                Err(e) => {
                    self.set_state(ConnectionState::Broken);
                    return Err(e);
                }
            }
        }

        let transport = match io.as_mut() {
            Some(transport) => transport,
            None => return Err(RedisError::ConnectionClosed),
        };

        let payload = RespEncoder::encode_batch(commands);
        match Self::batch_roundtrip(transport, &payload, commands.len()).await {
            Ok(replies) => Ok(replies),
            Err(e) => {
                *io = None;
                self.set_state(ConnectionState::Broken);
                if e.is_transport_error() {
                    Err(RedisError::ConnectionClosed)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn batch_roundtrip(
        transport: &mut Transport,
        payload: &[u8],
        count: usize,
    ) -> RedisResult<Vec<RespValue>> {
        transport.write_all(payload).await?;
        transport.flush().await?;
        let mut replies = Vec::with_capacity(count);
        for _ in 0..count {
            replies.push(transport.read_reply().await?);
        }
        Ok(replies)
    }

    async fn reconnect_and_replay(
        &self,
        io: &mut Option<Transport>,
        payload: &[u8],
    ) -> RedisResult<RespValue> {
        *io = None;
        self.set_state(ConnectionState::Broken);

        for attempt in 1..=self.opts.max_retry_count {
            sleep(self.opts.backoff.delay(attempt)).await;
            if self.is_closed() {
                return Err(RedisError::BadResource);
            }
            warn!(
                attempt,
                "reconnecting to {} (max {})",
                self.opts.address(),
                self.opts.max_retry_count
            );

            match self.dial().await {
                Ok(mut transport) => match transport.send(payload).await {
                    Ok(value) => {
                        *io = Some(transport);
                        self.set_state(ConnectionState::Ready);
                        info!("reconnected to {}", self.opts.address());
                        return Self::finalize(value);
                    }
                    Err(e) if e.is_transport_error() => {
                        self.set_state(ConnectionState::Broken);
                    }
                    Err(e) => {
                        self.set_state(ConnectionState::Broken);
                        return Err(e);
                    }
                },
                // Handshake failures (bad auth, bad db) never heal by
                // retrying.
                Err(e @ RedisError::ConnectError(_)) => return Err(e),
                Err(e) => {
                    debug!("reconnect attempt {} failed: {}", attempt, e);
                }
            }
        }

        Err(RedisError::ConnectionClosed)
    }

    fn finalize(value: RespValue) -> RedisResult<RespValue> {
        match value {
            RespValue::Error(msg) => Err(RedisError::from_reply_text(&msg)),
            value => Ok(value),
        }
    }

    async fn dial(&self) -> RedisResult<Transport> {
        self.set_state(ConnectionState::Connecting);
        let transport = establish(&self.opts).await?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(transport)
    }

    /// Hand the transport to a subscription; the connection then rejects
    /// regular commands with [`RedisError::BadResource`] until closed.
    pub(crate) async fn take_transport(&self) -> RedisResult<Transport> {
        if self.is_closed() {
            return Err(RedisError::BadResource);
        }
        let mut io = self.io.lock().await;
        if self.is_closed() {
            return Err(RedisError::BadResource);
        }
        if io.is_none() {
            let transport = self.dial().await.map_err(|e| {
                self.set_state(ConnectionState::Broken);
                e
            })?;
            *io = Some(transport);
        }
        self.set_state(ConnectionState::Ready);
        self.sub_mode.store(true, Ordering::SeqCst);
        match io.take() {
            Some(transport) => Ok(transport),
            None => Err(RedisError::ConnectionClosed),
        }
    }

    /// Close the connection; queued commands observe
    /// [`RedisError::BadResource`]. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Draining);
        self.close_signal.notify_one();
        let mut io = self.io.lock().await;
        if let Some(mut transport) = io.take() {
            transport.close().await;
        }
        self.set_state(ConnectionState::Closed);
        debug!("connection to {} closed", self.opts.address());
    }
}

/// Dial a transport and run the handshake, leaving it ready for traffic.
///
/// Handshake order: `AUTH [username] password` when a password is set,
/// `SELECT db` when db > 0, `CLIENT SETNAME name` when a name is set. Any
/// failure is a fatal [`RedisError::ConnectError`].
pub(crate) async fn establish(opts: &ConnectOpts) -> RedisResult<Transport> {
    let mut transport = Transport::connect(opts).await?;
    handshake(&mut transport, opts).await?;
    Ok(transport)
}

async fn handshake(transport: &mut Transport, opts: &ConnectOpts) -> RedisResult<()> {
    let mut setup: Vec<Command> = Vec::new();

    if let Some(password) = &opts.password {
        let mut args: Vec<RespValue> = Vec::new();
        if let Some(username) = &opts.username {
            args.push(username.as_str().into());
        }
        args.push(password.as_str().into());
        setup.push(Command::new("AUTH", args));
    }
    if opts.db > 0 {
        setup.push(Command::new(
            "SELECT",
            vec![RespValue::Integer(i64::from(opts.db))],
        ));
    }
    if let Some(name) = &opts.name {
        setup.push(Command::new(
            "CLIENT",
            vec!["SETNAME".into(), name.as_str().into()],
        ));
    }

    for command in setup {
        let payload = RespEncoder::encode_command(&command);
        match transport.send(&payload).await {
            Ok(RespValue::Error(msg)) => {
                return Err(RedisError::ConnectError(format!(
                    "{} failed: {}",
                    command.name, msg
                )));
            }
            Ok(_) => {}
            Err(e) => {
                return Err(RedisError::ConnectError(format!(
                    "{} failed during handshake: {}",
                    command.name, e
                )));
            }
        }
    }

    Ok(())
}
