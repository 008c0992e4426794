//! Publish/subscribe support
//!
//! A [`Subscription`] takes exclusive ownership of a connection's transport
//! and multiplexes server-pushed messages with subscription control
//! commands. Messages arrive through a bounded inbox consumed as a
//! [`futures_util::Stream`]; the stream is single-consumer, is not
//! restartable, and terminates cleanly when the subscription or its
//! connection closes.
//!
//! Tracked channel and pattern names survive reconnects: after a transport
//! loss the driver redials with backoff, re-runs the handshake, replays
//! `SUBSCRIBE`/`PSUBSCRIBE` for every tracked name, and resumes reading.
//! Messages published during the outage are lost (Redis Pub/Sub is not
//! durable).

use crate::command::Command;
use crate::connection::{self, Connection};
use crate::protocol::RespEncoder;
use crate::transport::{ReadEnd, WriteEnd};
use futures_util::Stream;
use redlink_core::{
    config::ConnectOpts,
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const INBOX_CAPACITY: usize = 1024;

/// A message received from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// The channel the message was published to
    pub channel: String,
    /// The message payload
    pub payload: String,
    /// The pattern that matched, for pattern subscriptions
    pub pattern: Option<String>,
}

struct SubscriptionShared {
    opts: ConnectOpts,
    writer: Mutex<Option<WriteEnd>>,
    channels: StdMutex<BTreeSet<String>>,
    patterns: StdMutex<BTreeSet<String>>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl SubscriptionShared {
    fn tracked_channels(&self) -> Vec<String> {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn tracked_patterns(&self) -> Vec<String> {
        self.patterns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn has_tracked_names(&self) -> bool {
        !self.tracked_channels().is_empty() || !self.tracked_patterns().is_empty()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send_control(&self, name: &str, args: &[String]) -> RedisResult<()> {
        let command = Command::new(
            name,
            args.iter().map(|a| RespValue::from(a.as_str())).collect(),
        );
        let payload = RespEncoder::encode_command(&command);
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                w.write_all(&payload).await?;
                w.flush().await
            }
            // Mid-reconnect; tracked names are replayed once the transport
            // is back.
            None => Ok(()),
        }
    }
}

/// An active subscription over one dedicated connection
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
    inbox: mpsc::Receiver<PubSubMessage>,
    conn: Arc<Connection>,
}

impl Subscription {
    pub(crate) async fn start(
        conn: Arc<Connection>,
        channels: &[&str],
        patterns: &[&str],
    ) -> RedisResult<Self> {
        let transport = conn.take_transport().await?;
        let (read, write) = transport.into_split();

        let shared = Arc::new(SubscriptionShared {
            opts: conn.opts().clone(),
            writer: Mutex::new(Some(write)),
            channels: StdMutex::new(BTreeSet::new()),
            patterns: StdMutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        });

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let subscription = Self {
            shared: Arc::clone(&shared),
            inbox: inbox_rx,
            conn: Arc::clone(&conn),
        };

        subscription.subscribe(channels).await?;
        subscription.psubscribe(patterns).await?;

        tokio::spawn(drive(shared, conn, read, inbox_tx));
        Ok(subscription)
    }

    /// Add channels to the subscription
    pub async fn subscribe(&self, channels: &[&str]) -> RedisResult<()> {
        if channels.is_empty() {
            return Ok(());
        }
        if self.shared.is_closed() {
            return Err(RedisError::BadResource);
        }
        let names: Vec<String> = channels.iter().map(|c| (*c).to_string()).collect();
        {
            let mut set = self
                .shared
                .channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            set.extend(names.iter().cloned());
        }
        self.shared.send_control("SUBSCRIBE", &names).await
    }

    /// Remove channels from the subscription; the bare form (no names)
    /// unsubscribes from every tracked channel, like the wire command.
    ///
    /// Unsubscribing the last tracked name terminates the message stream.
    pub async fn unsubscribe(&self, channels: &[&str]) -> RedisResult<()> {
        if self.shared.is_closed() {
            return Err(RedisError::BadResource);
        }
        let names: Vec<String> = channels.iter().map(|c| (*c).to_string()).collect();
        {
            let mut set = self
                .shared
                .channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if names.is_empty() {
                set.clear();
            } else {
                for name in &names {
                    set.remove(name);
                }
            }
        }
        self.shared.send_control("UNSUBSCRIBE", &names).await
    }

    /// Add patterns to the subscription
    pub async fn psubscribe(&self, patterns: &[&str]) -> RedisResult<()> {
        if patterns.is_empty() {
            return Ok(());
        }
        if self.shared.is_closed() {
            return Err(RedisError::BadResource);
        }
        let names: Vec<String> = patterns.iter().map(|p| (*p).to_string()).collect();
        {
            let mut set = self
                .shared
                .patterns
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            set.extend(names.iter().cloned());
        }
        self.shared.send_control("PSUBSCRIBE", &names).await
    }

    /// Remove patterns from the subscription; the bare form (no names)
    /// unsubscribes from every tracked pattern, like the wire command.
    pub async fn punsubscribe(&self, patterns: &[&str]) -> RedisResult<()> {
        if self.shared.is_closed() {
            return Err(RedisError::BadResource);
        }
        let names: Vec<String> = patterns.iter().map(|p| (*p).to_string()).collect();
        {
            let mut set = self
                .shared
                .patterns
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if names.is_empty() {
                set.clear();
            } else {
                for name in &names {
                    set.remove(name);
                }
            }
        }
        self.shared.send_control("PUNSUBSCRIBE", &names).await
    }

    /// Send the `PING` allowed inside sub mode; the pong is consumed by the
    /// driver.
    pub async fn ping(&self) -> RedisResult<()> {
        if self.shared.is_closed() {
            return Err(RedisError::BadResource);
        }
        self.shared.send_control("PING", &[]).await
    }

    /// Channels currently tracked
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.shared.tracked_channels()
    }

    /// Patterns currently tracked
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        self.shared.tracked_patterns()
    }

    /// Next pushed message; `None` once the subscription has terminated
    pub async fn next_message(&mut self) -> Option<PubSubMessage> {
        self.inbox.recv().await
    }

    /// Drop all tracked names, notify the server best-effort, close the
    /// underlying connection, and end the message stream cleanly.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            self.shared
                .channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clear();
            self.shared
                .patterns
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clear();
        }

        let mut writer = self.shared.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            let farewell = RespEncoder::encode_batch(&[
                Command::new("UNSUBSCRIBE", vec![]),
                Command::new("PUNSUBSCRIBE", vec![]),
            ]);
            let _ = w.write_all(&farewell).await;
            let _ = w.flush().await;
            w.shutdown().await;
        }
        *writer = None;
        drop(writer);

        self.shared.close_signal.notify_one();
        self.conn.close().await;
    }
}

impl Stream for Subscription {
    type Item = PubSubMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbox.poll_recv(cx)
    }
}

enum Push {
    Message(PubSubMessage),
    Ack { remaining: i64 },
    Other,
}

fn classify_push(value: RespValue) -> Push {
    let items = match value {
        RespValue::Array(items) => items,
        // A pong or stray frame; not a push.
        _ => return Push::Other,
    };

    let kind = match items.first().and_then(|v| v.as_string().ok()) {
        Some(kind) => kind,
        None => return Push::Other,
    };

    match (kind.as_str(), items.len()) {
        ("message", n) if n >= 3 => {
            match (items[1].as_string(), items[2].as_string()) {
                (Ok(channel), Ok(payload)) => Push::Message(PubSubMessage {
                    channel,
                    payload,
                    pattern: None,
                }),
                _ => Push::Other,
            }
        }
        ("pmessage", n) if n >= 4 => {
            match (
                items[1].as_string(),
                items[2].as_string(),
                items[3].as_string(),
            ) {
                (Ok(pattern), Ok(channel), Ok(payload)) => Push::Message(PubSubMessage {
                    channel,
                    payload,
                    pattern: Some(pattern),
                }),
                _ => Push::Other,
            }
        }
        ("subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe", n) if n >= 3 => Push::Ack {
            remaining: items[2].as_int().unwrap_or(-1),
        },
        _ => Push::Other,
    }
}

async fn drive(
    shared: Arc<SubscriptionShared>,
    conn: Arc<Connection>,
    mut read: ReadEnd,
    inbox: mpsc::Sender<PubSubMessage>,
) {
    loop {
        if shared.is_closed() || conn.is_closed() {
            break;
        }

        let frame = tokio::select! {
            () = shared.close_signal.notified() => break,
            () = conn.close_signal().notified() => break,
            frame = read.read_reply() => frame,
        };

        match frame {
            Ok(value) => match classify_push(value) {
                Push::Message(message) => {
                    if inbox.send(message).await.is_err() {
                        // Consumer dropped the subscription.
                        break;
                    }
                }
                Push::Ack { remaining } => {
                    debug!("subscription ack, {} active on server", remaining);
                    if remaining == 0 && !shared.has_tracked_names() {
                        break;
                    }
                }
                Push::Other => {}
            },
            Err(err) => {
                if shared.is_closed() || conn.is_closed() {
                    break;
                }
                if !shared.has_tracked_names() || shared.opts.max_retry_count == 0 {
                    break;
                }
                warn!("pub/sub transport lost: {}; reconnecting", err);
                match reconnect(&shared).await {
                    Some(new_read) => read = new_read,
                    None => break,
                }
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    debug!("pub/sub driver stopped");
}

async fn reconnect(shared: &Arc<SubscriptionShared>) -> Option<ReadEnd> {
    *shared.writer.lock().await = None;

    for attempt in 1..=shared.opts.max_retry_count {
        sleep(shared.opts.backoff.delay(attempt)).await;
        if shared.is_closed() {
            return None;
        }

        match connection::establish(&shared.opts).await {
            Ok(transport) => {
                let (read, mut write) = transport.into_split();

                let mut replay: Vec<Command> = Vec::new();
                let channels = shared.tracked_channels();
                if !channels.is_empty() {
                    replay.push(Command::new(
                        "SUBSCRIBE",
                        channels.iter().map(|c| RespValue::from(c.as_str())).collect(),
                    ));
                }
                let patterns = shared.tracked_patterns();
                if !patterns.is_empty() {
                    replay.push(Command::new(
                        "PSUBSCRIBE",
                        patterns.iter().map(|p| RespValue::from(p.as_str())).collect(),
                    ));
                }

                if !replay.is_empty() {
                    let payload = RespEncoder::encode_batch(&replay);
                    if write.write_all(&payload).await.is_err() || write.flush().await.is_err() {
                        continue;
                    }
                }

                *shared.writer.lock().await = Some(write);
                info!("pub/sub connection re-established");
                return Some(read);
            }
            Err(RedisError::ConnectError(e)) => {
                warn!("handshake failed during pub/sub reconnect: {}", e);
                return None;
            }
            Err(e) => {
                debug!("pub/sub reconnect attempt {} failed: {}", attempt, e);
            }
        }
    }

    None
}
