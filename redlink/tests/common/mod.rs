//! In-process RESP server used by the integration tests.
//!
//! Speaks enough of the protocol to exercise the client end-to-end: string
//! commands with shared state, `MULTI`/`EXEC`, pub/sub fan-out, and a
//! per-test override hook for scripting redirects and connection drops.

#![allow(dead_code)]

use bytes::{Buf, BytesMut};
use redlink::protocol::RespDecoder;
use redlink::RespValue;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Scripted response from an override hook
pub enum Action {
    /// Write these bytes as the reply
    Raw(Vec<u8>),
    /// Drop the connection on the spot
    Drop,
}

impl Action {
    pub fn raw(s: impl Into<String>) -> Self {
        Self::Raw(s.into().into_bytes())
    }
}

/// Consulted before the builtin handling; `None` falls through
pub type Override = Arc<dyn Fn(&[String]) -> Option<Action> + Send + Sync>;

struct Subscriber {
    push: mpsc::UnboundedSender<Vec<u8>>,
    channels: Arc<Mutex<HashSet<String>>>,
    patterns: Arc<Mutex<HashSet<String>>>,
}

struct Shared {
    kv: Mutex<HashMap<String, String>>,
    log: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<Subscriber>>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
    override_fn: Option<Override>,
}

pub struct MockServer {
    pub port: u16,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::spawn(0, None).await
    }

    pub async fn start_on(port: u16) -> Self {
        Self::spawn(port, None).await
    }

    pub async fn start_with(override_fn: Override) -> Self {
        Self::spawn(0, Some(override_fn)).await
    }

    pub async fn start_on_with(port: u16, override_fn: Override) -> Self {
        Self::spawn(port, Some(override_fn)).await
    }

    async fn spawn(port: u16, override_fn: Option<Override>) -> Self {
        let listener = bind_listener(port).await;
        let port = listener.local_addr().unwrap().port();

        let shared = Arc::new(Shared {
            kv: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            conn_tasks: Mutex::new(Vec::new()),
            override_fn,
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let conn_shared = Arc::clone(&accept_shared);
                let handle = tokio::spawn(serve_conn(socket, conn_shared));
                accept_shared.conn_tasks.lock().unwrap().push(handle);
            }
        });

        Self {
            port,
            shared,
            accept_task,
        }
    }

    /// Seed the server-side keyspace directly
    pub fn set_kv(&self, key: &str, value: &str) {
        self.shared
            .kv
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Every command line observed, in arrival order
    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn count_matching(&self, prefix: &str) -> usize {
        self.log().iter().filter(|l| l.starts_with(prefix)).count()
    }

    /// Kill the listener and every live connection; returns the port so a
    /// replacement server can be started on it.
    pub async fn stop(self) -> u16 {
        self.accept_task.abort();
        for handle in self.shared.conn_tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.port
    }
}

async fn bind_listener(port: u16) -> TcpListener {
    for _ in 0..100 {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        socket.set_reuse_address(true).unwrap();
        let addr: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        if socket.bind(&addr.into()).is_ok() {
            socket.listen(128).unwrap();
            socket.set_nonblocking(true).unwrap();
            let std_listener: std::net::TcpListener = socket.into();
            return TcpListener::from_std(std_listener).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("could not bind 127.0.0.1:{port}");
}

enum Wake {
    Pushed(Vec<u8>),
    Read,
    Closed,
}

async fn serve_conn(mut socket: TcpStream, shared: Arc<Shared>) {
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let my_channels: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let my_patterns: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut registered = false;

    let mut buf = BytesMut::with_capacity(4096);
    let mut in_multi = false;
    let mut queued: Vec<Vec<String>> = Vec::new();

    loop {
        // Decode one request frame, writing any pending pushes while we wait.
        let cmd = loop {
            let parsed = {
                let mut cursor = Cursor::new(&buf[..]);
                match RespDecoder::decode(&mut cursor) {
                    Ok(Some(value)) => Some((value, cursor.position() as usize)),
                    Ok(None) => None,
                    Err(_) => return,
                }
            };
            if let Some((value, n)) = parsed {
                buf.advance(n);
                match to_strings(&value) {
                    Some(cmd) if !cmd.is_empty() => break cmd,
                    _ => continue,
                }
            }

            let wake = tokio::select! {
                pushed = push_rx.recv() => match pushed {
                    Some(bytes) => Wake::Pushed(bytes),
                    None => Wake::Closed,
                },
                read = socket.read_buf(&mut buf) => match read {
                    Ok(0) | Err(_) => Wake::Closed,
                    Ok(_) => Wake::Read,
                },
            };
            match wake {
                Wake::Pushed(bytes) => {
                    if socket.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Wake::Read => {}
                Wake::Closed => return,
            }
        };

        shared.log.lock().unwrap().push(cmd.join(" "));
        let name = cmd[0].to_ascii_uppercase();

        if let Some(override_fn) = &shared.override_fn {
            if let Some(action) = override_fn(&cmd) {
                match action {
                    Action::Raw(bytes) => {
                        if socket.write_all(&bytes).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    Action::Drop => return,
                }
            }
        }

        if in_multi && name != "EXEC" && name != "DISCARD" {
            queued.push(cmd);
            if socket.write_all(b"+QUEUED\r\n").await.is_err() {
                return;
            }
            continue;
        }

        let reply: Vec<u8> = match name.as_str() {
            "MULTI" => {
                in_multi = true;
                b"+OK\r\n".to_vec()
            }
            "EXEC" => {
                in_multi = false;
                let results: Vec<Vec<u8>> = queued
                    .drain(..)
                    .map(|c| run_command(&shared, &c))
                    .collect();
                let mut out = format!("*{}\r\n", results.len()).into_bytes();
                for result in results {
                    out.extend(result);
                }
                out
            }
            "DISCARD" => {
                in_multi = false;
                queued.clear();
                b"+OK\r\n".to_vec()
            }
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                if !registered {
                    registered = true;
                    shared.subscribers.lock().unwrap().push(Subscriber {
                        push: push_tx.clone(),
                        channels: Arc::clone(&my_channels),
                        patterns: Arc::clone(&my_patterns),
                    });
                }
                let (set, ack) = if name == "SUBSCRIBE" {
                    (&my_channels, "subscribe")
                } else {
                    (&my_patterns, "psubscribe")
                };
                let mut out = Vec::new();
                for target in &cmd[1..] {
                    set.lock().unwrap().insert(target.clone());
                    let count = my_channels.lock().unwrap().len()
                        + my_patterns.lock().unwrap().len();
                    out.extend(ack_frame(ack, target, count as i64));
                }
                out
            }
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                let (set, ack) = if name == "UNSUBSCRIBE" {
                    (&my_channels, "unsubscribe")
                } else {
                    (&my_patterns, "punsubscribe")
                };
                let targets: Vec<String> = if cmd.len() > 1 {
                    cmd[1..].to_vec()
                } else {
                    set.lock().unwrap().iter().cloned().collect()
                };
                let mut out = Vec::new();
                if targets.is_empty() {
                    out.extend(
                        format!("*3\r\n${}\r\n{}\r\n$-1\r\n:0\r\n", ack.len(), ack).into_bytes(),
                    );
                } else {
                    for target in &targets {
                        set.lock().unwrap().remove(target);
                        let count = my_channels.lock().unwrap().len()
                            + my_patterns.lock().unwrap().len();
                        out.extend(ack_frame(ack, target, count as i64));
                    }
                }
                out
            }
            "PUBLISH" => {
                let channel = cmd.get(1).cloned().unwrap_or_default();
                let payload = cmd.get(2).cloned().unwrap_or_default();
                let count = publish(&shared, &channel, &payload);
                format!(":{count}\r\n").into_bytes()
            }
            _ => run_command(&shared, &cmd),
        };

        if socket.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn publish(shared: &Shared, channel: &str, payload: &str) -> usize {
    let mut count = 0;
    let mut subscribers = shared.subscribers.lock().unwrap();
    subscribers.retain(|sub| {
        let mut delivered = false;
        if sub.channels.lock().unwrap().contains(channel) {
            if sub.push.send(message_frame(channel, payload)).is_err() {
                return false;
            }
            delivered = true;
        }
        for pattern in sub.patterns.lock().unwrap().iter() {
            if glob_match(pattern, channel) {
                if sub
                    .push
                    .send(pmessage_frame(pattern, channel, payload))
                    .is_err()
                {
                    return false;
                }
                delivered = true;
                break;
            }
        }
        if delivered {
            count += 1;
        }
        true
    });
    count
}

fn run_command(shared: &Shared, cmd: &[String]) -> Vec<u8> {
    let name = cmd[0].to_ascii_uppercase();
    let mut kv = shared.kv.lock().unwrap();

    match name.as_str() {
        "PING" => b"+PONG\r\n".to_vec(),
        "ECHO" => bulk(cmd.get(1).map_or("", String::as_str)),
        "AUTH" | "SELECT" | "CLIENT" | "FLUSHALL" | "ASKING" | "QUIT" => b"+OK\r\n".to_vec(),
        "FLUSHDB" => {
            kv.clear();
            b"+OK\r\n".to_vec()
        }
        "SET" => {
            kv.insert(cmd[1].clone(), cmd[2].clone());
            b"+OK\r\n".to_vec()
        }
        "GET" => match kv.get(&cmd[1]) {
            Some(value) => bulk(value),
            None => b"$-1\r\n".to_vec(),
        },
        "DEL" => {
            let removed = cmd[1..].iter().filter(|k| kv.remove(*k).is_some()).count();
            format!(":{removed}\r\n").into_bytes()
        }
        "EXISTS" => {
            let found = cmd[1..].iter().filter(|k| kv.contains_key(*k)).count();
            format!(":{found}\r\n").into_bytes()
        }
        "INCR" => {
            let current: i64 = kv.get(&cmd[1]).and_then(|v| v.parse().ok()).unwrap_or(0);
            let next = current + 1;
            kv.insert(cmd[1].clone(), next.to_string());
            format!(":{next}\r\n").into_bytes()
        }
        "APPEND" => {
            let entry = kv.entry(cmd[1].clone()).or_default();
            entry.push_str(&cmd[2]);
            format!(":{}\r\n", entry.len()).into_bytes()
        }
        "STRLEN" => {
            let len = kv.get(&cmd[1]).map_or(0, String::len);
            format!(":{len}\r\n").into_bytes()
        }
        "MGET" => {
            let mut out = format!("*{}\r\n", cmd.len() - 1).into_bytes();
            for key in &cmd[1..] {
                match kv.get(key) {
                    Some(value) => out.extend(bulk(value)),
                    None => out.extend_from_slice(b"$-1\r\n"),
                }
            }
            out
        }
        "EVAL" => b"-ERR Error compiling script\r\n".to_vec(),
        _ => format!("-ERR unknown command '{}'\r\n", cmd[0]).into_bytes(),
    }
}

fn to_strings(value: &RespValue) -> Option<Vec<String>> {
    let RespValue::Array(items) = value else {
        return None;
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RespValue::BulkString(b) => out.push(String::from_utf8_lossy(b).into_owned()),
            RespValue::SimpleString(s) => out.push(s.clone()),
            RespValue::Integer(i) => out.push(i.to_string()),
            _ => return None,
        }
    }
    Some(out)
}

fn bulk(s: &str) -> Vec<u8> {
    format!("${}\r\n{s}\r\n", s.len()).into_bytes()
}

fn ack_frame(kind: &str, target: &str, count: i64) -> Vec<u8> {
    let mut out = format!("*3\r\n${}\r\n{kind}\r\n", kind.len()).into_bytes();
    out.extend(bulk(target));
    out.extend(format!(":{count}\r\n").into_bytes());
    out
}

fn message_frame(channel: &str, payload: &str) -> Vec<u8> {
    let mut out = b"*3\r\n$7\r\nmessage\r\n".to_vec();
    out.extend(bulk(channel));
    out.extend(bulk(payload));
    out
}

fn pmessage_frame(pattern: &str, channel: &str, payload: &str) -> Vec<u8> {
    let mut out = b"*4\r\n$8\r\npmessage\r\n".to_vec();
    out.extend(bulk(pattern));
    out.extend(bulk(channel));
    out.extend(bulk(payload));
    out
}

/// Glob matching supporting `*` only; enough for the pattern tests
fn glob_match(pattern: &str, input: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == input;
    }
    let mut rest = input;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
