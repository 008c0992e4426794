//! Command record: a name plus its argument vector

use redlink_core::value::RespValue;

/// One command headed for the wire.
///
/// Arguments are held as [`RespValue`]s and coerced to byte strings by the
/// encoder; the name travels as the first bulk of the request frame.
#[derive(Debug, Clone)]
pub struct Command {
    /// Command name, e.g. `GET`
    pub name: String,
    /// Positional arguments
    pub args: Vec<RespValue>,
}

/// Commands that carry no key and route anywhere in a cluster
const KEYLESS: &[&str] = &[
    "AUTH",
    "ASKING",
    "CLIENT",
    "CLUSTER",
    "DISCARD",
    "ECHO",
    "EXEC",
    "FLUSHALL",
    "FLUSHDB",
    "INFO",
    "MULTI",
    "PING",
    "PSUBSCRIBE",
    "PUBLISH",
    "PUNSUBSCRIBE",
    "QUIT",
    "SELECT",
    "SUBSCRIBE",
    "UNSUBSCRIBE",
];

/// The only commands a connection in sub mode accepts
const SUB_MODE: &[&str] = &[
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
];

impl Command {
    /// Build a command from a name and arguments
    pub fn new(name: impl Into<String>, args: Vec<RespValue>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Key arguments of this command, used for cluster slot routing.
    ///
    /// Multi-key commands report every key so the dispatcher can reject
    /// cross-slot batches before touching the wire.
    #[must_use]
    pub fn keys(&self) -> Vec<&[u8]> {
        let name = self.name.to_ascii_uppercase();
        if KEYLESS.contains(&name.as_str()) {
            return Vec::new();
        }

        match name.as_str() {
            "MGET" | "DEL" | "EXISTS" | "UNLINK" | "WATCH" => {
                self.args.iter().filter_map(arg_bytes).collect()
            }
            "MSET" | "MSETNX" => self.args.iter().step_by(2).filter_map(arg_bytes).collect(),
            // BITOP op destkey srckey...
            "BITOP" => self.args.iter().skip(1).filter_map(arg_bytes).collect(),
            // EVAL script numkeys key... arg...
            "EVAL" | "EVALSHA" => {
                let numkeys = self
                    .args
                    .get(1)
                    .and_then(|v| v.as_int().ok())
                    .unwrap_or(0)
                    .max(0) as usize;
                self.args
                    .iter()
                    .skip(2)
                    .take(numkeys)
                    .filter_map(arg_bytes)
                    .collect()
            }
            _ => self.args.first().and_then(arg_bytes).into_iter().collect(),
        }
    }

    /// Whether the command is legal on a connection in sub mode
    #[must_use]
    pub fn allowed_in_sub_mode(&self) -> bool {
        let name = self.name.to_ascii_uppercase();
        SUB_MODE.contains(&name.as_str())
    }
}

fn arg_bytes(arg: &RespValue) -> Option<&[u8]> {
    match arg {
        RespValue::BulkString(b) => Some(&b[..]),
        RespValue::SimpleString(s) => Some(s.as_bytes()),
        _ => None,
    }
}
