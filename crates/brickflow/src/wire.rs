//! Wire messages exchanged between the control peer and worker processes.
//!
//! # Wire Format
//!
//! Each message is one frame: a 4-byte big-endian payload length followed by
//! a JSON object whose `kind` field selects the variant.
//!
//! ```text
//! [len: u32 BE][{"kind":"register","runner_id":"R-x81Kd0qPzA"}]
//! ```
//!
//! Worker to peer: `register` (exactly once, first), `input_address`, `log`,
//! `event`. Peer to worker: `connect_output`, `shutdown`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// First message on a new connection, naming the runner it belongs to.
    Register { runner_id: String },
    /// The address the worker accepts pipeline input on.
    InputAddress { address: String },
    /// A log line produced by the worker.
    Log { level: LogLevel, message: String },
    /// A named occurrence the worker wants counted.
    Event { name: String },
    /// Where the worker should send its output.
    ConnectOutput { address: String },
    /// Request for the worker to exit.
    Shutdown,
}

impl Message {
    /// The `kind` discriminant, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::InputAddress { .. } => "input_address",
            Message::Log { .. } => "log",
            Message::Event { .. } => "event",
            Message::ConnectOutput { .. } => "connect_output",
            Message::Shutdown => "shutdown",
        }
    }
}

/// Severity of a worker log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Serialize a message into a frame payload.
pub fn encode(message: &Message) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(message).map(Bytes::from)
}

/// Parse a frame payload.
pub fn decode(payload: &[u8]) -> Result<Message, serde_json::Error> {
    serde_json::from_slice(payload)
}
