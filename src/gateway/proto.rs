//! Gateway wire protocol: opcodes, the envelope codec and handshake payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway protocol version requested in the connection URL.
pub const GATEWAY_VERSION: u8 = 10;

/// Frame kind carried in the `op` field of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
}

impl Opcode {
    /// Every opcode understood by the codec, in wire order.
    pub const ALL: [Opcode; 11] = [
        Opcode::Dispatch,
        Opcode::Heartbeat,
        Opcode::Identify,
        Opcode::PresenceUpdate,
        Opcode::VoiceStateUpdate,
        Opcode::Resume,
        Opcode::Reconnect,
        Opcode::RequestGuildMembers,
        Opcode::InvalidSession,
        Opcode::Hello,
        Opcode::HeartbeatAck,
    ];

    pub fn code(self) -> u8 {
        match self {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::PresenceUpdate => 3,
            Opcode::VoiceStateUpdate => 4,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::RequestGuildMembers => 8,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        op.code()
    }
}

impl TryFrom<u8> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Opcode::ALL
            .into_iter()
            .find(|op| op.code() == code)
            .ok_or(UnknownOpcode(code))
    }
}

/// Opcode value outside the supported table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOpcode(pub u8);

impl fmt::Display for UnknownOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown opcode {}", self.0)
    }
}

impl std::error::Error for UnknownOpcode {}

/// The `{op, d, s, t}` wrapper around every gateway frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "op")]
    pub opcode: Opcode,
    #[serde(rename = "d", default)]
    pub data: Value,
    #[serde(rename = "s", default)]
    pub sequence: Option<u64>,
    #[serde(rename = "t", default)]
    pub event_name: Option<String>,
}

impl Envelope {
    /// Builds an outbound envelope. Sequence and event name are server-only.
    pub fn new(opcode: Opcode, data: Value) -> Self {
        Self {
            opcode,
            data,
            sequence: None,
            event_name: None,
        }
    }

    pub fn dispatch(sequence: u64, event_name: impl Into<String>, data: Value) -> Self {
        Self {
            opcode: Opcode::Dispatch,
            data,
            sequence: Some(sequence),
            event_name: Some(event_name.into()),
        }
    }

    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(Opcode::Heartbeat, sequence.map_or(Value::Null, Value::from))
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Payload encoding requested from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    Etf,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Etf => "etf",
        }
    }
}

/// Appends the `v`, `encoding` and optional `compress` query parameters.
pub fn gateway_url(base: &str, version: u8, encoding: Encoding, compress: bool) -> String {
    let base = base.trim().trim_end_matches('/');
    let mut url = if base.contains('?') {
        format!("{base}&")
    } else {
        format!("{base}/?")
    };
    url.push_str(&format!("v={version}&encoding={}", encoding.as_str()));
    if compress {
        url.push_str("&compress=zlib-stream");
    }
    url
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloMsg {
    pub heartbeat_interval: u64,
}

/// Fields of the READY dispatch needed to resume later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadyMsg {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_gateway_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionPropertiesMsg {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionPropertiesMsg {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentifyMsg {
    pub token: String,
    pub intents: u64,
    pub properties: ConnectionPropertiesMsg,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeMsg {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// How the engine reacts to a close frame sent by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Reconnect and resume if session continuity is held.
    Resume,
    /// Reconnect with a fresh Identify.
    Reidentify,
    /// Do not reconnect; the server rejected this client.
    Fatal,
}

pub fn classify_close_code(code: Option<u16>) -> CloseDisposition {
    match code {
        Some(4004 | 4010 | 4011 | 4012 | 4013 | 4014) => CloseDisposition::Fatal,
        Some(4007 | 4009) => CloseDisposition::Reidentify,
        _ => CloseDisposition::Resume,
    }
}
