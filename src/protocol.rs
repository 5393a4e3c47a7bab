//! Typed messages crossing the execution boundary, plus the wire types spoken
//! to the remote unit's inspection endpoint. Pure data; no behavior beyond
//! validation helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Requests from the controller into the sandbox session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxRequest {
    Init {
        target: String,
        hints: CapabilityHints,
    },
    Code {
        id: u64,
        source: String,
    },
    SetState {
        payload: JsonValue,
    },
}

/// Responses streamed from the sandbox back to the controller. Events that
/// correlate to a command carry its key as `id`; session-scoped events omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleEvent {
    Ready {
        descriptor: Descriptor,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        error: ErrorPayload,
    },
    Formatted {
        id: u64,
        tokens: Vec<TokenLine>,
    },
    Log {
        id: u64,
        entry: LogEntry,
    },
    Result {
        id: u64,
        value: JsonValue,
    },
    StateChange {
        payload: JsonValue,
    },
    ConnectionsChange {
        payload: JsonValue,
    },
    LostConnection,
}

impl ConsoleEvent {
    pub fn session_error(error: ErrorPayload) -> Self {
        ConsoleEvent::Error { id: None, error }
    }

    pub fn command_error(id: u64, error: ErrorPayload) -> Self {
        ConsoleEvent::Error { id: Some(id), error }
    }
}

/// What the caller already believes about the target unit. The handshake is
/// authoritative; an explicit `inspect: false` skips dialing entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspect: Option<bool>,
}

impl CapabilityHints {
    pub fn allows_inspect(&self) -> bool {
        self.inspect != Some(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Syntax,
    Runtime,
    Unsupported,
    Timeout,
    Transport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<JsonValue>,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn with_detail(mut self, detail: JsonValue) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// One captured console emission from inside an evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub method: String,
    pub args: Vec<JsonValue>,
    pub ts_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Keyword,
    Identifier,
    Number,
    String,
    Comment,
    Operator,
    Plain,
}

/// A classified span of source text. Concatenating every token of every line
/// reproduces the submitted source exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub text: String,
    pub kind: TokenKind,
}

impl Token {
    pub fn new(text: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }
}

pub type TokenLine = Vec<Token>;

/// Handshake payload describing the inspected unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub rpcs: Vec<String>,
    pub state: StateSnapshot,
    #[serde(default)]
    pub connections: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub enabled: bool,
    #[serde(default)]
    pub native: JsonValue,
}

/// Frames the bridge sends on the subscribe channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Info,
}

/// Frames the peer sends on the subscribe channel. Unknown `type` values fail
/// to parse and are dropped at the read loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerFrame {
    #[serde(rename = "info")]
    Info {
        #[serde(flatten)]
        descriptor: Descriptor,
    },
    #[serde(rename = "state-changed")]
    StateChanged { payload: JsonValue },
    #[serde(rename = "connections-changed")]
    ConnectionsChanged { payload: JsonValue },
}

/// Body of a remote-operation invocation: positional arguments only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcArgs {
    pub args: Vec<JsonValue>,
}

/// Generic result-or-error envelope returned by remote-operation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    pub output: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcReply {
    /// An `error` field wins over any `output` the peer also included.
    pub fn into_result(self) -> Result<JsonValue, String> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(self.output.unwrap_or(JsonValue::Null))
    }
}
