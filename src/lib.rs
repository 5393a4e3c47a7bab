//! Bridge an operator console to a live remote actor: submit code, have it
//! evaluated in an isolated sandbox wired to the actor's operations, and
//! watch results, logs, and state changes stream back asynchronously.

#![forbid(unsafe_code)]

mod controller;
mod eval;
pub mod event_log;
mod highlight;
mod protocol;
mod remote;
mod sandbox;

// Re-export the operator surface at the crate root.
pub use controller::{
    Command, CommandStatus, ConsoleBridge, ContainerState, ContainerStatus, Subscription,
};
pub use protocol::{
    CapabilityHints, ErrorKind, ErrorPayload, LogEntry, StateSnapshot, Token, TokenKind, TokenLine,
};
pub use remote::{HANDSHAKE_TIMEOUT_ENV, RECONNECT_DELAY_ENV};
pub use sandbox::CancelToken;
