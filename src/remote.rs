//! Connection plumbing for the inspected unit: dialing the subscribe channel,
//! the bounded handshake, poll-based event reads, and the side HTTP channel
//! for remote-operation calls. Reconnect policy lives with the session loop in
//! `sandbox`; this module only reports loss.

use std::io;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use serde_json::{Value as JsonValue, json};
use tungstenite::handshake::HandshakeError;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use crate::event_log;
use crate::protocol::{ClientFrame, Descriptor, PeerFrame, RpcArgs, RpcReply};

pub const HANDSHAKE_TIMEOUT_ENV: &str = "ACTOR_CONSOLE_HANDSHAKE_TIMEOUT_MS";
pub const RECONNECT_DELAY_ENV: &str = "ACTOR_CONSOLE_RECONNECT_DELAY_MS";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout while subscribed; bounds how long teardown and reconnect
/// checks can lag behind a quiet peer.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) type WsSocket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Hard deadline for the entire dial + handshake exchange. Env-overridable so
/// tests do not sit through the contract value.
pub(crate) fn handshake_timeout() -> Duration {
    duration_from_raw(
        std::env::var(HANDSHAKE_TIMEOUT_ENV).ok().as_deref(),
        DEFAULT_HANDSHAKE_TIMEOUT,
    )
}

/// Fixed delay between reconnect attempts. Deliberately not exponential.
pub(crate) fn reconnect_delay() -> Duration {
    duration_from_raw(
        std::env::var(RECONNECT_DELAY_ENV).ok().as_deref(),
        DEFAULT_RECONNECT_DELAY,
    )
}

fn duration_from_raw(raw: Option<&str>, default: Duration) -> Duration {
    match raw.and_then(|value| value.trim().parse::<u64>().ok()) {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => default,
    }
}

#[derive(Debug)]
pub enum RemoteError {
    /// The target URL cannot be used at all. Not retryable.
    Target(String),
    Io(io::Error),
    /// Websocket-level failure while connecting or mid-stream.
    Protocol(String),
    /// The handshake deadline elapsed before the peer answered.
    Timeout,
    /// The peer closed the subscribe channel.
    Closed,
    /// HTTP transport failure on the invocation channel.
    Http(String),
    /// The remote operation itself reported an error.
    Rpc(String),
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Target(message) => write!(f, "invalid target: {message}"),
            RemoteError::Io(err) => write!(f, "io error: {err}"),
            RemoteError::Protocol(message) => write!(f, "websocket error: {message}"),
            RemoteError::Timeout => write!(f, "handshake timed out"),
            RemoteError::Closed => write!(f, "connection closed by peer"),
            RemoteError::Http(message) => write!(f, "http error: {message}"),
            RemoteError::Rpc(message) => write!(f, "remote operation failed: {message}"),
        }
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RemoteError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// A validated target: the subscribe URL plus its derived HTTP base for the
/// invocation channel.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    ws_url: Url,
    http_base: Url,
}

impl Endpoint {
    pub(crate) fn parse(target: &str) -> Result<Self, RemoteError> {
        let ws_url = Url::parse(target)
            .map_err(|err| RemoteError::Target(format!("{target}: {err}")))?;
        if ws_url.scheme() != "ws" {
            return Err(RemoteError::Target(format!(
                "unsupported scheme {:?} (expected ws)",
                ws_url.scheme()
            )));
        }
        if ws_url.host_str().is_none() {
            return Err(RemoteError::Target(format!("{target}: missing host")));
        }
        let mut http_base = ws_url.clone();
        http_base
            .set_scheme("http")
            .map_err(|_| RemoteError::Target(format!("{target}: cannot derive http base")))?;
        Ok(Self { ws_url, http_base })
    }

    pub(crate) fn ws_url(&self) -> &Url {
        &self.ws_url
    }

    fn rpc_url(&self, name: &str) -> Url {
        self.join_path(&format!("rpc/{name}"))
    }

    fn state_url(&self) -> Url {
        self.join_path("state")
    }

    fn join_path(&self, suffix: &str) -> Url {
        let mut url = self.http_base.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/{suffix}"));
        url
    }
}

/// Dials the subscribe channel and completes the descriptor exchange, all
/// under a single deadline.
pub(crate) fn connect_and_handshake(
    endpoint: &Endpoint,
    deadline: Instant,
) -> Result<(WsSocket, Descriptor), RemoteError> {
    let mut socket = dial(endpoint, deadline)?;
    match request_descriptor(&mut socket, deadline) {
        Ok(descriptor) => {
            // Switch to short poll reads for the subscribe loop.
            set_read_timeout(&socket, READ_POLL_INTERVAL)?;
            Ok((socket, descriptor))
        }
        Err(err) => {
            let _ = socket.close(None);
            Err(err)
        }
    }
}

fn dial(endpoint: &Endpoint, deadline: Instant) -> Result<WsSocket, RemoteError> {
    let addrs = endpoint
        .ws_url
        .socket_addrs(|| None)
        .map_err(RemoteError::Io)?;

    let mut last_err = RemoteError::Target("target resolved to no addresses".to_string());
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, remaining(deadline)?) {
            Ok(stream) => return upgrade(endpoint, stream, deadline),
            Err(err) => last_err = RemoteError::Io(err),
        }
    }
    Err(last_err)
}

fn upgrade(
    endpoint: &Endpoint,
    stream: TcpStream,
    deadline: Instant,
) -> Result<WsSocket, RemoteError> {
    stream.set_nodelay(true).map_err(RemoteError::Io)?;
    stream
        .set_read_timeout(Some(remaining(deadline)?))
        .map_err(RemoteError::Io)?;
    stream
        .set_write_timeout(Some(remaining(deadline)?))
        .map_err(RemoteError::Io)?;

    let mut attempt = tungstenite::client(endpoint.ws_url.as_str(), MaybeTlsStream::Plain(stream));
    loop {
        match attempt {
            Ok((socket, _response)) => return Ok(socket),
            Err(HandshakeError::Interrupted(mid)) => {
                remaining(deadline)?;
                attempt = mid.handshake();
            }
            Err(HandshakeError::Failure(err)) => return Err(map_stream_error(err)),
        }
    }
}

fn request_descriptor(socket: &mut WsSocket, deadline: Instant) -> Result<Descriptor, RemoteError> {
    let request = serde_json::to_string(&ClientFrame::Info)
        .map_err(|err| RemoteError::Protocol(err.to_string()))?;
    socket
        .send(Message::Text(request))
        .map_err(map_stream_error)?;

    loop {
        set_read_timeout(socket, remaining(deadline)?)?;
        match socket.read() {
            Ok(Message::Text(text)) => match serde_json::from_str::<PeerFrame>(&text) {
                Ok(PeerFrame::Info { descriptor }) => return Ok(descriptor),
                // Pushes racing ahead of the descriptor are dropped; the
                // descriptor snapshot supersedes them anyway.
                Ok(_) => continue,
                Err(err) => {
                    event_log::log(
                        "peer_frame_dropped",
                        json!({"during": "handshake", "error": err.to_string()}),
                    );
                    continue;
                }
            },
            Ok(Message::Close(_)) => return Err(RemoteError::Closed),
            Ok(_) => continue,
            Err(err) => match classify_read_error(err)? {
                ReadInterruption::TimedOut => {
                    remaining(deadline)?;
                }
            },
        }
    }
}

/// One subscribe-channel read. `Idle` covers poll timeouts, control frames,
/// and dropped malformed frames; the caller loops and re-checks shutdown.
pub(crate) enum SubscribeEvent {
    Frame(PeerFrame),
    Idle,
}

pub(crate) fn next_subscribe_event(socket: &mut WsSocket) -> Result<SubscribeEvent, RemoteError> {
    match socket.read() {
        Ok(Message::Text(text)) => match serde_json::from_str::<PeerFrame>(&text) {
            Ok(frame) => Ok(SubscribeEvent::Frame(frame)),
            Err(err) => {
                event_log::log(
                    "peer_frame_dropped",
                    json!({"during": "subscribe", "error": err.to_string()}),
                );
                Ok(SubscribeEvent::Idle)
            }
        },
        Ok(Message::Close(_)) => Err(RemoteError::Closed),
        Ok(_) => Ok(SubscribeEvent::Idle),
        Err(err) => match classify_read_error(err)? {
            ReadInterruption::TimedOut => Ok(SubscribeEvent::Idle),
        },
    }
}

enum ReadInterruption {
    TimedOut,
}

fn classify_read_error(err: tungstenite::Error) -> Result<ReadInterruption, RemoteError> {
    match err {
        tungstenite::Error::Io(err) if read_timed_out(&err) => Ok(ReadInterruption::TimedOut),
        tungstenite::Error::Io(err) => Err(RemoteError::Io(err)),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            Err(RemoteError::Closed)
        }
        other => Err(RemoteError::Protocol(other.to_string())),
    }
}

fn map_stream_error(err: tungstenite::Error) -> RemoteError {
    match err {
        tungstenite::Error::Io(err) if read_timed_out(&err) => RemoteError::Timeout,
        tungstenite::Error::Io(err) => RemoteError::Io(err),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            RemoteError::Closed
        }
        other => RemoteError::Protocol(other.to_string()),
    }
}

fn read_timed_out(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn set_read_timeout(socket: &WsSocket, timeout: Duration) -> Result<(), RemoteError> {
    let timeout = timeout.max(Duration::from_millis(1));
    match socket.get_ref() {
        MaybeTlsStream::Plain(stream) => stream
            .set_read_timeout(Some(timeout))
            .map_err(RemoteError::Io),
        _ => Ok(()),
    }
}

pub(crate) fn remaining(deadline: Instant) -> Result<Duration, RemoteError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(RemoteError::Timeout);
    }
    Ok(left)
}

/// The invocation channel: plain request/response HTTP, independent of the
/// subscribe socket so operation calls never block on event delivery.
pub(crate) struct RemoteInvoker {
    endpoint: Endpoint,
    client: reqwest::blocking::Client,
}

impl RemoteInvoker {
    pub(crate) fn new(endpoint: Endpoint) -> Result<Self, RemoteError> {
        // No request timeout: user scripts may legitimately invoke slow
        // remote operations, and evaluation carries no deadline.
        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|err| RemoteError::Http(err.to_string()))?;
        Ok(Self { endpoint, client })
    }

    pub(crate) fn call(&self, name: &str, args: Vec<JsonValue>) -> Result<JsonValue, RemoteError> {
        let reply: RpcReply = self
            .client
            .post(self.endpoint.rpc_url(name))
            .json(&RpcArgs { args })
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|err| RemoteError::Http(err.to_string()))?
            .json()
            .map_err(|err| RemoteError::Http(err.to_string()))?;
        reply.into_result().map_err(RemoteError::Rpc)
    }

    pub(crate) fn set_state(&self, payload: &JsonValue) -> Result<(), RemoteError> {
        let reply: RpcReply = self
            .client
            .post(self.endpoint.state_url())
            .json(payload)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|err| RemoteError::Http(err.to_string()))?
            .json()
            .map_err(|err| RemoteError::Http(err.to_string()))?;
        reply.into_result().map(|_| ()).map_err(RemoteError::Rpc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_rejects_non_ws_schemes() {
        let err = Endpoint::parse("https://unit.example/inspect").expect_err("scheme");
        assert!(matches!(err, RemoteError::Target(_)), "got {err:?}");
        assert!(Endpoint::parse("ws://unit.example/inspect").is_ok());
    }

    #[test]
    fn endpoint_rejects_missing_host() {
        let err = Endpoint::parse("ws:///inspect").expect_err("host");
        assert!(matches!(err, RemoteError::Target(_)), "got {err:?}");
    }

    #[test]
    fn rpc_url_preserves_target_path() {
        let endpoint = Endpoint::parse("ws://unit.example:4200/units/u1/inspect").expect("parse");
        assert_eq!(
            endpoint.rpc_url("ping").as_str(),
            "http://unit.example:4200/units/u1/inspect/rpc/ping"
        );
        assert_eq!(
            endpoint.state_url().as_str(),
            "http://unit.example:4200/units/u1/inspect/state"
        );
    }

    #[test]
    fn rpc_url_handles_root_and_trailing_slash() {
        let endpoint = Endpoint::parse("ws://unit.example/").expect("parse");
        assert_eq!(endpoint.rpc_url("ping").as_str(), "http://unit.example/rpc/ping");

        let endpoint = Endpoint::parse("ws://unit.example/inspect/").expect("parse");
        assert_eq!(
            endpoint.state_url().as_str(),
            "http://unit.example/inspect/state"
        );
    }

    #[test]
    fn duration_override_requires_positive_millis() {
        let default = Duration::from_secs(5);
        assert_eq!(duration_from_raw(None, default), default);
        assert_eq!(duration_from_raw(Some(""), default), default);
        assert_eq!(duration_from_raw(Some("abc"), default), default);
        assert_eq!(duration_from_raw(Some("0"), default), default);
        assert_eq!(
            duration_from_raw(Some("250"), default),
            Duration::from_millis(250)
        );
        assert_eq!(
            duration_from_raw(Some(" 40 "), default),
            Duration::from_millis(40)
        );
    }

    #[test]
    fn remaining_reports_timeout_at_deadline() {
        let err = remaining(Instant::now() - Duration::from_millis(1)).expect_err("deadline");
        assert!(matches!(err, RemoteError::Timeout));
        assert!(remaining(Instant::now() + Duration::from_secs(1)).is_ok());
    }
}
