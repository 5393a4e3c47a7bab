//! Shared helpers for the integration suites: a fake actor unit that speaks
//! the WebSocket/HTTP surface the bridge dials, plus small timing utilities.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value as JsonValue, json};
use tungstenite::Message;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

static FAST_TIMEOUTS: Once = Once::new();

/// Shrink the handshake and reconnect timers so failure paths settle quickly.
/// `set_var` is unsafe in edition 2024 because it mutates process-global
/// state; every test calls this before spawning bridge threads, and the
/// `Once` keeps concurrent test threads from racing the write.
pub fn fast_timeouts() {
    FAST_TIMEOUTS.call_once(|| unsafe {
        std::env::set_var(actor_console::HANDSHAKE_TIMEOUT_ENV, "800");
        std::env::set_var(actor_console::RECONNECT_DELAY_ENV, "100");
    });
}

/// Poll `probe` until it returns true or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    probe()
}

/// A ws:// target on a port nothing is listening on.
pub fn free_port_target() -> TestResult<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(format!("ws://127.0.0.1:{port}/console"))
}

pub fn default_descriptor() -> JsonValue {
    descriptor_with_rpcs(&["ping"])
}

pub fn descriptor_with_rpcs(rpcs: &[&str]) -> JsonValue {
    json!({
        "type": "info",
        "rpcs": rpcs,
        "state": {"enabled": true, "native": null},
        "connections": [],
    })
}

pub struct FakePeerConfig {
    pub descriptor: JsonValue,
    /// When set, the unit accepts sockets but never answers the inspect
    /// request.
    pub mute: bool,
    /// Canned HTTP bodies keyed by operation name.
    pub rpc_responses: HashMap<String, JsonValue>,
}

impl Default for FakePeerConfig {
    fn default() -> Self {
        Self {
            descriptor: default_descriptor(),
            mute: false,
            rpc_responses: HashMap::new(),
        }
    }
}

struct PeerShared {
    config: FakePeerConfig,
    stop: AtomicBool,
    drop_subscribe: AtomicBool,
    accepted: AtomicUsize,
    pushes: Mutex<Vec<String>>,
    rpc_calls: Mutex<Vec<(String, Vec<JsonValue>)>>,
    state_posts: Mutex<Vec<JsonValue>>,
}

/// In-process stand-in for a unit: one TCP listener that answers WebSocket
/// upgrades with the configured descriptor and plain HTTP POSTs with canned
/// operation replies.
pub struct FakePeer {
    shared: Arc<PeerShared>,
    target: String,
}

impl FakePeer {
    pub fn start() -> TestResult<Self> {
        Self::start_with(FakePeerConfig::default())
    }

    pub fn start_with(config: FakePeerConfig) -> TestResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let shared = Arc::new(PeerShared {
            config,
            stop: AtomicBool::new(false),
            drop_subscribe: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
            pushes: Mutex::new(Vec::new()),
            rpc_calls: Mutex::new(Vec::new()),
            state_posts: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || accept_loop(listener, accept_shared));

        Ok(Self {
            shared,
            target: format!("ws://127.0.0.1:{port}/console"),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Number of sockets (WebSocket or HTTP) the listener has taken so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Ask the current subscribe socket to close itself.
    pub fn drop_subscribe(&self) {
        self.shared.drop_subscribe.store(true, Ordering::SeqCst);
    }

    pub fn push_state_changed(&self, payload: JsonValue) {
        self.push_frame(json!({"type": "state-changed", "payload": payload}));
    }

    pub fn push_connections_changed(&self, payload: JsonValue) {
        self.push_frame(json!({"type": "connections-changed", "payload": payload}));
    }

    fn push_frame(&self, frame: JsonValue) {
        let mut pushes = self.shared.pushes.lock().unwrap();
        pushes.push(frame.to_string());
    }

    pub fn rpc_calls(&self) -> Vec<(String, Vec<JsonValue>)> {
        self.shared.rpc_calls.lock().unwrap().clone()
    }

    pub fn state_posts(&self) -> Vec<JsonValue> {
        self.shared.state_posts.lock().unwrap().clone()
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<PeerShared>) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                shared.accepted.fetch_add(1, Ordering::SeqCst);
                let conn_shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let _ = handle_connection(stream, conn_shared);
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return,
        }
    }
}

/// Peek enough bytes to tell an HTTP POST from a WebSocket upgrade, then
/// hand the stream to the matching handler.
fn handle_connection(stream: TcpStream, shared: Arc<PeerShared>) -> TestResult {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut probe = [0u8; 4];
    loop {
        let n = stream.peek(&mut probe)?;
        if n == 0 {
            return Ok(());
        }
        if n >= 4 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if &probe == b"POST" {
        handle_http(stream, shared)
    } else {
        handle_websocket(stream, shared)
    }
}

fn handle_websocket(stream: TcpStream, shared: Arc<PeerShared>) -> TestResult {
    let mut socket = tungstenite::accept(stream).map_err(|err| format!("ws accept: {err}"))?;
    socket
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(25)))?;

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            let _ = socket.close(None);
            return Ok(());
        }
        if shared.drop_subscribe.swap(false, Ordering::SeqCst) {
            let _ = socket.close(None);
            let _ = socket.flush();
            return Ok(());
        }

        let queued: Vec<String> = {
            let mut pushes = shared.pushes.lock().unwrap();
            pushes.drain(..).collect()
        };
        for frame in queued {
            socket.send(Message::Text(frame))?;
        }

        match socket.read() {
            Ok(Message::Text(text)) => {
                if shared.config.mute {
                    continue;
                }
                let request: JsonValue = serde_json::from_str(&text).unwrap_or(JsonValue::Null);
                if request.get("type").and_then(JsonValue::as_str) == Some("info") {
                    socket.send(Message::Text(shared.config.descriptor.to_string()))?;
                }
            }
            Ok(Message::Close(_)) => return Ok(()),
            Ok(_) => {}
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(_) => return Ok(()),
        }
    }
}

fn handle_http(stream: TcpStream, shared: Arc<PeerShared>) -> TestResult {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header)?;
        if header.trim().is_empty() {
            break;
        }
        let lower = header.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    let payload: JsonValue = serde_json::from_slice(&body).unwrap_or(JsonValue::Null);

    let reply = route_post(&path, payload, &shared).to_string();

    let mut stream = reader.into_inner();
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.len(),
        reply
    )?;
    stream.flush()?;
    Ok(())
}

fn route_post(path: &str, payload: JsonValue, shared: &PeerShared) -> JsonValue {
    if let Some((_, name)) = path.rsplit_once("/rpc/") {
        let args = payload
            .get("args")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let mut calls = shared.rpc_calls.lock().unwrap();
        calls.push((name.to_string(), args));
        return shared
            .config
            .rpc_responses
            .get(name)
            .cloned()
            .unwrap_or_else(|| json!({"output": null}));
    }
    if path.ends_with("/state") {
        let mut posts = shared.state_posts.lock().unwrap();
        posts.push(payload);
        return json!({"output": null});
    }
    json!({"error": format!("unknown path {path}")})
}
