//! Operator-facing side of the bridge. `ConsoleBridge` owns the published
//! `ContainerState` snapshot and a listener thread that folds sandbox events
//! into it; subscribers observe every change through immutable snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use crate::event_log;
use crate::protocol::{
    CapabilityHints, ConsoleEvent, ErrorKind, ErrorPayload, LogEntry, SandboxRequest,
    StateSnapshot, TokenLine,
};
use crate::sandbox::{self, CancelToken, EventSink};

/// Lifecycle of the console as a whole.
///
/// `Unsupported` is terminal for a session: the unit either declared itself
/// uninspectable or never answered the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Unknown,
    Pending,
    Ready,
    Error,
    Unsupported,
}

/// Lifecycle of one submitted command. `Success` and `Error` are terminal;
/// anything arriving for a settled command is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Formatted,
    Success,
    Error,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Success | CommandStatus::Error)
    }
}

/// One submitted piece of code and everything the sandbox reported about it.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub key: u64,
    pub code: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<Vec<TokenLine>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub logs: Vec<LogEntry>,
    pub input_timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_timestamp: Option<u64>,
}

/// Snapshot published to subscribers. Cheap to clone; mutation goes through
/// copy-on-write inside the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerState {
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub rpcs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<StateSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<JsonValue>,
    pub connected: bool,
    pub commands: Vec<Command>,
}

impl ContainerState {
    fn fresh(status: ContainerStatus) -> Self {
        Self {
            status,
            error: None,
            rpcs: Vec::new(),
            state: None,
            connections: None,
            connected: false,
            commands: Vec::new(),
        }
    }

    /// Looks up a command by its submission key.
    pub fn command(&self, key: u64) -> Option<&Command> {
        self.commands.iter().find(|command| command.key == key)
    }
}

type Callback = Arc<dyn Fn(&Arc<ContainerState>) + Send + Sync + 'static>;

struct Shared {
    snapshot: Arc<ContainerState>,
    /// Current session number. Events tagged with an older number belong to
    /// a terminated sandbox and are dropped.
    session: u64,
    /// Never reset across sessions so command keys stay unique per bridge.
    next_command_key: u64,
    next_subscriber: u64,
    subscribers: Vec<(u64, Callback)>,
    requests: Option<mpsc::Sender<SandboxRequest>>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            snapshot: Arc::new(ContainerState::fresh(ContainerStatus::Unknown)),
            session: 0,
            next_command_key: 1,
            next_subscriber: 0,
            subscribers: Vec::new(),
            requests: None,
            shutdown: None,
        }
    }

    fn stop_session(&mut self) {
        if let Some(flag) = self.shutdown.take() {
            flag.store(true, Ordering::SeqCst);
        }
        self.requests = None;
        self.session += 1;
    }
}

struct SessionStart {
    session: u64,
    requests: mpsc::Sender<SandboxRequest>,
    sandbox_rx: mpsc::Receiver<SandboxRequest>,
    shutdown: Arc<AtomicBool>,
}

struct BridgeInner {
    shared: Mutex<Shared>,
    events_tx: mpsc::Sender<(u64, ConsoleEvent)>,
}

impl BridgeInner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `mutate` under the lock, then notifies subscribers outside it.
    /// A `None` from `mutate` means nothing changed and nobody is notified.
    fn publish<R>(&self, mutate: impl FnOnce(&mut Shared) -> Option<R>) -> Option<R> {
        let mut guard = self.lock();
        let result = mutate(&mut guard)?;
        let (snapshot, callbacks) = notify_payload(&guard);
        drop(guard);
        for callback in &callbacks {
            callback(&snapshot);
        }
        Some(result)
    }

    /// `publish` for mutations that always take effect.
    fn publish_always<R>(&self, mutate: impl FnOnce(&mut Shared) -> R) -> R {
        let mut guard = self.lock();
        let result = mutate(&mut guard);
        let (snapshot, callbacks) = notify_payload(&guard);
        drop(guard);
        for callback in &callbacks {
            callback(&snapshot);
        }
        result
    }

    /// Tears down any running sandbox and opens a fresh session in `Pending`.
    /// Subscribers hear about `Pending` before this returns.
    fn begin_session(&self) -> SessionStart {
        let (requests_tx, sandbox_rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let requests = requests_tx.clone();
        let session_shutdown = shutdown.clone();
        let session = self.publish_always(move |shared| {
            shared.stop_session();
            shared.requests = Some(requests_tx);
            shared.shutdown = Some(session_shutdown);
            shared.snapshot = Arc::new(ContainerState::fresh(ContainerStatus::Pending));
            shared.session
        });
        SessionStart {
            session,
            requests,
            sandbox_rx,
            shutdown,
        }
    }

    fn apply_event(&self, session: u64, event: ConsoleEvent) {
        self.publish(|shared| {
            if session != shared.session {
                event_log::log(
                    "stale_session_event_dropped",
                    json!({ "session": session, "current": shared.session }),
                );
                return None;
            }
            let state = Arc::make_mut(&mut shared.snapshot);
            match event {
                ConsoleEvent::Ready { descriptor } => {
                    state.status = ContainerStatus::Ready;
                    state.error = None;
                    state.connected = true;
                    state.rpcs = descriptor.rpcs;
                    state.state = Some(descriptor.state);
                    state.connections = if descriptor.connections.is_null() {
                        None
                    } else {
                        Some(descriptor.connections)
                    };
                    Some(())
                }
                ConsoleEvent::Error { id: None, error } => {
                    state.status = match error.kind {
                        ErrorKind::Unsupported | ErrorKind::Timeout => {
                            ContainerStatus::Unsupported
                        }
                        _ => ContainerStatus::Error,
                    };
                    state.error = Some(error);
                    Some(())
                }
                ConsoleEvent::Error {
                    id: Some(key),
                    error,
                } => {
                    let command = lookup_command(state, key)?;
                    if command.status.is_terminal() {
                        return None;
                    }
                    command.status = CommandStatus::Error;
                    command.error = Some(error);
                    command.output_timestamp = Some(event_log::unix_ms_now());
                    Some(())
                }
                ConsoleEvent::Formatted { id, tokens } => {
                    let command = lookup_command(state, id)?;
                    if command.status != CommandStatus::Pending {
                        return None;
                    }
                    command.status = CommandStatus::Formatted;
                    command.formatted = Some(tokens);
                    Some(())
                }
                ConsoleEvent::Log { id, entry } => {
                    let command = lookup_command(state, id)?;
                    if command.status.is_terminal() {
                        return None;
                    }
                    command.logs.push(entry);
                    Some(())
                }
                ConsoleEvent::Result { id, value } => {
                    let command = lookup_command(state, id)?;
                    if command.status.is_terminal() {
                        return None;
                    }
                    command.status = CommandStatus::Success;
                    command.result = Some(value);
                    command.output_timestamp = Some(event_log::unix_ms_now());
                    Some(())
                }
                ConsoleEvent::StateChange { payload } => {
                    match state.state.as_mut() {
                        Some(snapshot) => snapshot.native = payload,
                        None => {
                            state.state = Some(StateSnapshot {
                                enabled: true,
                                native: payload,
                            });
                        }
                    }
                    Some(())
                }
                ConsoleEvent::ConnectionsChange { payload } => {
                    state.connections = if payload.is_null() {
                        None
                    } else {
                        Some(payload)
                    };
                    Some(())
                }
                ConsoleEvent::LostConnection => {
                    state.connected = false;
                    Some(())
                }
            }
        });
    }
}

fn notify_payload(shared: &Shared) -> (Arc<ContainerState>, Vec<Callback>) {
    let callbacks = shared
        .subscribers
        .iter()
        .map(|(_, callback)| callback.clone())
        .collect();
    (shared.snapshot.clone(), callbacks)
}

fn lookup_command(state: &mut ContainerState, key: u64) -> Option<&mut Command> {
    let found = state.commands.iter_mut().find(|command| command.key == key);
    if found.is_none() {
        event_log::log("unknown_command_event_dropped", json!({ "key": key }));
    }
    found
}

/// Drains the sandbox event channel for the whole bridge lifetime. Holds only
/// a weak handle so a dropped bridge lets the thread wind down.
fn spawn_listener(bridge: Weak<BridgeInner>, events: mpsc::Receiver<(u64, ConsoleEvent)>) {
    thread::spawn(move || {
        while let Ok((session, event)) = events.recv() {
            let Some(inner) = bridge.upgrade() else {
                return;
            };
            inner.apply_event(session, event);
        }
    });
}

/// Handle to one subscriber registration. Dropping it unregisters the
/// callback.
pub struct Subscription {
    bridge: Weak<BridgeInner>,
    id: u64,
}

impl Subscription {
    /// Consumes the handle; dropping it has the same effect.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bridge.upgrade() {
            inner.lock().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// The controller. One bridge manages at most one live sandbox session at a
/// time; `init` replaces any running session, `terminate` tears it down.
pub struct ConsoleBridge {
    inner: Arc<BridgeInner>,
}

impl ConsoleBridge {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let inner = Arc::new(BridgeInner {
            shared: Mutex::new(Shared::new()),
            events_tx,
        });
        spawn_listener(Arc::downgrade(&inner), events_rx);
        Self { inner }
    }

    /// Starts a session against `target`. The console is `Pending` by the
    /// time this returns; readiness or failure arrives asynchronously. The
    /// returned token abandons the attempt silently when cancelled.
    pub fn init(&self, target: impl Into<String>, hints: CapabilityHints) -> CancelToken {
        let target = target.into();
        event_log::log("console_init", json!({ "target": target }));
        let start = self.inner.begin_session();
        let cancel = CancelToken::new();
        let sink = EventSink::new(start.session, self.inner.events_tx.clone());
        sandbox::spawn(start.sandbox_rx, sink, start.shutdown, cancel.clone());
        if start
            .requests
            .send(SandboxRequest::Init { target, hints })
            .is_err()
        {
            event_log::log("init_send_failed", json!({}));
        }
        cancel
    }

    /// Stops the session and resets the published state to `Unknown`. Safe
    /// to call repeatedly or without a session.
    pub fn terminate(&self) {
        event_log::log("console_terminate", json!({}));
        self.inner.publish_always(|shared| {
            shared.stop_session();
            shared.snapshot = Arc::new(ContainerState::fresh(ContainerStatus::Unknown));
        });
    }

    /// Submits code for evaluation. Ignored with a warning unless the console
    /// is `Ready`; commands settle in submission order.
    pub fn run(&self, code: impl Into<String>) {
        let source = code.into();
        let submitted = self.inner.publish(|shared| {
            if shared.snapshot.status != ContainerStatus::Ready {
                return None;
            }
            let requests = shared.requests.clone()?;
            let key = shared.next_command_key;
            shared.next_command_key += 1;
            let state = Arc::make_mut(&mut shared.snapshot);
            state.commands.push(Command {
                key,
                code: source.clone(),
                status: CommandStatus::Pending,
                formatted: None,
                result: None,
                error: None,
                logs: Vec::new(),
                input_timestamp: event_log::unix_ms_now(),
                output_timestamp: None,
            });
            Some((key, requests))
        });
        match submitted {
            Some((key, requests)) => {
                if requests
                    .send(SandboxRequest::Code { id: key, source })
                    .is_err()
                {
                    event_log::log("run_send_failed", json!({ "key": key }));
                }
            }
            None => {
                eprintln!("actor-console: run() ignored; console is not ready");
                event_log::log("run_ignored", json!({}));
            }
        }
    }

    /// Asks the unit to replace its native state. The sandbox echoes the new
    /// value optimistically; rejection surfaces as a session-level error.
    pub fn set_state(&self, payload: JsonValue) {
        let requests = {
            let guard = self.inner.lock();
            if guard.snapshot.status == ContainerStatus::Ready {
                guard.requests.clone()
            } else {
                None
            }
        };
        match requests {
            Some(requests) => {
                if requests.send(SandboxRequest::SetState { payload }).is_err() {
                    event_log::log("set_state_send_failed", json!({}));
                }
            }
            None => {
                eprintln!("actor-console: set_state() ignored; console is not ready");
                event_log::log("set_state_ignored", json!({}));
            }
        }
    }

    /// Registers a callback invoked with a fresh snapshot after every state
    /// change. Callbacks run on bridge threads and must not block.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Arc<ContainerState>) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: Callback = Arc::new(callback);
        let mut guard = self.inner.lock();
        let id = guard.next_subscriber;
        guard.next_subscriber += 1;
        guard.subscribers.push((id, callback));
        drop(guard);
        Subscription {
            bridge: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn state(&self) -> Arc<ContainerState> {
        self.inner.lock().snapshot.clone()
    }

    pub fn status(&self) -> ContainerStatus {
        self.inner.lock().snapshot.status
    }

    pub fn commands(&self) -> Vec<Command> {
        self.inner.lock().snapshot.commands.clone()
    }
}

impl Default for ConsoleBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConsoleBridge {
    fn drop(&mut self) {
        self.terminate();
    }
}
