//! One sandbox session: a control thread owning the remote link, an
//! evaluation engine thread, and a reader thread per live connection. The
//! controller talks to it over a `SandboxRequest` channel and hears back
//! through an `EventSink`; nothing else is shared.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::eval::Engine;
use crate::event_log;
use crate::protocol::{ConsoleEvent, Descriptor, ErrorPayload, PeerFrame, SandboxRequest};
use crate::remote::{self, Endpoint, RemoteError, RemoteInvoker, SubscribeEvent, WsSocket};

/// How long the control thread blocks on the request channel before checking
/// shutdown and link notes again.
const REQUEST_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Slice for interruptible sleeps in the retry loop.
const STOP_CHECK_SLICE: Duration = Duration::from_millis(25);

/// Cooperative cancellation for an in-flight `init`. A cancelled attempt is
/// abandoned silently: no error, no status transition.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Session-tagged event channel back to the controller. The tag lets the
/// controller drop events from a torn-down session before they touch state.
#[derive(Clone)]
pub(crate) struct EventSink {
    session: u64,
    tx: mpsc::Sender<(u64, ConsoleEvent)>,
}

impl EventSink {
    pub(crate) fn new(session: u64, tx: mpsc::Sender<(u64, ConsoleEvent)>) -> Self {
        Self { session, tx }
    }

    pub(crate) fn emit(&self, event: ConsoleEvent) {
        event_log::log(
            "console_event",
            serde_json::to_value(&event).unwrap_or_else(|_| json!({})),
        );
        // Send failure means the controller is gone; nothing left to notify.
        let _ = self.tx.send((self.session, event));
    }
}

/// Spawns the session control thread. It waits for the `Init` request, runs
/// the connect/serve loop, and winds down when the request channel closes or
/// the shutdown flag is set.
pub(crate) fn spawn(
    requests: mpsc::Receiver<SandboxRequest>,
    events: EventSink,
    shutdown: Arc<AtomicBool>,
    cancel: CancelToken,
) {
    thread::spawn(move || run_session(requests, events, shutdown, cancel));
}

fn run_session(
    requests: mpsc::Receiver<SandboxRequest>,
    events: EventSink,
    shutdown: Arc<AtomicBool>,
    cancel: CancelToken,
) {
    let (target, hints) = match requests.recv() {
        Ok(SandboxRequest::Init { target, hints }) => (target, hints),
        Ok(_) => {
            events.emit(ConsoleEvent::session_error(ErrorPayload::runtime(
                "session started without an init request",
            )));
            return;
        }
        Err(_) => return,
    };

    if !hints.allows_inspect() {
        events.emit(ConsoleEvent::session_error(ErrorPayload::unsupported(
            "unit is declared uninspectable",
        )));
        return;
    }

    let endpoint = match Endpoint::parse(&target) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            events.emit(ConsoleEvent::session_error(ErrorPayload::transport(
                err.to_string(),
            )));
            return;
        }
    };
    event_log::log("sandbox_init", json!({"target": endpoint.ws_url().as_str()}));

    let invoker = match RemoteInvoker::new(endpoint.clone()) {
        Ok(invoker) => Arc::new(invoker),
        Err(err) => {
            events.emit(ConsoleEvent::session_error(ErrorPayload::transport(
                err.to_string(),
            )));
            return;
        }
    };

    let engine = Engine::spawn(events.clone(), shutdown.clone());
    let (notes_tx, notes_rx) = mpsc::channel();
    let mut session = Session {
        endpoint,
        events,
        shutdown,
        cancel,
        engine,
        invoker,
        notes_tx,
        notes_rx,
    };

    if session.initial_connect() {
        session.serve(requests);
    }
}

/// A note from the reader thread back to the control thread. Each reader
/// sends at most one before exiting.
enum LinkNote {
    Lost,
}

struct Session {
    endpoint: Endpoint,
    events: EventSink,
    shutdown: Arc<AtomicBool>,
    cancel: CancelToken,
    engine: Engine,
    invoker: Arc<RemoteInvoker>,
    notes_tx: mpsc::Sender<LinkNote>,
    notes_rx: mpsc::Receiver<LinkNote>,
}

impl Session {
    fn stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// First connect after init. A handshake timeout here means the unit does
    /// not speak the inspection protocol; a refused or dropped dial enters
    /// the fixed-delay retry loop with the session left pending.
    fn initial_connect(&mut self) -> bool {
        let mut reported_loss = false;
        loop {
            if self.stopped() {
                return false;
            }
            let deadline = Instant::now() + remote::handshake_timeout();
            match remote::connect_and_handshake(&self.endpoint, deadline) {
                Ok((socket, descriptor)) => {
                    self.attach(socket, descriptor);
                    return true;
                }
                Err(RemoteError::Timeout) => {
                    self.events
                        .emit(ConsoleEvent::session_error(ErrorPayload::timeout(
                            "unit accepted the connection but did not answer the inspect request",
                        )));
                    return false;
                }
                Err(err @ RemoteError::Target(_)) => {
                    self.events
                        .emit(ConsoleEvent::session_error(ErrorPayload::transport(
                            err.to_string(),
                        )));
                    return false;
                }
                Err(err) => {
                    event_log::log("connect_failed", json!({"error": err.to_string()}));
                    if !reported_loss {
                        self.events.emit(ConsoleEvent::LostConnection);
                        reported_loss = true;
                    }
                    if !self.sleep_before_retry() {
                        return false;
                    }
                }
            }
        }
    }

    /// Reconnect loop after a lost connection. Timeouts are retried here: the
    /// unit already proved it speaks the protocol.
    fn reconnect(&mut self) -> bool {
        loop {
            if !self.sleep_before_retry() {
                return false;
            }
            let deadline = Instant::now() + remote::handshake_timeout();
            match remote::connect_and_handshake(&self.endpoint, deadline) {
                Ok((socket, descriptor)) => {
                    self.attach(socket, descriptor);
                    return true;
                }
                Err(err) => {
                    event_log::log("reconnect_failed", json!({"error": err.to_string()}));
                }
            }
        }
    }

    /// Wires up a fresh connection: refresh the engine's operation bindings
    /// (the descriptor may have changed), announce readiness, start reading.
    fn attach(&mut self, socket: WsSocket, descriptor: Descriptor) {
        if self
            .engine
            .bind(descriptor.rpcs.clone(), self.invoker.clone())
            .is_err()
        {
            self.events
                .emit(ConsoleEvent::session_error(ErrorPayload::runtime(
                    "evaluation engine stopped",
                )));
        }
        self.events.emit(ConsoleEvent::Ready { descriptor });
        spawn_reader(
            socket,
            self.events.clone(),
            self.shutdown.clone(),
            self.notes_tx.clone(),
        );
    }

    fn serve(&mut self, requests: mpsc::Receiver<SandboxRequest>) {
        loop {
            if self.stopped() {
                return;
            }
            if let Ok(LinkNote::Lost) = self.notes_rx.try_recv()
                && !self.reconnect()
            {
                return;
            }
            match requests.recv_timeout(REQUEST_POLL_INTERVAL) {
                Ok(request) => self.handle_request(request),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn handle_request(&mut self, request: SandboxRequest) {
        match request {
            SandboxRequest::Code { id, source } => {
                if self.engine.run(id, source).is_err() {
                    self.events.emit(ConsoleEvent::command_error(
                        id,
                        ErrorPayload::runtime("evaluation engine stopped"),
                    ));
                }
            }
            SandboxRequest::SetState { payload } => match self.invoker.set_state(&payload) {
                // Optimistic echo; a confirming push from the peer overwrites
                // it with the same value.
                Ok(()) => self.events.emit(ConsoleEvent::StateChange { payload }),
                Err(err) => self
                    .events
                    .emit(ConsoleEvent::session_error(ErrorPayload::transport(
                        err.to_string(),
                    ))),
            },
            SandboxRequest::Init { .. } => {
                event_log::log("sandbox_duplicate_init_dropped", json!({}));
            }
        }
    }

    fn sleep_before_retry(&self) -> bool {
        let mut left = remote::reconnect_delay();
        while !left.is_zero() {
            if self.stopped() {
                return false;
            }
            let slice = left.min(STOP_CHECK_SLICE);
            thread::sleep(slice);
            left -= slice;
        }
        !self.stopped()
    }
}

/// Reader thread for one connection. Forwards push frames as events and
/// reports loss exactly once; exits quietly on shutdown.
fn spawn_reader(
    mut socket: WsSocket,
    events: EventSink,
    shutdown: Arc<AtomicBool>,
    notes: mpsc::Sender<LinkNote>,
) {
    thread::spawn(move || {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                let _ = socket.close(None);
                return;
            }
            match remote::next_subscribe_event(&mut socket) {
                Ok(SubscribeEvent::Frame(PeerFrame::StateChanged { payload })) => {
                    events.emit(ConsoleEvent::StateChange { payload });
                }
                Ok(SubscribeEvent::Frame(PeerFrame::ConnectionsChanged { payload })) => {
                    events.emit(ConsoleEvent::ConnectionsChange { payload });
                }
                Ok(SubscribeEvent::Frame(PeerFrame::Info { .. })) => {
                    event_log::log(
                        "peer_frame_dropped",
                        json!({"during": "subscribe", "error": "unexpected info frame"}),
                    );
                }
                Ok(SubscribeEvent::Idle) => {}
                Err(err) => {
                    event_log::log("subscribe_channel_lost", json!({"error": err.to_string()}));
                    events.emit(ConsoleEvent::LostConnection);
                    let _ = notes.send(LinkNote::Lost);
                    return;
                }
            }
        }
    });
}
