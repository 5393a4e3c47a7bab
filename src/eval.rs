//! The script engine behind a session: a dedicated thread owning a QuickJS
//! runtime, fed jobs over a channel. The runtime and its contexts are not
//! `Send`, so everything engine-side is created inside the thread and stays
//! there; the rest of the crate only ever holds the channel end.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, Exception, FromJs, Function, Object, Runtime, Value,
};
use serde_json::{Value as JsonValue, json};

use crate::event_log;
use crate::highlight;
use crate::protocol::{ConsoleEvent, ErrorPayload, LogEntry};
use crate::remote::RemoteInvoker;
use crate::sandbox::EventSink;

const CONSOLE_METHODS: [&str; 5] = ["log", "info", "warn", "error", "debug"];

/// `wait()` sleeps in slices so a terminating session is not stuck behind the
/// full requested duration.
const WAIT_SLICE: Duration = Duration::from_millis(50);

const ENGINE_MEMORY_LIMIT: usize = 256 * 1024 * 1024;
const ENGINE_STACK_LIMIT: usize = 1024 * 1024;

enum Job {
    /// Install or replace the remote-operation bindings. Sent on every
    /// (re)connect, after the descriptor is known.
    Bind {
        rpcs: Vec<String>,
        invoker: Arc<RemoteInvoker>,
    },
    Run {
        id: u64,
        source: String,
    },
}

/// Submitting to an engine whose thread has exited. The session reports it as
/// a session-level error and carries on.
#[derive(Debug)]
pub(crate) struct EngineClosed;

/// Channel end of the evaluation thread. Dropping it shuts the thread down
/// once the current job finishes; the shared shutdown flag interrupts the
/// current job itself.
pub(crate) struct Engine {
    jobs: mpsc::Sender<Job>,
}

impl Engine {
    pub(crate) fn spawn(events: EventSink, shutdown: Arc<AtomicBool>) -> Engine {
        let (jobs_tx, jobs_rx) = mpsc::channel();
        thread::spawn(move || run_engine(jobs_rx, events, shutdown));
        Engine { jobs: jobs_tx }
    }

    pub(crate) fn bind(
        &self,
        rpcs: Vec<String>,
        invoker: Arc<RemoteInvoker>,
    ) -> Result<(), EngineClosed> {
        self.jobs
            .send(Job::Bind { rpcs, invoker })
            .map_err(|_| EngineClosed)
    }

    pub(crate) fn run(&self, id: u64, source: String) -> Result<(), EngineClosed> {
        self.jobs
            .send(Job::Run { id, source })
            .map_err(|_| EngineClosed)
    }
}

fn run_engine(jobs: mpsc::Receiver<Job>, events: EventSink, shutdown: Arc<AtomicBool>) {
    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            events.emit(ConsoleEvent::session_error(ErrorPayload::runtime(format!(
                "script engine failed to start: {err}"
            ))));
            return;
        }
    };
    runtime.set_memory_limit(ENGINE_MEMORY_LIMIT);
    runtime.set_max_stack_size(ENGINE_STACK_LIMIT);
    {
        let shutdown = shutdown.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || shutdown.load(Ordering::SeqCst))));
    }

    let context = match Context::full(&runtime) {
        Ok(context) => context,
        Err(err) => {
            events.emit(ConsoleEvent::session_error(ErrorPayload::runtime(format!(
                "script engine failed to start: {err}"
            ))));
            return;
        }
    };

    // Command key of the evaluation currently on this thread; console output
    // emitted outside any evaluation has nowhere to go and is only debug-logged.
    let current = Rc::new(Cell::new(None::<u64>));

    let installed = context.with(|ctx| install_base_bindings(&ctx, &events, &current, &shutdown));
    if let Err(err) = installed {
        events.emit(ConsoleEvent::session_error(ErrorPayload::runtime(format!(
            "failed to install console bindings: {err}"
        ))));
        return;
    }

    while let Ok(job) = jobs.recv() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match job {
            Job::Bind { rpcs, invoker } => {
                let bound = context.with(|ctx| install_actor_bindings(&ctx, &rpcs, &invoker));
                if let Err(err) = bound {
                    events.emit(ConsoleEvent::session_error(ErrorPayload::runtime(format!(
                        "failed to bind remote operations: {err}"
                    ))));
                }
            }
            Job::Run { id, source } => run_command(&context, &events, &current, id, &source),
        }
    }
}

/// Runs one submitted command through the full pipeline: classify, publish
/// the formatted echo, evaluate, emit exactly one terminal event.
fn run_command(
    context: &Context,
    events: &EventSink,
    current: &Rc<Cell<Option<u64>>>,
    id: u64,
    source: &str,
) {
    let mode = match context.with(|ctx| classify(&ctx, source)) {
        Ok(mode) => mode,
        // Code that never parsed is reported without a formatted echo.
        Err(payload) => {
            events.emit(ConsoleEvent::command_error(id, payload));
            return;
        }
    };

    events.emit(ConsoleEvent::Formatted {
        id,
        tokens: highlight::tokenize(source),
    });

    current.set(Some(id));
    let outcome = context.with(|ctx| evaluate(&ctx, mode, source));
    current.set(None);

    match outcome {
        Ok(value) => events.emit(ConsoleEvent::Result { id, value }),
        Err(payload) => events.emit(ConsoleEvent::command_error(id, payload)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvalMode {
    /// The source reads as a single expression; evaluate it parenthesized so
    /// object literals and multi-line expressions keep their value.
    Expression,
    /// General statements; the completion value of the last one is the result.
    Script,
}

/// Decides how to evaluate `source` by compiling two throwaway wrappers that
/// never execute it. The expression probe hides the source in an uncalled
/// function; the script probe hides it in a dead branch, which also rejects a
/// top-level `return` at parse time.
fn classify(ctx: &Ctx<'_>, source: &str) -> Result<EvalMode, ErrorPayload> {
    let expression_probe = format!("void function() {{ return (\n{source}\n); }}");
    if ctx
        .eval::<Value, _>(expression_probe)
        .catch(ctx)
        .is_ok()
    {
        return Ok(EvalMode::Expression);
    }

    let script_probe = format!("if (false) {{\n{source}\n}}");
    match ctx.eval::<Value, _>(script_probe).catch(ctx) {
        Ok(_) => Ok(EvalMode::Script),
        Err(caught) => Err(syntax_payload(caught)),
    }
}

fn evaluate(ctx: &Ctx<'_>, mode: EvalMode, source: &str) -> Result<JsonValue, ErrorPayload> {
    let code = match mode {
        // The newlines keep a trailing line comment from eating the closer.
        EvalMode::Expression => format!("(\n{source}\n)"),
        EvalMode::Script => source.to_string(),
    };
    match ctx.eval::<Value, _>(code).catch(ctx) {
        Ok(value) => Ok(value_to_json(ctx, value)),
        Err(caught) => Err(thrown_payload(ctx, caught)),
    }
}

fn syntax_payload(caught: CaughtError<'_>) -> ErrorPayload {
    match caught {
        CaughtError::Exception(exception) => ErrorPayload::syntax(
            exception
                .message()
                .unwrap_or_else(|| "invalid syntax".to_string()),
        ),
        CaughtError::Error(err) => ErrorPayload::syntax(err.to_string()),
        CaughtError::Value(_) => ErrorPayload::syntax("invalid syntax"),
    }
}

/// Turns whatever the evaluation threw into a structured payload. Proper
/// exceptions keep their name, message and stack; arbitrary thrown values are
/// serialized like results so the bridge never chokes on them.
fn thrown_payload<'js>(ctx: &Ctx<'js>, caught: CaughtError<'js>) -> ErrorPayload {
    match caught {
        CaughtError::Exception(exception) => {
            let name = exception.get::<_, Option<String>>("name").ok().flatten();
            let message = exception.message();
            let text = match (name, message) {
                (Some(name), Some(message)) => format!("{name}: {message}"),
                (Some(name), None) => name,
                (None, Some(message)) => message,
                (None, None) => "uncaught exception".to_string(),
            };
            let payload = ErrorPayload::runtime(text);
            match exception.stack() {
                Some(stack) => payload.with_detail(json!({ "stack": stack })),
                None => payload,
            }
        }
        CaughtError::Value(value) => {
            let detail = value_to_json(ctx, value);
            ErrorPayload::runtime("uncaught value").with_detail(json!({ "value": detail }))
        }
        CaughtError::Error(err) => ErrorPayload::runtime(err.to_string()),
    }
}

/// JSON-serializes an engine value, degrading instead of failing: `undefined`
/// and unserializable values become `null`, cyclic values fall back to their
/// string coercion.
fn value_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> JsonValue {
    if value.is_undefined() {
        return JsonValue::Null;
    }
    match ctx.json_stringify(value.clone()) {
        Ok(Some(text)) => match text.to_string() {
            Ok(text) => serde_json::from_str(&text).unwrap_or(JsonValue::String(text)),
            Err(_) => JsonValue::Null,
        },
        Ok(None) => JsonValue::Null,
        Err(_) => {
            // json_stringify threw (cyclic value); clear it before coercing.
            let _ = ctx.catch();
            match Coerced::<String>::from_js(ctx, value) {
                Ok(Coerced(text)) => JsonValue::String(text),
                Err(_) => {
                    let _ = ctx.catch();
                    JsonValue::String("<unserializable value>".to_string())
                }
            }
        }
    }
}

fn json_to_value<'js>(ctx: &Ctx<'js>, json: &JsonValue) -> rquickjs::Result<Value<'js>> {
    let text = serde_json::to_string(json).unwrap_or_else(|_| "null".to_string());
    ctx.json_parse(text)
}

fn install_base_bindings<'js>(
    ctx: &Ctx<'js>,
    events: &EventSink,
    current: &Rc<Cell<Option<u64>>>,
    shutdown: &Arc<AtomicBool>,
) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    for method in CONSOLE_METHODS {
        let events = events.clone();
        let current = current.clone();
        let func = Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
            let entry = LogEntry {
                method: method.to_string(),
                args: args.0.into_iter().map(|v| value_to_json(&ctx, v)).collect(),
                ts_unix_ms: event_log::unix_ms_now(),
            };
            match current.get() {
                Some(id) => events.emit(ConsoleEvent::Log { id, entry }),
                None => event_log::log("console_outside_command", json!({ "method": method })),
            }
        })?;
        console.set(method, func)?;
    }
    ctx.globals().set("console", console)?;

    let shutdown = shutdown.clone();
    let wait = Function::new(ctx.clone(), move |ms: f64| {
        let total = if ms.is_finite() && ms > 0.0 {
            Duration::from_millis(ms as u64)
        } else {
            Duration::ZERO
        };
        let mut left = total;
        while !left.is_zero() && !shutdown.load(Ordering::SeqCst) {
            let slice = left.min(WAIT_SLICE);
            thread::sleep(slice);
            left -= slice;
        }
    })?;
    ctx.globals().set("wait", wait)?;

    // Placeholder until the first descriptor arrives.
    ctx.globals().set("actor", Object::new(ctx.clone())?)?;
    Ok(())
}

/// Rebuilds the `actor` global with one method per remote operation. Calls
/// block the evaluation until the peer answers; failures surface as thrown
/// exceptions inside the script.
fn install_actor_bindings<'js>(
    ctx: &Ctx<'js>,
    rpcs: &[String],
    invoker: &Arc<RemoteInvoker>,
) -> rquickjs::Result<()> {
    let actor = Object::new(ctx.clone())?;
    for name in rpcs {
        let invoker = invoker.clone();
        let rpc_name = name.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                let args_json = args.0.into_iter().map(|v| value_to_json(&ctx, v)).collect();
                match invoker.call(&rpc_name, args_json) {
                    Ok(output) => json_to_value(&ctx, &output),
                    Err(err) => Err(Exception::throw_message(&ctx, &format!("{rpc_name}: {err}"))),
                }
            },
        )?;
        actor.set(name.as_str(), func)?;
    }
    ctx.globals().set("actor", actor)?;
    Ok(())
}
