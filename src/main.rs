//! Interactive front end. `actor-console --target ws://host:port/path` opens
//! a console against the unit and evaluates each stdin line inside it;
//! results and logs print asynchronously as the sandbox reports them.

use std::collections::HashMap;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Mutex;

use actor_console::{
    CapabilityHints, Command, CommandStatus, ConsoleBridge, ContainerState, ContainerStatus,
    event_log,
};
use serde_json::Value as JsonValue;

#[derive(Debug)]
struct CliOptions {
    target: String,
    debug_events_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = parse_cli_args()?;
    event_log::initialize(
        options.debug_events_dir.clone(),
        event_log::StartupContext {
            mode: "console".to_string(),
            target: Some(options.target.clone()),
        },
    )?;
    run_console(options)
}

fn parse_cli_args() -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new();
    parse_options(&mut parser)
}

fn parse_options(parser: &mut ArgParser) -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut target = None;
    let mut debug_events_dir = None;
    while let Some(arg) = parser.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--target" => {
                let value = parser.next_value("--target")?;
                if value.trim().is_empty() {
                    return Err("missing value for --target".into());
                }
                target = Some(value);
            }
            _ if arg.starts_with("--target=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.trim().is_empty() {
                    return Err("missing value for --target".into());
                }
                target = Some(value.to_string());
            }
            "--debug-events-dir" => {
                let value = parser.next_value("--debug-events-dir")?;
                if value.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--debug-events-dir=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(value));
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }
    let target = target.ok_or("missing required --target <ws-url>")?;
    Ok(CliOptions {
        target,
        debug_events_dir,
    })
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

fn run_console(options: CliOptions) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!(
        "actor console: target={} | lines evaluate inside the unit | .help for commands | Ctrl-D to exit",
        options.target
    );

    let bridge = ConsoleBridge::new();
    let tracker = Mutex::new(RenderTracker::default());
    let _subscription = bridge.subscribe(move |state| render_transitions(&tracker, state));
    bridge.init(options.target.as_str(), CapabilityHints::default());

    let stdin = io::stdin();
    let mut stdin = stdin.lock();
    loop {
        let Some(line) = read_line(&mut stdin)? else {
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('.') {
            match handle_directive(&bridge, trimmed) {
                Directive::Continue => continue,
                Directive::Exit => break,
            }
        }
        bridge.run(trimmed);
    }

    bridge.terminate();
    Ok(())
}

enum Directive {
    Continue,
    Exit,
}

fn handle_directive(bridge: &ConsoleBridge, line: &str) -> Directive {
    match line {
        ".exit" => return Directive::Exit,
        ".help" => print_console_help(),
        ".state" => match serde_json::to_string_pretty(&*bridge.state()) {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("actor-console: cannot render state: {err}"),
        },
        _ => {
            if let Some(rest) = line.strip_prefix(".set-state") {
                let rest = rest.trim();
                if rest.is_empty() {
                    eprintln!("actor-console: .set-state expects a JSON payload");
                } else {
                    match serde_json::from_str::<JsonValue>(rest) {
                        Ok(payload) => bridge.set_state(payload),
                        Err(err) => eprintln!("actor-console: .set-state expects JSON: {err}"),
                    }
                }
            } else {
                eprintln!("actor-console: unknown command {line}; try .help");
            }
        }
    }
    Directive::Continue
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line)?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Last rendered position per command so each subscriber callback prints
/// only what changed since the previous snapshot.
#[derive(Default)]
struct RenderTracker {
    status: Option<ContainerStatus>,
    connected: Option<bool>,
    commands: HashMap<u64, (CommandStatus, usize)>,
}

fn render_transitions(tracker: &Mutex<RenderTracker>, state: &ContainerState) {
    let mut tracker = tracker
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if tracker.status != Some(state.status) || tracker.connected != Some(state.connected) {
        tracker.status = Some(state.status);
        tracker.connected = Some(state.connected);
        eprintln!("console: {}", describe_console(state));
    }
    for command in &state.commands {
        let (last_status, rendered_logs) = tracker
            .commands
            .get(&command.key)
            .copied()
            .unwrap_or((CommandStatus::Pending, 0));
        for entry in command.logs.iter().skip(rendered_logs) {
            println!(
                "[{}] {}: {}",
                command.key,
                entry.method,
                render_args(&entry.args)
            );
        }
        if command.status != last_status {
            render_command(command);
        }
        tracker
            .commands
            .insert(command.key, (command.status, command.logs.len()));
    }
}

fn describe_console(state: &ContainerState) -> String {
    match state.status {
        ContainerStatus::Unknown => "closed".to_string(),
        ContainerStatus::Pending => "connecting".to_string(),
        ContainerStatus::Ready if !state.connected => "connection lost, retrying".to_string(),
        ContainerStatus::Ready => format!("ready (rpcs: {})", state.rpcs.join(", ")),
        ContainerStatus::Error | ContainerStatus::Unsupported => {
            let label = if state.status == ContainerStatus::Error {
                "error"
            } else {
                "unsupported"
            };
            match &state.error {
                Some(error) => format!("{label}: {}", error.message),
                None => label.to_string(),
            }
        }
    }
}

fn render_command(command: &Command) {
    match command.status {
        CommandStatus::Success => {
            let value = command.result.clone().unwrap_or(JsonValue::Null);
            println!("[{}] => {}", command.key, value);
        }
        CommandStatus::Error => match &command.error {
            Some(error) => eprintln!("[{}] !! {}", command.key, error.message),
            None => eprintln!("[{}] !! failed", command.key),
        },
        CommandStatus::Pending | CommandStatus::Formatted => {}
    }
}

fn render_args(args: &[JsonValue]) -> String {
    args.iter()
        .map(|arg| match arg {
            JsonValue::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_usage() {
    println!(
        "Usage:\n\
actor-console --target <ws-url> [--debug-events-dir <dir>]\n\n\
--target: subscribe URL of the unit to inspect (ws://host:port/path)\n\
--debug-events-dir: optional directory for per-startup JSONL debug event logs (env: ACTOR_CONSOLE_DEBUG_EVENTS_DIR)"
    );
}

fn print_console_help() {
    eprintln!(
        ".help: show this message\n\
.state: print the full console snapshot as JSON\n\
.set-state <json>: replace the unit's native state\n\
.exit: close the console (Ctrl-D also exits)\n\
anything else: evaluate the line inside the unit"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser_with(args: &[&str]) -> ArgParser {
        ArgParser {
            args: args.iter().map(ToString::to_string).collect(),
            index: 0,
        }
    }

    #[test]
    fn parse_options_accepts_both_target_forms() {
        let mut parser = parser_with(&["--target", "ws://unit:9000/console"]);
        let options = parse_options(&mut parser).expect("parse split form");
        assert_eq!(options.target, "ws://unit:9000/console");

        let mut parser = parser_with(&["--target=ws://unit:9000/console"]);
        let options = parse_options(&mut parser).expect("parse joined form");
        assert_eq!(options.target, "ws://unit:9000/console");
    }

    #[test]
    fn parse_options_requires_a_target() {
        let mut parser = parser_with(&[]);
        let err = parse_options(&mut parser).expect_err("missing target");
        assert!(err.to_string().contains("--target"));
    }

    #[test]
    fn parse_options_rejects_unknown_arguments() {
        let mut parser = parser_with(&["--target", "ws://unit:1/", "--bogus"]);
        let err = parse_options(&mut parser).expect_err("unknown argument");
        assert!(err.to_string().contains("--bogus"));
    }

    #[test]
    fn parse_options_reads_debug_events_dir() {
        let mut parser = parser_with(&[
            "--debug-events-dir=/tmp/console-events",
            "--target",
            "ws://unit:1/",
        ]);
        let options = parse_options(&mut parser).expect("parse");
        assert_eq!(
            options.debug_events_dir,
            Some(PathBuf::from("/tmp/console-events"))
        );
    }

    #[test]
    fn parse_options_rejects_empty_flag_values() {
        let mut parser = parser_with(&["--target="]);
        assert!(parse_options(&mut parser).is_err());
    }
}
