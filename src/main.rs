//! Purpose: `scriptworker` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `core::error::to_exit_code`.
//! Invariants: All script/plugin execution goes through `core::dispatch::Worker`.
#![allow(clippy::result_large_err)]

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};

mod command_dispatch;

use scriptworker::core::error::{Error, ErrorKind, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(err.to_string().lines().next().unwrap_or("bad usage").to_string())
                    .with_hint("Run with --help for usage."));
            }
        },
    };

    command_dispatch::dispatch_command(cli.command)
}

#[derive(Parser)]
#[command(
    name = "scriptworker",
    version,
    about = "Script and plugin execution worker with a JSON-RPC surface",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    before_help = r#"Runs analysis scripts and processing plugins on behalf of remote callers.

Mental model:
  - `serve` exposes the worker over HTTP (loopback by default)
  - `run` executes one script locally or against a running worker
  - `plugins` inspects the plugin directory
"#,
    after_help = r#"EXAMPLES
  $ scriptworker serve --bind 127.0.0.1:9780
  $ scriptworker run analysis.rhai --inputs '{"I0":[10.0],"It":[5.0]}' --output lnI0It
  $ scriptworker plugins list --dir ./plugins

LEARN MORE
  $ scriptworker <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve the worker protocol over HTTP",
        after_help = r#"EXAMPLES
  $ scriptworker serve
  $ scriptworker serve --bind 127.0.0.1:9780 --plugin-dir ./plugins
  $ scriptworker serve --allow-drift /data/beamline/scripts

NOTES
  - Binds loopback-only unless --allow-non-loopback is given
  - The first runScript call pins the primary script directory"#
    )]
    Serve {
        #[arg(
            long,
            default_value = "127.0.0.1:9780",
            help = "Address to bind, host:port"
        )]
        bind: String,
        #[arg(long, help = "Permit binding a non-loopback address")]
        allow_non_loopback: bool,
        #[arg(
            long,
            help = "Directory scanned for discoverable plugins",
            value_hint = ValueHint::DirPath
        )]
        plugin_dir: Option<PathBuf>,
        #[arg(
            long,
            help = "Repeatable directory allowed to take over the primary script directory",
            value_hint = ValueHint::DirPath
        )]
        allow_drift: Vec<PathBuf>,
        #[arg(
            long,
            default_value_t = 600,
            help = "Seconds before an external job is killed"
        )]
        job_timeout_secs: u64,
    },
    #[command(
        about = "Run one script and print its outputs as JSON",
        after_help = r#"EXAMPLES
  $ scriptworker run sum.rhai --inputs '{"a":2,"b":40}' --output total
  $ scriptworker run entry.rhai --inputs '{"a":1}' --func run
  $ cat inputs.json | scriptworker run sum.rhai --output total
  $ scriptworker run sum.rhai --remote http://127.0.0.1:9780 --output total

NOTES
  - --output and --func are mutually exclusive
  - Inputs default to stdin when it is not a terminal"#
    )]
    Run {
        #[arg(help = "Script file to execute", value_hint = ValueHint::FilePath)]
        script: PathBuf,
        #[arg(long, help = "Inline JSON object of named inputs")]
        inputs: Option<String>,
        #[arg(long = "output", help = "Repeatable name to copy out of the namespace")]
        outputs: Vec<String>,
        #[arg(long, help = "Entry-point function to call instead of named outputs")]
        func: Option<String>,
        #[arg(
            long = "path",
            help = "Repeatable extra directory for resolving imports",
            value_hint = ValueHint::DirPath
        )]
        paths: Vec<PathBuf>,
        #[arg(long, help = "Run against a worker at this base URL instead of locally")]
        remote: Option<String>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Inspect the plugin directory",
        after_help = r#"EXAMPLES
  $ scriptworker plugins list --dir ./plugins
  $ scriptworker plugins info median --dir ./plugins
  $ scriptworker plugins params median --dir ./plugins"#
    )]
    Plugins {
        #[command(subcommand)]
        command: PluginsCommand,
    },
    #[command(about = "Print version information")]
    Version,
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(value_enum, help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum PluginsCommand {
    #[command(about = "List discoverable plugins")]
    List {
        #[arg(long, help = "Plugin directory", value_hint = ValueHint::DirPath)]
        dir: Option<PathBuf>,
        #[arg(long, help = "Query a worker at this base URL instead of the filesystem")]
        remote: Option<String>,
    },
    #[command(about = "Show one plugin's path and contract functions")]
    Info {
        #[arg(help = "Plugin name")]
        name: String,
        #[arg(long, help = "Plugin directory", value_hint = ValueHint::DirPath)]
        dir: Option<PathBuf>,
        #[arg(long, help = "Query a worker at this base URL instead of the filesystem")]
        remote: Option<String>,
    },
    #[command(about = "Show one plugin's declared default parameters")]
    Params {
        #[arg(help = "Plugin name")]
        name: String,
        #[arg(long, help = "Plugin directory", value_hint = ValueHint::DirPath)]
        dir: Option<PathBuf>,
        #[arg(long, help = "Query a worker at this base URL instead of the filesystem")]
        remote: Option<String>,
    },
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("scriptworker {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "scriptworker",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

fn emit_json(value: Value) {
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn read_inputs(inline: Option<&str>) -> Result<BTreeMap<String, Value>, Error> {
    let raw = match inline {
        Some(raw) => raw.to_string(),
        None => {
            if io::stdin().is_terminal() {
                return Ok(BTreeMap::new());
            }
            let mut raw = String::new();
            io::stdin().read_to_string(&mut raw).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read inputs from stdin")
                    .with_source(err)
            })?;
            raw
        }
    };
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let value: Value = serde_json::from_str(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("inputs must be a JSON object")
            .with_source(err)
    })?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message("inputs must be a JSON object of named values")),
    }
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {err}");
        if let Some(hint) = err.hint() {
            eprintln!("hint: {hint}");
        }
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert(
        "message".to_string(),
        json!(err.message().unwrap_or("error")),
    );
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(stage) = err.stage() {
        inner.insert("stage".to_string(), json!(stage));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    json!({ "error": inner })
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}
