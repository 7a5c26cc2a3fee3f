//! Purpose: Hold top-level CLI command dispatch for `scriptworker`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command
//! execution.
//! Invariants: Output envelopes and exit code semantics stay unchanged.

use super::*;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use clap::CommandFactory;
use scriptworker::api::remote::RemoteWorker;
use scriptworker::api::{PluginInfoReply, RunScriptParams};
use scriptworker::core::dispatch::{RunScriptRequest, Worker, WorkerConfig};
use scriptworker::core::external::ExternalJobConfig;
use scriptworker::core::registry::PluginRegistry;
use scriptworker::serve;

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "scriptworker", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Serve {
            bind,
            allow_non_loopback,
            plugin_dir,
            allow_drift,
            job_timeout_secs,
        } => {
            let bind: SocketAddr = bind.parse().map_err(|_| {
                Error::new(ErrorKind::Usage)
                    .with_message("invalid bind address")
                    .with_hint("Use a host:port value like 127.0.0.1:9780.")
            })?;
            let config = serve::ServeConfig {
                bind,
                allow_non_loopback,
                worker: WorkerConfig {
                    plugin_dir,
                    allow_drift,
                    job: ExternalJobConfig {
                        timeout: Duration::from_secs(job_timeout_secs),
                        ..ExternalJobConfig::default()
                    },
                },
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Run {
            script,
            inputs,
            outputs,
            func,
            paths,
            remote,
        } => {
            let inputs = read_inputs(inputs.as_deref())?;
            let outputs_map = match remote {
                Some(base_url) => {
                    let client = RemoteWorker::new(base_url)?;
                    client.run_script(&RunScriptParams {
                        script_path: script,
                        inputs,
                        outputs,
                        func_name: func,
                        additional_paths: paths,
                    })?
                }
                None => {
                    let worker = Worker::new(WorkerConfig::default());
                    worker.run_script(&RunScriptRequest {
                        script_path: script,
                        inputs,
                        outputs,
                        func_name: func,
                        additional_paths: paths,
                    })?
                }
            };
            emit_outputs(&outputs_map);
            Ok(RunOutcome::ok())
        }
        Command::Plugins { command } => dispatch_plugins(command),
    }
}

fn dispatch_plugins(command: PluginsCommand) -> Result<RunOutcome, Error> {
    match command {
        PluginsCommand::List { dir, remote } => {
            let names = match remote {
                Some(base_url) => RemoteWorker::new(base_url)?.populate_plugins()?,
                None => PluginRegistry::new(dir).populate()?,
            };
            if io::stdout().is_terminal() {
                for name in &names {
                    println!("{name}");
                }
            } else {
                emit_json(json!({ "plugins": names }));
            }
            Ok(RunOutcome::ok())
        }
        PluginsCommand::Info { name, dir, remote } => {
            let info = match remote {
                Some(base_url) => RemoteWorker::new(base_url)?
                    .plugin_info(Some(&name))?
                    .remove(&name)
                    .ok_or_else(|| {
                        Error::new(ErrorKind::Internal)
                            .with_message(format!("remote reply is missing plugin {name:?}"))
                    })?,
                None => PluginInfoReply::from(PluginRegistry::new(dir).info(&name)?),
            };
            if io::stdout().is_terminal() {
                println!("path: {}", info.path.display());
                println!("functions: {}", info.functions.join(", "));
            } else {
                emit_json(json!({
                    "plugin": {
                        "name": name,
                        "path": info.path.display().to_string(),
                        "functions": info.functions,
                    }
                }));
            }
            Ok(RunOutcome::ok())
        }
        PluginsCommand::Params { name, dir, remote } => {
            let params = match remote {
                Some(base_url) => RemoteWorker::new(base_url)?.plugin_params(&name)?,
                None => PluginRegistry::new(dir).params(&name)?,
            };
            emit_outputs(&params);
            Ok(RunOutcome::ok())
        }
    }
}

fn emit_outputs(outputs: &BTreeMap<String, Value>) {
    let map: Map<String, Value> = outputs
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    emit_json(Value::Object(map));
}
