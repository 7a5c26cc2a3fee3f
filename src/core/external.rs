//! Purpose: Launch and supervise out-of-process analysis jobs.
//! Exports: `ExternalJobConfig`, `ExternalJobRequest`, `run_job`.
//! Role: Wraps the site's job launcher binary: feeds it the serialized job
//! input on stdin, captures stderr to a per-plugin log, and polls for exit.
//! Invariants: A job never outlives `timeout`; on expiry it is killed and the
//! call fails with `ExternalJob`.
//! Invariants: Configuration problems (missing install, missing launcher) are
//! reported as `Configuration`, never as job failures.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};

pub const HOME_VAR: &str = "EDNA_HOME";
pub const SITE_VAR: &str = "EDNA_SITE";

#[derive(Clone, Debug)]
pub struct ExternalJobConfig {
    /// Environment variable naming the job framework install root.
    pub home_var: &'static str,
    /// Environment variable naming the site configuration to select.
    pub site_var: &'static str,
    /// Install root override; when set the environment is not consulted.
    pub home: Option<PathBuf>,
    /// Site override; when set the environment is not consulted.
    pub site: Option<String>,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ExternalJobConfig {
    fn default() -> Self {
        Self {
            home_var: HOME_VAR,
            site_var: SITE_VAR,
            home: None,
            site: None,
            poll_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(600),
        }
    }
}

impl ExternalJobConfig {
    fn home(&self) -> Result<PathBuf, Error> {
        if let Some(home) = &self.home {
            return Ok(home.clone());
        }
        std::env::var_os(self.home_var)
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::new(ErrorKind::Configuration)
                    .with_message(format!("{} is not set", self.home_var))
                    .with_hint("Point it at the external job framework install root.")
                    .with_stage("external")
            })
    }

    fn site(&self) -> Result<String, Error> {
        if let Some(site) = &self.site {
            return Ok(site.clone());
        }
        std::env::var(self.site_var).map_err(|_| {
            Error::new(ErrorKind::Configuration)
                .with_message(format!("{} is not set", self.site_var))
                .with_hint("Name the site configuration the job framework should use.")
                .with_stage("external")
        })
    }
}

#[derive(Clone, Debug)]
pub struct ExternalJobRequest {
    /// Launcher name under the install root's `bin/` directory.
    pub plugin_name: String,
    /// Serialized job input, written to the launcher's stdin.
    pub input: String,
    /// Working directory for the job; also receives the stderr log.
    pub exec_dir: PathBuf,
    /// Pass `--debug` to the launcher.
    pub debug: bool,
}

/// Runs one external job to completion and returns its stdout.
pub fn run_job(config: &ExternalJobConfig, request: &ExternalJobRequest) -> Result<String, Error> {
    let home = config.home()?;
    let site = config.site()?;

    let launcher = home.join("bin").join(&request.plugin_name);
    if !launcher.is_file() {
        return Err(Error::new(ErrorKind::Configuration)
            .with_message("job launcher does not exist")
            .with_path(&launcher)
            .with_stage("external"));
    }

    let log_path = request.exec_dir.join(format!("{}.log", request.plugin_name));
    let log = std::fs::File::create(&log_path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create the job log file")
            .with_path(&log_path)
            .with_source(err)
    })?;

    tracing::info!(
        plugin = %request.plugin_name,
        exec_dir = %request.exec_dir.display(),
        "launching external job"
    );
    let mut command = Command::new(&launcher);
    if request.debug {
        command.arg("--debug");
    }
    let mut child = command
        .current_dir(&request.exec_dir)
        .env(config.site_var, &site)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(log)
        .spawn()
        .map_err(|err| {
            Error::new(ErrorKind::ExternalJob)
                .with_message("failed to spawn the job launcher")
                .with_path(&launcher)
                .with_source(err)
                .with_stage("external")
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(request.input.as_bytes()).map_err(|err| {
            let _ = child.kill();
            Error::new(ErrorKind::ExternalJob)
                .with_message("failed to write the job input")
                .with_source(err)
                .with_stage("external")
        })?;
    }

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() >= config.timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::new(ErrorKind::ExternalJob)
                        .with_message(format!(
                            "job {:?} timed out after {:?}",
                            request.plugin_name, config.timeout
                        ))
                        .with_path(&log_path)
                        .with_stage("external"));
                }
                std::thread::sleep(config.poll_interval);
            }
            Err(err) => {
                return Err(Error::new(ErrorKind::ExternalJob)
                    .with_message("failed to poll the job")
                    .with_source(err)
                    .with_stage("external"));
            }
        }
    };

    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_string(&mut stdout).map_err(|err| {
            Error::new(ErrorKind::ExternalJob)
                .with_message("failed to read the job output")
                .with_source(err)
                .with_stage("external")
        })?;
    }

    if !status.success() {
        let mut message = format!("job {:?} exited with {status}", request.plugin_name);
        match log_tail(&log_path) {
            Some(tail) => {
                message.push_str(": ");
                message.push_str(&tail);
            }
            None => message.push_str("; see the job log"),
        }
        return Err(Error::new(ErrorKind::ExternalJob)
            .with_message(message)
            .with_path(&log_path)
            .with_stage("external"));
    }
    Ok(stdout)
}

const LOG_TAIL_LINES: usize = 5;

/// Last few non-empty lines of the job log, for the error message.
fn log_tail(log_path: &Path) -> Option<String> {
    let log = std::fs::read_to_string(log_path).ok()?;
    let lines: Vec<&str> = log
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    Some(lines[start..].join(" | "))
}
