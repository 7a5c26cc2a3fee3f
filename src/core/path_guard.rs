//! Purpose: Serialize mutation of the process-wide primary script directory.
//! Exports: `PathGuard`, `GuardToken`.
//! Role: Protects relative-import resolution for in-flight script executions.
//! Invariants: Once set, the primary directory only changes for allow-listed
//! directories; conflicting requests fail with `PathRace` and leave it unchanged.
//! Invariants: The lock is held for the critical section only (set/validate plus
//! cache initialization), never across a script run.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::core::error::{Error, ErrorKind};

#[derive(Debug, Default)]
struct GuardState {
    primary: Option<PathBuf>,
}

/// Held while the primary directory is validated and the execution cache is
/// initialized. Dropping it releases the lock on every exit path.
#[derive(Debug)]
pub struct GuardToken<'a> {
    _state: MutexGuard<'a, GuardState>,
}

#[derive(Debug)]
pub struct PathGuard {
    state: Mutex<GuardState>,
    allow_drift: Vec<PathBuf>,
}

impl PathGuard {
    pub fn new(allow_drift: Vec<PathBuf>) -> Self {
        Self {
            state: Mutex::new(GuardState::default()),
            allow_drift,
        }
    }

    /// Validates `candidate` as the primary script directory and returns a
    /// token holding the guard lock. The first caller sets the directory;
    /// later callers must present the same directory or one from the
    /// allow-drift list.
    pub fn enter(&self, candidate: &Path) -> Result<GuardToken<'_>, Error> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        match &state.primary {
            None => {
                state.primary = Some(candidate.to_path_buf());
            }
            Some(current) if current == candidate => {}
            Some(current) => {
                if self.allow_drift.iter().any(|dir| dir == candidate) {
                    tracing::warn!(
                        from = %current.display(),
                        to = %candidate.display(),
                        "primary script directory drift permitted by allow-list"
                    );
                    state.primary = Some(candidate.to_path_buf());
                } else {
                    return Err(Error::new(ErrorKind::PathRace)
                        .with_message(format!(
                            "refusing to change the primary script directory from {} to {} \
                             while executions may depend on it",
                            current.display(),
                            candidate.display()
                        ))
                        .with_hint(
                            "Run scripts from one directory per worker, or start the worker \
                             with --allow-drift for directories that may take over.",
                        )
                        .with_stage("path-guard"));
                }
            }
        }
        Ok(GuardToken { _state: state })
    }

    /// Snapshot of the current primary directory, for module resolution.
    pub fn primary(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .primary
            .clone()
    }
}
