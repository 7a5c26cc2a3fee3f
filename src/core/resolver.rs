//! Purpose: Resolve `import` statements inside user scripts against the
//! worker's search paths.
//! Exports: `SearchPaths`, `WorkerModuleResolver`.
//! Role: Replaces Rhai's single-base-directory file resolver with the guarded
//! primary directory plus caller-appended additional paths.
//! Invariants: Additional paths are append-only for the process lifetime.
//! Invariants: The primary directory is read from the path guard, never stored
//! here, so a guarded change is visible to later imports.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rhai::{Engine, EvalAltResult, Module, ModuleResolver, Position, Scope, Shared};

use crate::core::path_guard::PathGuard;

const SCRIPT_EXTENSION: &str = "rhai";

/// Process-wide module search list: the guarded primary directory first, then
/// every appended additional path in order.
#[derive(Clone)]
pub struct SearchPaths {
    guard: Arc<PathGuard>,
    extra: Arc<Mutex<Vec<PathBuf>>>,
}

impl SearchPaths {
    pub fn new(guard: Arc<PathGuard>) -> Self {
        Self {
            guard,
            extra: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn guard(&self) -> &Arc<PathGuard> {
        &self.guard
    }

    /// Appends additional search paths. Entries are kept for the process
    /// lifetime (intentional: imports resolved through them may be cached and
    /// reused by later invocations). Duplicates are skipped.
    pub fn append(&self, paths: &[PathBuf]) {
        if paths.is_empty() {
            return;
        }
        let mut extra = self
            .extra
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        for path in paths {
            if !extra.contains(path) {
                extra.push(path.clone());
            }
        }
    }

    /// Candidate files for a module name, in resolution order.
    pub fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let file = format!("{name}.{SCRIPT_EXTENSION}");
        let mut candidates = Vec::new();
        if let Some(primary) = self.guard.primary() {
            candidates.push(primary.join(&file));
        }
        let extra = self
            .extra
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        for dir in extra.iter() {
            candidates.push(dir.join(&file));
        }
        candidates
    }

    #[cfg(test)]
    pub fn extra_len(&self) -> usize {
        self.extra
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }
}

pub struct WorkerModuleResolver {
    paths: SearchPaths,
}

impl WorkerModuleResolver {
    pub fn new(paths: SearchPaths) -> Self {
        Self { paths }
    }
}

impl ModuleResolver for WorkerModuleResolver {
    fn resolve(
        &self,
        engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        for candidate in self.paths.candidates(path) {
            if !candidate.is_file() {
                continue;
            }
            let ast = engine.compile_file(candidate).map_err(|err| {
                Box::new(EvalAltResult::ErrorInModule(path.to_string(), err, pos))
            })?;
            let module = Module::eval_ast_as_new(Scope::new(), &ast, engine).map_err(|err| {
                Box::new(EvalAltResult::ErrorInModule(path.to_string(), err, pos))
            })?;
            return Ok(Shared::new(module));
        }
        Err(EvalAltResult::ErrorModuleNotFound(path.to_string(), pos).into())
    }
}
