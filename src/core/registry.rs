//! Purpose: Catalogue of processing plugins available in the configured
//! plugin directory.
//! Exports: `PluginRegistry`, `PluginEntry`.
//! Role: Backs the populate/info/params operations so clients can discover
//! plugins without loading them into the execution cache.
//! Invariants: Only files that define `filter_frames` are listed.
//! Invariants: Queries against an unpopulated registry rescan on demand.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rhai::{AST, CallFnOptions, Engine, Scope};
use serde_json::Value;

use crate::core::error::{Error, ErrorKind};
use crate::core::namespace::{dynamic_to_json, script_failed};

const PLUGIN_EXTENSION: &str = "rhai";
const FN_FILTER_FRAMES: &str = "filter_frames";
const FN_PARAMETERS: &str = "parameters";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginEntry {
    pub path: PathBuf,
    /// Names of the contract functions the plugin defines, sorted.
    pub functions: Vec<String>,
}

pub struct PluginRegistry {
    dir: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, PluginEntry>>,
}

impl PluginRegistry {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Rescans the plugin directory and returns the sorted plugin names.
    /// Files that fail to compile are skipped with a warning rather than
    /// failing the whole scan.
    pub fn populate(&self) -> Result<Vec<String>, Error> {
        let dir = self.require_dir()?;
        let mut found = BTreeMap::new();
        let listing = std::fs::read_dir(dir).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read the plugin directory")
                .with_path(dir)
                .with_source(err)
        })?;
        let engine = Engine::new();
        for entry in listing {
            let entry = entry.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read a plugin directory entry")
                    .with_path(dir)
                    .with_source(err)
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PLUGIN_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let ast = match engine.compile_file(path.clone()) {
                Ok(ast) => ast,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unparsable plugin");
                    continue;
                }
            };
            let mut functions: Vec<String> = ast
                .iter_functions()
                .map(|func| func.name.to_string())
                .collect();
            functions.sort();
            functions.dedup();
            if !functions.iter().any(|func| func == FN_FILTER_FRAMES) {
                continue;
            }
            found.insert(name.to_string(), PluginEntry { path, functions });
        }

        let names = found.keys().cloned().collect();
        *self
            .entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = found;
        Ok(names)
    }

    /// Known plugin names in sorted order, scanning first if nothing is cached.
    pub fn names(&self) -> Result<Vec<String>, Error> {
        self.ensure_populated()?;
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    /// Snapshot of every known plugin entry, scanning first if needed.
    pub fn entries(&self) -> Result<BTreeMap<String, PluginEntry>, Error> {
        self.ensure_populated()?;
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone())
    }

    pub fn info(&self, name: &str) -> Result<PluginEntry, Error> {
        self.ensure_populated()?;
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| self.unknown_plugin(name))
    }

    /// Default parameters a plugin declares, without loading it into the
    /// execution cache. Plugins without a `parameters` function report an
    /// empty map.
    pub fn params(&self, name: &str) -> Result<BTreeMap<String, Value>, Error> {
        let entry = self.info(name)?;
        let engine = Engine::new();
        let ast = engine
            .compile_file(entry.path.clone())
            .map_err(|err| script_failed(err, &entry.path, "inspect"))?;
        if !entry.functions.iter().any(|func| func == FN_PARAMETERS) {
            return Ok(BTreeMap::new());
        }
        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|err| script_failed(err, &entry.path, "inspect"))?;
        let defaults = call_parameters(&engine, &mut scope, &ast, &entry.path)?;
        match dynamic_to_json(&defaults)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(Error::new(ErrorKind::ScriptFailed)
                .with_message(format!("{FN_PARAMETERS:?} must return a map"))
                .with_path(&entry.path)
                .with_stage("inspect")),
        }
    }

    fn ensure_populated(&self) -> Result<(), Error> {
        let empty = self
            .entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .is_empty();
        if empty {
            self.populate()?;
        }
        Ok(())
    }

    fn require_dir(&self) -> Result<&Path, Error> {
        self.dir.as_deref().ok_or_else(|| {
            Error::new(ErrorKind::Configuration)
                .with_message("no plugin directory is configured")
                .with_hint("Start the worker with --plugin-dir to enable plugin discovery.")
                .with_stage("registry")
        })
    }

    fn unknown_plugin(&self, name: &str) -> Error {
        Error::new(ErrorKind::ScriptNotFound)
            .with_message(format!("no plugin named {name:?} in the plugin directory"))
            .with_stage("registry")
    }
}

fn call_parameters(
    engine: &Engine,
    scope: &mut Scope<'_>,
    ast: &AST,
    path: &Path,
) -> Result<rhai::Dynamic, Error> {
    let options = CallFnOptions::new().eval_ast(false);
    engine
        .call_fn_with_options(options, scope, ast, FN_PARAMETERS, ())
        .map_err(|err| script_failed(err, path, "inspect"))
}
