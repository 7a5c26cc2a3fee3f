//! Purpose: Route validated requests to the marshaller, plugin cache,
//! registry, and external job runner.
//! Exports: `Worker`, `WorkerConfig`, `RunScriptRequest`, `RunPluginRequest`.
//! Role: The one place that sequences path-guard entry, cache initialization,
//! and execution; both the HTTP surface and the CLI call through here.
//! Invariants: The guard token is dropped before any script or plugin code
//! runs; import resolution re-reads the guard.
//! Invariants: Plugin processing is serialized through the handle's lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::core::cache::ExecutionCache;
use crate::core::error::{Error, ErrorKind};
use crate::core::external::{self, ExternalJobConfig, ExternalJobRequest};
use crate::core::namespace::{Marshaller, OutputPolicy, ScriptRun, build_engine};
use crate::core::path_guard::PathGuard;
use crate::core::plugin::{AxisMeta, PluginHandle};
use crate::core::registry::{PluginEntry, PluginRegistry};
use crate::core::resolver::SearchPaths;

#[derive(Clone, Debug, Default)]
pub struct WorkerConfig {
    /// Directory scanned for discoverable plugins.
    pub plugin_dir: Option<PathBuf>,
    /// Directories permitted to take over the primary script directory.
    pub allow_drift: Vec<PathBuf>,
    pub job: ExternalJobConfig,
}

#[derive(Clone, Debug, Default)]
pub struct RunScriptRequest {
    pub script_path: PathBuf,
    pub inputs: BTreeMap<String, Value>,
    /// Names to copy out of the script namespace after it runs.
    pub outputs: Vec<String>,
    /// Entry-point function to call instead of collecting named outputs.
    pub func_name: Option<String>,
    /// Extra directories for resolving imports, appended for the process
    /// lifetime.
    pub additional_paths: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct RunPluginRequest {
    pub plugin_path: PathBuf,
    pub params: BTreeMap<String, Value>,
    pub inputs: BTreeMap<String, Value>,
    /// Return axis metadata only, without processing any data.
    pub meta_only: bool,
}

pub struct Worker {
    paths: SearchPaths,
    cache: Arc<ExecutionCache>,
    marshaller: Marshaller,
    registry: PluginRegistry,
    job: ExternalJobConfig,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        let guard = Arc::new(PathGuard::new(config.allow_drift));
        let paths = SearchPaths::new(guard);
        let cache = Arc::new(ExecutionCache::new());
        let marshaller = Marshaller::new(build_engine(paths.clone(), cache.clone()));
        Self {
            paths,
            cache,
            marshaller,
            registry: PluginRegistry::new(config.plugin_dir),
            job: config.job,
        }
    }

    /// Liveness probe. Always true once the worker is constructed.
    pub fn is_active(&self) -> bool {
        true
    }

    /// Runs one script and returns its extracted outputs.
    pub fn run_script(
        &self,
        request: &RunScriptRequest,
    ) -> Result<BTreeMap<String, Value>, Error> {
        let policy = match &request.func_name {
            Some(name) if !request.outputs.is_empty() => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!(
                        "declared outputs and entry point {name:?} are mutually exclusive"
                    ))
                    .with_stage("dispatch"));
            }
            Some(name) => OutputPolicy::EntryPoint(name.clone()),
            None => OutputPolicy::Declared(request.outputs.clone()),
        };

        let script_path = self.canonical_script(&request.script_path)?;
        let dir = script_dir(&script_path)?;
        let token = self.paths.guard().enter(&dir)?;
        self.paths.append(&request.additional_paths);
        drop(token);

        tracing::debug!(script = %script_path.display(), "running script");
        self.marshaller.execute(&ScriptRun {
            script_path,
            inputs: request.inputs.clone(),
            policy,
        })
    }

    /// Runs one frame through the cached plugin, loading it on first use, and
    /// frames the output with the plugin's axis metadata.
    pub fn run_plugin(
        &self,
        request: &RunPluginRequest,
    ) -> Result<BTreeMap<String, Value>, Error> {
        let handle = self.plugin_handle(request)?;
        let mut handle = handle.lock().unwrap_or_else(|poison| poison.into_inner());

        if request.meta_only {
            return Ok(frame_meta(handle.meta()));
        }
        let data = request.inputs.get("data").cloned().ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("plugin inputs must carry a \"data\" entry")
                .with_stage("dispatch")
        })?;
        let output = handle.process(data.clone())?;
        frame_output(handle.meta(), data, output, handle.path())
    }

    /// Rank of the cached plugin's output, loading the plugin on first use.
    pub fn output_rank(&self, request: &RunPluginRequest) -> Result<i64, Error> {
        let handle = self.plugin_handle(request)?;
        let mut handle = handle.lock().unwrap_or_else(|poison| poison.into_inner());
        handle.rank()
    }

    pub fn populate_plugins(&self) -> Result<Vec<String>, Error> {
        self.registry.populate()
    }

    /// Info for one plugin, or for every known plugin when no name is given.
    pub fn plugin_info(
        &self,
        name: Option<&str>,
    ) -> Result<BTreeMap<String, PluginEntry>, Error> {
        match name {
            Some(name) => {
                let entry = self.registry.info(name)?;
                Ok(BTreeMap::from([(name.to_string(), entry)]))
            }
            None => self.registry.entries(),
        }
    }

    pub fn plugin_params(&self, name: &str) -> Result<BTreeMap<String, Value>, Error> {
        self.registry.params(name)
    }

    /// Drops the cached plugin handle and the persistent state map.
    pub fn clear_cache(&self) {
        tracing::debug!("clearing the execution cache");
        self.cache.clear();
    }

    pub fn run_external(&self, request: &ExternalJobRequest) -> Result<String, Error> {
        external::run_job(&self.job, request)
    }

    fn plugin_handle(
        &self,
        request: &RunPluginRequest,
    ) -> Result<Arc<std::sync::Mutex<PluginHandle>>, Error> {
        let plugin_path = self.canonical_script(&request.plugin_path)?;
        let dir = script_dir(&plugin_path)?;
        // The token only validates the directory; it must be released before
        // plugin code runs, since import resolution re-reads the guard.
        // Single construction is the cache slot lock's job.
        let token = self.paths.guard().enter(&dir)?;
        drop(token);
        self.cache.get_or_init(|| {
            tracing::info!(plugin = %plugin_path.display(), "loading plugin");
            PluginHandle::load(
                build_engine(self.paths.clone(), self.cache.clone()),
                &plugin_path,
                &request.params,
            )
        })
    }

    fn canonical_script(&self, path: &Path) -> Result<PathBuf, Error> {
        path.canonicalize().map_err(|err| {
            Error::new(ErrorKind::ScriptNotFound)
                .with_message("script does not exist or is not reachable")
                .with_path(path)
                .with_source(err)
                .with_stage("dispatch")
        })
    }
}

fn script_dir(script_path: &Path) -> Result<PathBuf, Error> {
    script_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("script path has no parent directory")
                .with_path(script_path)
                .with_stage("dispatch")
        })
}

/// Axis metadata without any processed data, for metadata-only calls.
fn frame_meta(meta: &AxisMeta) -> BTreeMap<String, Value> {
    let mut framed = BTreeMap::new();
    let mut axes = [("xaxis", "xaxis_title"), ("yaxis", "yaxis_title")].into_iter();
    for label in &meta.labels {
        let Some((axis_key, title_key)) = axes.next() else {
            break;
        };
        if let Some(values) = meta.values.get(label) {
            framed.insert(axis_key.to_string(), Value::Array(values.clone()));
        }
        framed.insert(title_key.to_string(), Value::String(label.clone()));
    }
    framed
}

/// Shapes the processed output for the client.
///
/// A string-labelled axis means the plugin produced one named result per axis
/// entry: the original data passes through untouched and the per-entry results
/// land in an `auxiliary` map keyed by axis value. Numeric axes mean the data
/// itself was transformed, so the output replaces it and the coordinate arrays
/// ride along.
fn frame_output(
    meta: &AxisMeta,
    data: Value,
    output: Value,
    path: &Path,
) -> Result<BTreeMap<String, Value>, Error> {
    let mut framed = BTreeMap::new();
    if let Some(label) = &meta.string_axis {
        let keys = meta.values.get(label).cloned().unwrap_or_default();
        let slices = match output {
            Value::Array(slices) => slices,
            other => vec![other],
        };
        if slices.len() != keys.len() {
            return Err(Error::new(ErrorKind::ScriptFailed)
                .with_message(format!(
                    "plugin produced {} output slices for {} values on axis {label:?}",
                    slices.len(),
                    keys.len()
                ))
                .with_path(path)
                .with_stage("process"));
        }
        let auxiliary: serde_json::Map<String, Value> = keys
            .into_iter()
            .zip(slices)
            .map(|(key, slice)| {
                let key = match key {
                    Value::String(key) => key,
                    other => other.to_string(),
                };
                (key, slice)
            })
            .collect();
        framed.insert("data".to_string(), data);
        framed.insert("auxiliary".to_string(), Value::Object(auxiliary));
        return Ok(framed);
    }

    framed.insert("data".to_string(), output);
    framed.extend(frame_meta(meta));
    Ok(framed)
}
