//! Purpose: Long-lived handle around one loaded processing plugin.
//! Exports: `PluginHandle`, `AxisMeta`.
//! Role: Owns the plugin's engine, compiled AST, and persistent scope; derives
//! axis metadata once at load time and serializes processing calls.
//! Invariants: `load` runs the plugin's top-level code and `pre_process`
//! exactly once; later calls reuse the same scope.
//!
//! Plugin contract (all Rhai functions, only `filter_frames` is required):
//!   parameters() -> map of defaults
//!   pre_process(params) -> one-time setup, may stash values via state_set
//!   filter_frames(data) -> transformed data
//!   axis_labels() -> array of axis label strings, x axis first
//!   axis_values(label) -> array of coordinate values for that axis
//!   output_rank() -> integer rank of the transformed output

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rhai::{AST, CallFnOptions, Dynamic, Engine, FuncArgs, Scope};
use serde_json::Value;

use crate::core::error::{Error, ErrorKind};
use crate::core::namespace::{dynamic_to_json, json_to_dynamic, script_failed};

pub const PLUGIN_FILE_VAR: &str = "PLUGIN_FILE";

const FN_PARAMETERS: &str = "parameters";
const FN_PRE_PROCESS: &str = "pre_process";
const FN_FILTER_FRAMES: &str = "filter_frames";
const FN_AXIS_LABELS: &str = "axis_labels";
const FN_AXIS_VALUES: &str = "axis_values";
const FN_OUTPUT_RANK: &str = "output_rank";

/// Axis metadata derived from the plugin at load time.
#[derive(Clone, Debug, Default)]
pub struct AxisMeta {
    /// Ordered axis labels, x axis first.
    pub labels: Vec<String>,
    /// Coordinate values per axis label.
    pub values: BTreeMap<String, Vec<Value>>,
    /// The first axis whose values are string-labelled, when present. Its
    /// presence switches the dispatcher to metadata-only output framing.
    pub string_axis: Option<String>,
}

pub struct PluginHandle {
    name: String,
    path: PathBuf,
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
    params: BTreeMap<String, Value>,
    meta: AxisMeta,
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("params", &self.params)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl PluginHandle {
    /// Loads a plugin script, runs its top-level code and `pre_process`, and
    /// derives axis metadata. This is the expensive step the execution cache
    /// exists to amortize.
    pub fn load(
        engine: Engine,
        path: &Path,
        caller_params: &BTreeMap<String, Value>,
    ) -> Result<Self, Error> {
        if !path.is_file() {
            return Err(Error::new(ErrorKind::ScriptNotFound)
                .with_message("plugin does not exist or is not a file")
                .with_path(path)
                .with_stage("init"));
        }
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        let ast = engine
            .compile_file(path.to_path_buf())
            .map_err(|err| script_failed(err, path, "init"))?;
        if !defines_function(&ast, FN_FILTER_FRAMES) {
            return Err(Error::new(ErrorKind::ScriptFailed)
                .with_message(format!("plugin must define {FN_FILTER_FRAMES:?}"))
                .with_path(path)
                .with_stage("init"));
        }

        let mut scope = Scope::new();
        scope.push_constant(PLUGIN_FILE_VAR, path.to_string_lossy().to_string());
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|err| script_failed(err, path, "init"))?;

        let mut handle = Self {
            name,
            path: path.to_path_buf(),
            engine,
            ast,
            scope,
            params: BTreeMap::new(),
            meta: AxisMeta::default(),
        };

        let mut params = handle.default_parameters()?;
        for (key, value) in caller_params {
            params.insert(key.clone(), value.clone());
        }
        handle.params = params;

        if handle.defines(FN_PRE_PROCESS) {
            let arg = json_to_dynamic(&Value::Object(
                handle
                    .params
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ))?;
            handle.call_dynamic(FN_PRE_PROCESS, (arg,))?;
        }

        handle.meta = handle.derive_meta()?;
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn meta(&self) -> &AxisMeta {
        &self.meta
    }

    /// Runs the plugin's transform over one frame of data.
    pub fn process(&mut self, data: Value) -> Result<Value, Error> {
        let arg = json_to_dynamic(&data)?;
        let output = self.call_dynamic(FN_FILTER_FRAMES, (arg,))?;
        dynamic_to_json(&output).map_err(|err| err.with_stage("process"))
    }

    /// Rank of the transformed output: the plugin's own `output_rank` when
    /// defined, otherwise the number of derived axes.
    pub fn rank(&mut self) -> Result<i64, Error> {
        if self.defines(FN_OUTPUT_RANK) {
            let rank = self.call_dynamic(FN_OUTPUT_RANK, ())?;
            return rank.as_int().map_err(|type_name| {
                Error::new(ErrorKind::ScriptFailed)
                    .with_message(format!(
                        "{FN_OUTPUT_RANK:?} must return an integer, got {type_name}"
                    ))
                    .with_path(&self.path)
                    .with_stage("process")
            });
        }
        Ok(self.meta.labels.len() as i64)
    }

    fn defines(&self, name: &str) -> bool {
        defines_function(&self.ast, name)
    }

    fn call_dynamic(&mut self, name: &str, args: impl FuncArgs) -> Result<Dynamic, Error> {
        let options = CallFnOptions::new().eval_ast(false);
        self.engine
            .call_fn_with_options(options, &mut self.scope, &self.ast, name, args)
            .map_err(|err| script_failed(err, &self.path, "process"))
    }

    fn default_parameters(&mut self) -> Result<BTreeMap<String, Value>, Error> {
        if !self.defines(FN_PARAMETERS) {
            return Ok(BTreeMap::new());
        }
        let defaults = self.call_dynamic(FN_PARAMETERS, ())?;
        match dynamic_to_json(&defaults)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(Error::new(ErrorKind::ScriptFailed)
                .with_message(format!("{FN_PARAMETERS:?} must return a map"))
                .with_path(&self.path)
                .with_stage("init")),
        }
    }

    fn derive_meta(&mut self) -> Result<AxisMeta, Error> {
        if !self.defines(FN_AXIS_LABELS) {
            return Ok(AxisMeta::default());
        }
        let labels = self.call_dynamic(FN_AXIS_LABELS, ())?;
        let labels: Vec<String> = match dynamic_to_json(&labels)? {
            Value::Array(entries) => entries
                .into_iter()
                .map(|entry| match entry {
                    Value::String(label) => Ok(label),
                    other => Err(Error::new(ErrorKind::ScriptFailed)
                        .with_message(format!(
                            "{FN_AXIS_LABELS:?} must return strings, got {other}"
                        ))
                        .with_path(&self.path)
                        .with_stage("init")),
                })
                .collect::<Result<_, _>>()?,
            _ => {
                return Err(Error::new(ErrorKind::ScriptFailed)
                    .with_message(format!("{FN_AXIS_LABELS:?} must return an array"))
                    .with_path(&self.path)
                    .with_stage("init"));
            }
        };

        let mut values = BTreeMap::new();
        if self.defines(FN_AXIS_VALUES) {
            for label in &labels {
                let axis = self.call_dynamic(
                    FN_AXIS_VALUES,
                    (Dynamic::from(label.clone()),),
                )?;
                let axis = match dynamic_to_json(&axis)? {
                    Value::Array(entries) => entries,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                values.insert(label.clone(), axis);
            }
        }

        let string_axis = labels
            .iter()
            .find(|label| {
                values
                    .get(*label)
                    .is_some_and(|axis| axis.iter().any(Value::is_string))
            })
            .cloned();

        Ok(AxisMeta {
            labels,
            values,
            string_axis,
        })
    }
}

fn defines_function(ast: &AST, name: &str) -> bool {
    ast.iter_functions().any(|func| func.name == name)
}

#[cfg(test)]
mod tests {
    use super::PluginHandle;
    use crate::core::error::ErrorKind;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    fn write_plugin(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create plugin");
        file.write_all(body.as_bytes()).expect("write plugin");
        path
    }

    const SCALER: &str = r#"
fn parameters() {
    #{ scale: 2.0 }
}

fn filter_frames(data) {
    let out = [];
    for value in data {
        out.push(value * 2.0);
    }
    out
}

fn axis_labels() {
    ["energy"]
}

fn axis_values(label) {
    [1.0, 2.0, 3.0]
}
"#;

    #[test]
    fn load_derives_params_and_numeric_axis_meta() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_plugin(dir.path(), "scaler.rhai", SCALER);
        let mut overrides = BTreeMap::new();
        overrides.insert("scale".to_string(), json!(4.0));
        let handle = PluginHandle::load(
            rhai::Engine::new(),
            &path,
            &overrides,
        )
        .expect("load");

        assert_eq!(handle.name(), "scaler");
        assert_eq!(handle.params().get("scale"), Some(&json!(4.0)));
        assert_eq!(handle.meta().labels, vec!["energy".to_string()]);
        assert!(handle.meta().string_axis.is_none());
        assert_eq!(
            handle.meta().values.get("energy"),
            Some(&vec![json!(1.0), json!(2.0), json!(3.0)])
        );
    }

    #[test]
    fn process_runs_filter_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_plugin(dir.path(), "scaler.rhai", SCALER);
        let mut handle = PluginHandle::load(
            rhai::Engine::new(),
            &path,
            &BTreeMap::new(),
        )
        .expect("load");
        let output = handle.process(json!([1.0, 2.0])).expect("process");
        assert_eq!(output, json!([2.0, 4.0]));
    }

    #[test]
    fn string_axis_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_plugin(
            dir.path(),
            "elements.rhai",
            r#"
fn filter_frames(data) { data }
fn axis_labels() { ["element"] }
fn axis_values(label) { ["Fe", "Cu"] }
"#,
        );
        let handle = PluginHandle::load(
            rhai::Engine::new(),
            &path,
            &BTreeMap::new(),
        )
        .expect("load");
        assert_eq!(handle.meta().string_axis.as_deref(), Some("element"));
    }

    #[test]
    fn rank_prefers_plugin_declaration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_plugin(
            dir.path(),
            "ranked.rhai",
            "fn filter_frames(data) { data }\nfn output_rank() { 2 }\n",
        );
        let mut handle = PluginHandle::load(
            rhai::Engine::new(),
            &path,
            &BTreeMap::new(),
        )
        .expect("load");
        assert_eq!(handle.rank().expect("rank"), 2);
    }

    #[test]
    fn plugin_without_filter_frames_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_plugin(dir.path(), "empty.rhai", "let x = 1;\n");
        let err = PluginHandle::load(
            rhai::Engine::new(),
            &path,
            &BTreeMap::new(),
        )
        .expect_err("reject");
        assert_eq!(err.kind(), ErrorKind::ScriptFailed);
    }

    #[test]
    fn missing_plugin_is_script_not_found() {
        let err = PluginHandle::load(
            rhai::Engine::new(),
            Path::new("/nonexistent/plugin.rhai"),
            &BTreeMap::new(),
        )
        .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::ScriptNotFound);
    }
}
