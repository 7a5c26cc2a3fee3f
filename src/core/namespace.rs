//! Purpose: Build an isolated execution namespace for one script invocation.
//! Exports: `Marshaller`, `OutputPolicy`, `ScriptRun`, `build_engine`.
//! Role: Seeds a fresh scope with the caller's named inputs, runs the script's
//! top-level code, and extracts the requested bindings.
//! Invariants: One scope per invocation; nothing survives a call except what
//! scripts explicitly write through the execution cache's state functions.
//! Invariants: Script-raised errors surface as `ScriptFailed` with the
//! original message and position.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{AST, Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;

use crate::core::cache::ExecutionCache;
use crate::core::error::{Error, ErrorKind};
use crate::core::resolver::{SearchPaths, WorkerModuleResolver};

/// Marker constants visible to every script.
pub const SCRIPT_FILE_VAR: &str = "SCRIPT_FILE";
pub const RUN_FUNC_VAR: &str = "RUN_FUNC_NAME";

/// How outputs leave the namespace after the script has run.
#[derive(Clone, Debug)]
pub enum OutputPolicy {
    /// Copy each named binding out of the scope; absent names are omitted.
    Declared(Vec<String>),
    /// Call the named script function with the inputs as one object map and
    /// return its result verbatim.
    EntryPoint(String),
}

#[derive(Clone, Debug)]
pub struct ScriptRun {
    pub script_path: PathBuf,
    pub inputs: BTreeMap<String, Value>,
    pub policy: OutputPolicy,
}

/// Engine factory shared by the marshaller and plugin handles: module
/// resolution through the worker's search paths, plus `state_get`/`state_set`/
/// `state_has` bound to the execution cache.
pub fn build_engine(paths: SearchPaths, cache: Arc<ExecutionCache>) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(WorkerModuleResolver::new(paths));

    let store = cache.clone();
    engine.register_fn(
        "state_set",
        move |name: &str, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let value: Value = from_dynamic(&value)?;
            store.state_set(name, value);
            Ok(())
        },
    );
    let store = cache.clone();
    engine.register_fn(
        "state_get",
        move |name: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            match store.state_get(name) {
                Some(value) => to_dynamic(value),
                None => Ok(Dynamic::UNIT),
            }
        },
    );
    let store = cache;
    engine.register_fn("state_has", move |name: &str| store.state_has(name));

    engine
}

pub struct Marshaller {
    engine: Engine,
}

impl Marshaller {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Executes one script with a fresh namespace and extracts its outputs.
    pub fn execute(&self, run: &ScriptRun) -> Result<BTreeMap<String, Value>, Error> {
        if !run.script_path.is_file() {
            return Err(Error::new(ErrorKind::ScriptNotFound)
                .with_message("script does not exist or is not a file")
                .with_path(&run.script_path)
                .with_stage("marshal"));
        }

        let ast = self
            .engine
            .compile_file(run.script_path.clone())
            .map_err(|err| script_failed(err, &run.script_path, "compile"))?;

        let mut scope = Scope::new();
        scope.push_constant(
            SCRIPT_FILE_VAR,
            run.script_path.to_string_lossy().to_string(),
        );
        let entry_name = match &run.policy {
            OutputPolicy::EntryPoint(name) => name.clone(),
            OutputPolicy::Declared(_) => String::new(),
        };
        scope.push_constant(RUN_FUNC_VAR, entry_name);

        for (name, value) in &run.inputs {
            scope.push_dynamic(name.clone(), json_to_dynamic(value)?);
        }

        self.engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|err| script_failed(err, &run.script_path, "execute"))?;

        match &run.policy {
            OutputPolicy::Declared(names) => self.collect_declared(&scope, names),
            OutputPolicy::EntryPoint(name) => {
                self.call_entry_point(&mut scope, &ast, name, run)
            }
        }
    }

    fn collect_declared(
        &self,
        scope: &Scope<'_>,
        names: &[String],
    ) -> Result<BTreeMap<String, Value>, Error> {
        let mut outputs = BTreeMap::new();
        for name in names {
            if let Some(value) = scope.get_value::<Dynamic>(name) {
                outputs.insert(name.clone(), dynamic_to_json(&value)?);
            }
        }
        Ok(outputs)
    }

    fn call_entry_point(
        &self,
        scope: &mut Scope<'_>,
        ast: &AST,
        name: &str,
        run: &ScriptRun,
    ) -> Result<BTreeMap<String, Value>, Error> {
        if !ast.iter_functions().any(|func| func.name == name) {
            return Err(Error::new(ErrorKind::EntryPointMissing)
                .with_message(format!("script does not define a function named {name:?}"))
                .with_path(&run.script_path)
                .with_stage("marshal"));
        }

        let inputs: serde_json::Map<String, Value> = run
            .inputs
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let arg = json_to_dynamic(&Value::Object(inputs))?;

        let options = rhai::CallFnOptions::new().eval_ast(false);
        let output: Dynamic = self
            .engine
            .call_fn_with_options(options, scope, ast, name, (arg,))
            .map_err(|err| script_failed(err, &run.script_path, "entry-point"))?;

        match dynamic_to_json(&output)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(Error::new(ErrorKind::ScriptFailed)
                .with_message(format!(
                    "entry point {name:?} must return a map of named outputs, got {}",
                    json_type_name(&other)
                ))
                .with_path(&run.script_path)
                .with_stage("entry-point")),
        }
    }
}

pub(crate) fn script_failed(
    err: Box<EvalAltResult>,
    path: &Path,
    stage: &'static str,
) -> Error {
    Error::new(ErrorKind::ScriptFailed)
        .with_message(err.to_string())
        .with_path(path)
        .with_stage(stage)
}

pub(crate) fn json_to_dynamic(value: &Value) -> Result<Dynamic, Error> {
    to_dynamic(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to marshal input value: {err}"))
            .with_stage("marshal")
    })
}

pub(crate) fn dynamic_to_json(value: &Dynamic) -> Result<Value, Error> {
    from_dynamic(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to marshal output value: {err}"))
            .with_stage("marshal")
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a map",
    }
}

#[cfg(test)]
mod tests {
    use super::{Marshaller, OutputPolicy, ScriptRun, build_engine};
    use crate::core::cache::ExecutionCache;
    use crate::core::error::ErrorKind;
    use crate::core::path_guard::PathGuard;
    use crate::core::resolver::SearchPaths;
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    fn marshaller() -> (Marshaller, Arc<ExecutionCache>) {
        let cache = Arc::new(ExecutionCache::new());
        let paths = SearchPaths::new(Arc::new(PathGuard::new(Vec::new())));
        (
            Marshaller::new(build_engine(paths, cache.clone())),
            cache,
        )
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create script");
        file.write_all(body.as_bytes()).expect("write script");
        path
    }

    fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn declared_outputs_copy_bound_names_and_omit_unbound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            "sum.rhai",
            "let total = a + b;\nlet untouched_input = a;\n",
        );
        let (marshaller, _cache) = marshaller();
        let outputs = marshaller
            .execute(&ScriptRun {
                script_path: script,
                inputs: inputs(&[("a", json!(2)), ("b", json!(40))]),
                policy: OutputPolicy::Declared(vec![
                    "total".to_string(),
                    "never_bound".to_string(),
                ]),
            })
            .expect("execute");
        assert_eq!(outputs.get("total"), Some(&json!(42)));
        assert!(!outputs.contains_key("never_bound"));
    }

    #[test]
    fn log_ratio_script_matches_expected_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            "logratio.rhai",
            r#"
let lnI0It = [];
for i in 0..I0.len() {
    lnI0It.push(ln(I0[i] / It[i]));
}
"#,
        );
        let (marshaller, _cache) = marshaller();
        let outputs = marshaller
            .execute(&ScriptRun {
                script_path: script,
                inputs: inputs(&[
                    ("I0", json!([10.0, 20.0])),
                    ("It", json!([5.0, 10.0])),
                ]),
                policy: OutputPolicy::Declared(vec!["lnI0It".to_string()]),
            })
            .expect("execute");
        let values = outputs
            .get("lnI0It")
            .and_then(Value::as_array)
            .expect("array output");
        let expected = 2.0_f64.ln();
        for value in values {
            let got = value.as_f64().expect("float");
            assert!((got - expected).abs() < 1e-12, "got {got}");
        }
    }

    #[test]
    fn entry_point_mode_returns_function_result_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            "entry.rhai",
            "fn run(inputs) {\n    #{ total: inputs.a + inputs.b, echo: inputs.a }\n}\n",
        );
        let (marshaller, _cache) = marshaller();
        let outputs = marshaller
            .execute(&ScriptRun {
                script_path: script,
                inputs: inputs(&[("a", json!(1)), ("b", json!(2))]),
                policy: OutputPolicy::EntryPoint("run".to_string()),
            })
            .expect("execute");
        assert_eq!(outputs.get("total"), Some(&json!(3)));
        assert_eq!(outputs.get("echo"), Some(&json!(1)));
    }

    #[test]
    fn missing_entry_point_is_reported_as_such() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "noentry.rhai", "let x = 1;\n");
        let (marshaller, _cache) = marshaller();
        let err = marshaller
            .execute(&ScriptRun {
                script_path: script,
                inputs: BTreeMap::new(),
                policy: OutputPolicy::EntryPoint("run".to_string()),
            })
            .expect_err("missing entry point");
        assert_eq!(err.kind(), ErrorKind::EntryPointMissing);
    }

    #[test]
    fn missing_script_is_script_not_found() {
        let (marshaller, _cache) = marshaller();
        let err = marshaller
            .execute(&ScriptRun {
                script_path: PathBuf::from("/nonexistent/script.rhai"),
                inputs: BTreeMap::new(),
                policy: OutputPolicy::Declared(Vec::new()),
            })
            .expect_err("missing script");
        assert_eq!(err.kind(), ErrorKind::ScriptNotFound);
    }

    #[test]
    fn script_error_propagates_with_original_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            "boom.rhai",
            "throw \"calibration out of range\";\n",
        );
        let (marshaller, _cache) = marshaller();
        let err = marshaller
            .execute(&ScriptRun {
                script_path: script,
                inputs: BTreeMap::new(),
                policy: OutputPolicy::Declared(Vec::new()),
            })
            .expect_err("script throws");
        assert_eq!(err.kind(), ErrorKind::ScriptFailed);
        assert!(
            err.message()
                .unwrap_or_default()
                .contains("calibration out of range")
        );
    }

    #[test]
    fn marker_constants_are_visible_to_scripts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            "markers.rhai",
            "let where_am_i = SCRIPT_FILE;\nlet func = RUN_FUNC_NAME;\n",
        );
        let (marshaller, _cache) = marshaller();
        let outputs = marshaller
            .execute(&ScriptRun {
                script_path: script.clone(),
                inputs: BTreeMap::new(),
                policy: OutputPolicy::Declared(vec![
                    "where_am_i".to_string(),
                    "func".to_string(),
                ]),
            })
            .expect("execute");
        assert_eq!(
            outputs.get("where_am_i"),
            Some(&json!(script.to_string_lossy()))
        );
        assert_eq!(outputs.get("func"), Some(&json!("")));
    }

    #[test]
    fn state_functions_persist_values_across_invocations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            "counter.rhai",
            r#"
if !state_has("count") {
    state_set("count", 0);
}
state_set("count", state_get("count") + 1);
let count = state_get("count");
"#,
        );
        let (marshaller, cache) = marshaller();
        let run = ScriptRun {
            script_path: script,
            inputs: BTreeMap::new(),
            policy: OutputPolicy::Declared(vec!["count".to_string()]),
        };
        assert_eq!(
            marshaller.execute(&run).expect("first").get("count"),
            Some(&json!(1))
        );
        assert_eq!(
            marshaller.execute(&run).expect("second").get("count"),
            Some(&json!(2))
        );
        cache.clear();
        assert_eq!(
            marshaller.execute(&run).expect("after clear").get("count"),
            Some(&json!(1))
        );
    }
}
