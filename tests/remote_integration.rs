//! Purpose: End-to-end tests for the worker HTTP/JSON server and client.
//! Exports: None (integration test module).
//! Role: Validate script runs, plugin runs, registry queries, and error
//! propagation across TCP.
//! Invariants: Uses a loopback-only server with temp script directories.
//! Invariants: Server processes are cleaned up on drop.

use scriptworker::api::remote::RemoteWorker;
use scriptworker::api::{RunPluginParams, RunScriptParams};
use scriptworker::core::error::ErrorKind;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

struct TestServer {
    child: Child,
    base_url: String,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start() -> TestResult<Self> {
        Self::start_with_options(None)
    }

    fn start_with_plugin_dir(plugin_dir: &Path) -> TestResult<Self> {
        Self::start_with_options(Some(plugin_dir))
    }

    fn start_with_options(plugin_dir: Option<&Path>) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let base_url = format!("http://{bind}");

            let mut command = Command::new(env!("CARGO_BIN_EXE_scriptworker"));
            command
                .arg("serve")
                .arg("--bind")
                .arg(&bind)
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
            if let Some(plugin_dir) = plugin_dir {
                command.arg("--plugin-dir").arg(plugin_dir);
            }
            let mut child = command.spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url,
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn client(&self) -> TestResult<RemoteWorker> {
        Ok(RemoteWorker::new(self.base_url.clone())?)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    let url = format!("http://{addr}/healthz");
    let start = Instant::now();
    loop {
        if let Ok(resp) = ureq::get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            return Err(format!(
                "server exited before ready (status: {status}, stderr: {})",
                if detail.is_empty() { "<empty>" } else { detail }
            )
            .into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}

fn write_file(dir: &Path, name: &str, body: &str) -> TestResult<PathBuf> {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path)?;
    file.write_all(body.as_bytes())?;
    Ok(path)
}

fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

#[test]
fn is_active_reports_ready() -> TestResult<()> {
    let server = TestServer::start()?;
    assert!(server.client()?.is_active()?);
    Ok(())
}

#[test]
fn run_script_collects_declared_outputs() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let script = write_file(
        dir.path(),
        "logratio.rhai",
        r#"
let lnI0It = [];
for i in 0..I0.len() {
    lnI0It.push(ln(I0[i] / It[i]));
}
"#,
    )?;
    let server = TestServer::start()?;
    let outputs = server.client()?.run_script(&RunScriptParams {
        script_path: script,
        inputs: inputs(&[("I0", json!([10.0, 20.0])), ("It", json!([5.0, 10.0]))]),
        outputs: vec!["lnI0It".to_string(), "never_bound".to_string()],
        ..RunScriptParams::default()
    })?;

    let values = outputs
        .get("lnI0It")
        .and_then(Value::as_array)
        .ok_or("missing lnI0It")?;
    let expected = 2.0_f64.ln();
    for value in values {
        let got = value.as_f64().ok_or("not a float")?;
        assert!((got - expected).abs() < 1e-12, "got {got}");
    }
    assert!(!outputs.contains_key("never_bound"));
    Ok(())
}

#[test]
fn run_script_entry_point_mode() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let script = write_file(
        dir.path(),
        "entry.rhai",
        "fn run(inputs) {\n    #{ total: inputs.a + inputs.b }\n}\n",
    )?;
    let server = TestServer::start()?;
    let outputs = server.client()?.run_script(&RunScriptParams {
        script_path: script,
        inputs: inputs(&[("a", json!(2)), ("b", json!(40))]),
        func_name: Some("run".to_string()),
        ..RunScriptParams::default()
    })?;
    assert_eq!(outputs.get("total"), Some(&json!(42)));
    Ok(())
}

#[test]
fn missing_script_propagates_script_not_found() -> TestResult<()> {
    let server = TestServer::start()?;
    let err = server
        .client()?
        .run_script(&RunScriptParams {
            script_path: PathBuf::from("/nonexistent/script.rhai"),
            ..RunScriptParams::default()
        })
        .expect_err("missing script");
    assert_eq!(err.kind(), ErrorKind::ScriptNotFound);
    Ok(())
}

#[test]
fn missing_entry_point_propagates_as_such() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let script = write_file(dir.path(), "noentry.rhai", "let x = 1;\n")?;
    let server = TestServer::start()?;
    let err = server
        .client()?
        .run_script(&RunScriptParams {
            script_path: script,
            func_name: Some("run".to_string()),
            ..RunScriptParams::default()
        })
        .expect_err("no entry point");
    assert_eq!(err.kind(), ErrorKind::EntryPointMissing);
    Ok(())
}

#[test]
fn script_failure_carries_the_original_message() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let script = write_file(dir.path(), "boom.rhai", "throw \"detector offline\";\n")?;
    let server = TestServer::start()?;
    let err = server
        .client()?
        .run_script(&RunScriptParams {
            script_path: script,
            ..RunScriptParams::default()
        })
        .expect_err("script throws");
    assert_eq!(err.kind(), ErrorKind::ScriptFailed);
    assert!(
        err.message()
            .unwrap_or_default()
            .contains("detector offline")
    );
    Ok(())
}

#[test]
fn second_script_directory_is_a_path_race() -> TestResult<()> {
    let first = tempfile::tempdir()?;
    let second = tempfile::tempdir()?;
    let script_a = write_file(first.path(), "a.rhai", "let x = 1;\n")?;
    let script_b = write_file(second.path(), "b.rhai", "let x = 1;\n")?;
    let server = TestServer::start()?;
    let client = server.client()?;

    client.run_script(&RunScriptParams {
        script_path: script_a,
        outputs: vec!["x".to_string()],
        ..RunScriptParams::default()
    })?;
    let err = client
        .run_script(&RunScriptParams {
            script_path: script_b,
            outputs: vec!["x".to_string()],
            ..RunScriptParams::default()
        })
        .expect_err("race");
    assert_eq!(err.kind(), ErrorKind::PathRace);
    Ok(())
}

#[test]
fn state_persists_until_cache_is_cleared() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let script = write_file(
        dir.path(),
        "counter.rhai",
        r#"
if !state_has("count") {
    state_set("count", 0);
}
state_set("count", state_get("count") + 1);
let count = state_get("count");
"#,
    )?;
    let server = TestServer::start()?;
    let client = server.client()?;
    let params = RunScriptParams {
        script_path: script,
        outputs: vec!["count".to_string()],
        ..RunScriptParams::default()
    };

    assert_eq!(client.run_script(&params)?.get("count"), Some(&json!(1)));
    assert_eq!(client.run_script(&params)?.get("count"), Some(&json!(2)));
    assert!(client.clear_cache()?);
    assert_eq!(client.run_script(&params)?.get("count"), Some(&json!(1)));
    Ok(())
}

const SCALER: &str = r#"
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
fn plugin_run_frames_numeric_axes() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let plugin = write_file(dir.path(), "scaler.rhai", SCALER)?;
    let server = TestServer::start()?;
    let framed = server.client()?.run_plugin(&RunPluginParams {
        plugin_path: plugin,
        inputs: inputs(&[("data", json!([1.0, 2.0, 3.0]))]),
        ..RunPluginParams::default()
    })?;
    assert_eq!(framed.get("data"), Some(&json!([2.0, 4.0, 6.0])));
    assert_eq!(framed.get("xaxis"), Some(&json!([1.0, 2.0, 3.0])));
    assert_eq!(framed.get("xaxis_title"), Some(&json!("energy")));
    Ok(())
}

#[test]
fn plugin_run_meta_only_skips_processing() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let plugin = write_file(dir.path(), "scaler.rhai", SCALER)?;
    let server = TestServer::start()?;
    let framed = server.client()?.run_plugin(&RunPluginParams {
        plugin_path: plugin,
        meta_only: true,
        ..RunPluginParams::default()
    })?;
    assert!(!framed.contains_key("data"));
    assert_eq!(framed.get("xaxis_title"), Some(&json!("energy")));
    Ok(())
}

#[test]
fn plugin_run_string_axis_builds_auxiliary() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let plugin = write_file(
        dir.path(),
        "elements.rhai",
        r#"
fn filter_frames(data) {
    [data[0] + data[1], data[0] - data[1]]
}
fn axis_labels() { ["element"] }
fn axis_values(label) { ["Fe", "Cu"] }
"#,
    )?;
    let server = TestServer::start()?;
    let framed = server.client()?.run_plugin(&RunPluginParams {
        plugin_path: plugin,
        inputs: inputs(&[("data", json!([10.0, 4.0]))]),
        ..RunPluginParams::default()
    })?;
    assert_eq!(framed.get("data"), Some(&json!([10.0, 4.0])));
    assert_eq!(
        framed.get("auxiliary"),
        Some(&json!({ "Fe": 14.0, "Cu": 6.0 }))
    );
    Ok(())
}

#[test]
fn output_rank_reports_the_plugin_declaration() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let plugin = write_file(
        dir.path(),
        "ranked.rhai",
        "fn filter_frames(data) { data }\nfn output_rank() { 2 }\n",
    )?;
    let server = TestServer::start()?;
    let rank = server.client()?.output_rank(&RunPluginParams {
        plugin_path: plugin,
        ..RunPluginParams::default()
    })?;
    assert_eq!(rank, 2);
    Ok(())
}

#[test]
fn registry_operations_list_and_describe_plugins() -> TestResult<()> {
    let plugins = tempfile::tempdir()?;
    write_file(
        plugins.path(),
        "median.rhai",
        "fn parameters() { #{ window: 5 } }\nfn filter_frames(data) { data }\n",
    )?;
    write_file(plugins.path(), "helper.rhai", "fn smooth(data) { data }\n")?;
    let server = TestServer::start_with_plugin_dir(plugins.path())?;
    let client = server.client()?;

    assert_eq!(client.populate_plugins()?, vec!["median".to_string()]);
    let info = client.plugin_info(Some("median"))?;
    assert_eq!(
        info["median"].functions,
        vec!["filter_frames".to_string(), "parameters".to_string()]
    );
    let all = client.plugin_info(None)?;
    assert_eq!(all.keys().collect::<Vec<_>>(), vec!["median"]);
    let params = client.plugin_params("median")?;
    assert_eq!(params.get("window"), Some(&json!(5)));

    let err = client
        .plugin_info(Some("missing"))
        .expect_err("unknown plugin");
    assert_eq!(err.kind(), ErrorKind::ScriptNotFound);
    Ok(())
}

#[test]
fn registry_without_a_directory_is_a_configuration_error() -> TestResult<()> {
    let server = TestServer::start()?;
    let err = server
        .client()?
        .populate_plugins()
        .expect_err("no plugin dir");
    assert_eq!(err.kind(), ErrorKind::Configuration);
    Ok(())
}
