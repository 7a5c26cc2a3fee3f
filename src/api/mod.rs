//! Purpose: Wire types for the worker's v0 JSON protocol.
//! Exports: request/reply DTOs, `ResultEnvelope`, `ErrorEnvelope`, error-kind
//! string mapping.
//! Role: Shared by the HTTP surface and the remote client so both sides agree
//! on field names and error rendering.
//! Invariants: Error kinds cross the wire as their stable names; unknown kinds
//! decode as `Internal`.

pub mod remote;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::dispatch::{RunPluginRequest, RunScriptRequest};
use crate::core::error::{Error, ErrorKind};
use crate::core::external::ExternalJobRequest;
use crate::core::registry::PluginEntry;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunScriptParams {
    pub script_path: PathBuf,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: Vec<String>,
    pub func_name: Option<String>,
    pub additional_paths: Vec<PathBuf>,
}

impl From<RunScriptParams> for RunScriptRequest {
    fn from(params: RunScriptParams) -> Self {
        Self {
            script_path: params.script_path,
            inputs: params.inputs,
            outputs: params.outputs,
            func_name: params.func_name,
            additional_paths: params.additional_paths,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunPluginParams {
    pub plugin_path: PathBuf,
    pub params: BTreeMap<String, Value>,
    pub inputs: BTreeMap<String, Value>,
    pub meta_only: bool,
}

impl From<RunPluginParams> for RunPluginRequest {
    fn from(params: RunPluginParams) -> Self {
        Self {
            plugin_path: params.plugin_path,
            params: params.params,
            inputs: params.inputs,
            meta_only: params.meta_only,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PluginNameParams {
    pub name: String,
}

/// `getPluginInfo` takes an optional name; without one it reports every
/// known plugin.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PluginInfoParams {
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalJobParams {
    pub plugin_name: String,
    pub input: String,
    pub exec_path: PathBuf,
    pub is_debug: bool,
}

impl From<ExternalJobParams> for ExternalJobRequest {
    fn from(params: ExternalJobParams) -> Self {
        Self {
            plugin_name: params.plugin_name,
            input: params.input,
            exec_dir: params.exec_path,
            debug: params.is_debug,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PluginInfoReply {
    pub path: PathBuf,
    pub functions: Vec<String>,
}

impl From<PluginEntry> for PluginInfoReply {
    fn from(entry: PluginEntry) -> Self {
        Self {
            path: entry.path,
            functions: entry.functions,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResultEnvelope<T> {
    pub result: T,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorEnvelope {
    pub error: WireError,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WireError {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        Self {
            kind: kind_name(err.kind()).to_string(),
            message: err.message().map(str::to_string),
            hint: err.hint().map(str::to_string),
            path: err.path().map(|path| path.display().to_string()),
            stage: err.stage().map(str::to_string),
        }
    }
}

impl From<WireError> for Error {
    fn from(wire: WireError) -> Self {
        let mut err = Error::new(parse_kind_name(&wire.kind));
        if let Some(message) = wire.message {
            err = err.with_message(message);
        }
        if let Some(hint) = wire.hint {
            err = err.with_hint(hint);
        }
        if let Some(path) = wire.path {
            err = err.with_path(path);
        }
        if let Some(stage) = wire.stage {
            err = err.with_stage(stage);
        }
        err
    }
}

pub fn kind_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Internal => "Internal",
        ErrorKind::Usage => "Usage",
        ErrorKind::ScriptNotFound => "ScriptNotFound",
        ErrorKind::PathRace => "PathRace",
        ErrorKind::EntryPointMissing => "EntryPointMissing",
        ErrorKind::ScriptFailed => "ScriptFailed",
        ErrorKind::Configuration => "Configuration",
        ErrorKind::ExternalJob => "ExternalJob",
        ErrorKind::Io => "Io",
    }
}

pub fn parse_kind_name(kind: &str) -> ErrorKind {
    match kind {
        "Usage" => ErrorKind::Usage,
        "ScriptNotFound" => ErrorKind::ScriptNotFound,
        "PathRace" => ErrorKind::PathRace,
        "EntryPointMissing" => ErrorKind::EntryPointMissing,
        "ScriptFailed" => ErrorKind::ScriptFailed,
        "Configuration" => ErrorKind::Configuration,
        "ExternalJob" => ErrorKind::ExternalJob,
        "Io" => ErrorKind::Io,
        _ => ErrorKind::Internal,
    }
}
