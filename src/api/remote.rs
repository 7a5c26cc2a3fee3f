//! Purpose: HTTP client for the worker's v0 protocol.
//! Exports: `RemoteWorker`.
//! Role: Mirrors the local dispatcher's operations against a running server;
//! the CLI and integration tests call through here.
//! Invariants: Error envelopes decode back into the same `ErrorKind` the
//! server reported.
#![allow(clippy::result_large_err)]

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use super::{
    ErrorEnvelope, ExternalJobParams, PluginInfoParams, PluginInfoReply, PluginNameParams,
    ResultEnvelope, RunPluginParams, RunScriptParams,
};
use crate::core::error::{Error, ErrorKind};

type ApiResult<T> = Result<T, Error>;

#[derive(Clone)]
pub struct RemoteWorker {
    base_url: Url,
    agent: ureq::Agent,
}

impl RemoteWorker {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            agent: ureq::AgentBuilder::new().build(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn is_active(&self) -> ApiResult<bool> {
        self.call("isActive", &())
    }

    pub fn run_script(&self, params: &RunScriptParams) -> ApiResult<BTreeMap<String, Value>> {
        self.call("runScript", params)
    }

    pub fn run_plugin(&self, params: &RunPluginParams) -> ApiResult<BTreeMap<String, Value>> {
        self.call("runSavu", params)
    }

    pub fn output_rank(&self, params: &RunPluginParams) -> ApiResult<i64> {
        self.call("getOutputRank", params)
    }

    pub fn populate_plugins(&self) -> ApiResult<Vec<String>> {
        self.call("populatePlugins", &())
    }

    pub fn plugin_info(&self, name: Option<&str>) -> ApiResult<BTreeMap<String, PluginInfoReply>> {
        self.call(
            "getPluginInfo",
            &PluginInfoParams {
                name: name.map(str::to_string),
            },
        )
    }

    pub fn plugin_params(&self, name: &str) -> ApiResult<BTreeMap<String, Value>> {
        self.call(
            "getPluginParams",
            &PluginNameParams {
                name: name.to_string(),
            },
        )
    }

    pub fn clear_cache(&self) -> ApiResult<bool> {
        self.call("clearCache", &())
    }

    pub fn run_external(&self, params: &ExternalJobParams) -> ApiResult<String> {
        self.call("runEdnaPlugin", params)
    }

    fn call<T, R>(&self, operation: &str, body: &T) -> ApiResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let url = build_url(&self.base_url, operation)?;
        let payload = serde_json::to_string(body).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode request json")
                .with_source(err)
        })?;
        let response = self
            .agent
            .request("POST", url.as_str())
            .set("Accept", "application/json")
            .set("Content-Type", "application/json")
            .send_string(&payload);

        match response {
            Ok(resp) => {
                let envelope: ResultEnvelope<R> = read_json_response(resp)?;
                Ok(envelope.result)
            }
            Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
                .with_message("request failed")
                .with_source(err)),
        }
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid remote base url")
            .with_source(err)
    })?;
    if url.scheme() != "http" {
        return Err(
            Error::new(ErrorKind::Usage).with_message("remote base url must use http scheme")
        );
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("remote base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, operation: &str) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("remote base url cannot be a base")
        })?;
        path.clear();
        path.push("v0");
        path.push(operation);
    }
    Ok(url)
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return Error::from(envelope.error);
    }
    Error::new(ErrorKind::Internal).with_message(format!("remote error status {status}"))
}
