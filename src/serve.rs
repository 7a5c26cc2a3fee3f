//! Purpose: HTTP surface for the worker's v0 protocol.
//! Exports: `ServeConfig`, `serve`.
//! Role: Maps POST /v0/<operation> requests onto the dispatcher and renders
//! result/error envelopes.
//! Invariants: Binds loopback-only unless explicitly overridden.
//! Invariants: Worker operations run on the blocking pool; the async runtime
//! never executes script code.
#![allow(clippy::result_large_err)]

use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::api::{
    ErrorEnvelope, ExternalJobParams, PluginInfoParams, PluginInfoReply, PluginNameParams,
    ResultEnvelope, RunPluginParams, RunScriptParams, WireError,
};
use crate::core::dispatch::{Worker, WorkerConfig};
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub allow_non_loopback: bool,
    pub worker: WorkerConfig,
}

struct AppState {
    worker: Worker,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let state = Arc::new(AppState {
        worker: Worker::new(config.worker),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/isActive", post(is_active))
        .route("/v0/runScript", post(run_script))
        .route("/v0/runSavu", post(run_plugin))
        .route("/v0/getOutputRank", post(get_output_rank))
        .route("/v0/populatePlugins", post(populate_plugins))
        .route("/v0/getPluginInfo", post(get_plugin_info))
        .route("/v0/getPluginParams", post(get_plugin_params))
        .route("/v0/clearCache", post(clear_cache))
        .route("/v0/runEdnaPlugin", post(run_edna_plugin))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(bind = %config.bind, "worker listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        signal.recv().await;
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn is_active(State(state): State<Arc<AppState>>) -> Response {
    result_response(state.worker.is_active())
}

async fn run_script(
    State(state): State<Arc<AppState>>,
    Json(params): Json<RunScriptParams>,
) -> Response {
    blocking(state, move |worker| worker.run_script(&params.into())).await
}

async fn run_plugin(
    State(state): State<Arc<AppState>>,
    Json(params): Json<RunPluginParams>,
) -> Response {
    blocking(state, move |worker| worker.run_plugin(&params.into())).await
}

async fn get_output_rank(
    State(state): State<Arc<AppState>>,
    Json(params): Json<RunPluginParams>,
) -> Response {
    blocking(state, move |worker| worker.output_rank(&params.into())).await
}

async fn populate_plugins(State(state): State<Arc<AppState>>) -> Response {
    blocking(state, |worker| worker.populate_plugins()).await
}

async fn get_plugin_info(
    State(state): State<Arc<AppState>>,
    Json(params): Json<PluginInfoParams>,
) -> Response {
    blocking(state, move |worker| {
        let entries = worker.plugin_info(params.name.as_deref())?;
        Ok(entries
            .into_iter()
            .map(|(name, entry)| (name, PluginInfoReply::from(entry)))
            .collect::<BTreeMap<String, PluginInfoReply>>())
    })
    .await
}

async fn get_plugin_params(
    State(state): State<Arc<AppState>>,
    Json(params): Json<PluginNameParams>,
) -> Response {
    blocking(state, move |worker| worker.plugin_params(&params.name)).await
}

async fn clear_cache(State(state): State<Arc<AppState>>) -> Response {
    state.worker.clear_cache();
    result_response(true)
}

async fn run_edna_plugin(
    State(state): State<Arc<AppState>>,
    Json(params): Json<ExternalJobParams>,
) -> Response {
    blocking(state, move |worker| worker.run_external(&params.into())).await
}

/// Runs one worker operation on the blocking pool and renders the envelope.
async fn blocking<T, F>(state: Arc<AppState>, op: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&Worker) -> Result<T, Error> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || op(&state.worker)).await {
        Ok(Ok(value)) => result_response(value),
        Ok(Err(err)) => error_response(err),
        Err(err) => error_response(
            Error::new(ErrorKind::Internal)
                .with_message("worker task failed")
                .with_source(err),
        ),
    }
}

fn result_response<T: Serialize>(result: T) -> Response {
    let mut response = Json(ResultEnvelope { result }).into_response();
    response
        .headers_mut()
        .insert("scriptworker-version", HeaderValue::from_static("0"));
    response
}

fn json_response(payload: serde_json::Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("scriptworker-version", HeaderValue::from_static("0"));
    response
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::ScriptNotFound => StatusCode::NOT_FOUND,
        ErrorKind::PathRace => StatusCode::CONFLICT,
        ErrorKind::EntryPointMissing | ErrorKind::ScriptFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ExternalJob => StatusCode::BAD_GATEWAY,
        ErrorKind::Configuration | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let body = ErrorEnvelope {
        error: WireError::from(&err),
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("scriptworker-version", HeaderValue::from_static("0"));
    response
}
