//! Forwarding proxy
//!
//! Relays every method on every path to the upstream inference server and
//! returns the upstream response unchanged. `POST /v1/chat/completions`
//! requests that ask for `logprobs` additionally go through the online
//! correlation path:
//!
//! 1. Before forwarding, the current rejection-log entry count is recorded.
//! 2. After the upstream answers, the tail monitor waits for new entries.
//! 3. The response is correlated with those entries and the combined
//!    document is written to the output directory.
//! 4. The artifact path is attached as a response header.
//!
//! Any failure in steps 2-4 is logged and the upstream response is returned
//! as if correlation had never been attempted.
//!
//! ```rust,ignore
//! use gramtrace::config::ProxyConfig;
//! use gramtrace::proxy::serve;
//!
//! serve(ProxyConfig::default()).await?;
//! ```

mod upstream;

pub use upstream::{strip_hop_by_hop, UpstreamClient, UpstreamResponse};

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::correlate::{correlate, ApiResponse, CombinedDocument, RejectionSet};
use crate::error::{Result, TracerError};
use crate::monitor::{CorrelationKey, TailMonitor, TailOutcome};

/// The one endpoint that triggers correlation
pub const CORRELATED_ENDPOINT: &str = "/v1/chat/completions";

/// Largest request body accepted for relaying
pub const MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

/// Suffixes tried before giving up on a free artifact name
const MAX_ARTIFACT_SUFFIX: usize = 1000;

/// Error body for requests the proxy could not relay
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

/// State shared by every request handler
#[derive(Clone)]
pub struct ProxyState {
    config: Arc<ProxyConfig>,
    upstream: UpstreamClient,
    monitor: Arc<TailMonitor>,
}

impl ProxyState {
    /// Build handler state from a validated configuration
    ///
    /// # Errors
    ///
    /// `UpstreamFailure` when the HTTP client cannot be built.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let upstream = UpstreamClient::new(config.upstream_timeout)?;
        let monitor = TailMonitor::new(
            config.rejection_log.clone(),
            config.poll_interval,
            config.monitor_timeout,
        );
        Ok(Self {
            config: Arc::new(config),
            upstream,
            monitor: Arc::new(monitor),
        })
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn correlation_enabled(&self) -> bool {
        self.config.save_combined
    }
}

/// Create the proxy router: every path and method goes to one relay handler
pub fn create_router(state: ProxyState) -> Router {
    Router::new().fallback(relay_handler).with_state(state)
}

/// Bind the configured address and serve until the process is stopped
///
/// # Errors
///
/// `InvalidConfiguration` for bad values, `Io` when the output directory
/// cannot be created or the address cannot be bound.
pub async fn serve(config: ProxyConfig) -> Result<()> {
    config.validate()?;
    std::fs::create_dir_all(&config.output_dir).map_err(|e| {
        TracerError::io(
            format!("Failed to create output directory {}", config.output_dir.display()),
            e,
        )
    })?;
    let addr = config.listen_addr()?;

    info!(%addr, upstream = %config.upstream_url, "starting grammar trace proxy");
    info!(
        rejection_log = %config.rejection_log.display(),
        output_dir = %config.output_dir.display(),
        save_combined = config.save_combined,
        "correlation settings"
    );

    let app = create_router(ProxyState::new(config)?);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| TracerError::io(format!("Failed to bind {addr}"), e))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TracerError::io("Server error", e))
}

/// Whether a request asks for per-token alternatives on the correlated endpoint
#[must_use]
pub fn requests_token_telemetry(method: &Method, path: &str, body: &[u8]) -> bool {
    if *method != Method::POST || path != CORRELATED_ENDPOINT {
        return false;
    }
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("logprobs").map(is_truthy))
        .unwrap_or(false)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// File name for a combined document generated at `now`
///
/// `suffix` 0 is the plain name; any other value disambiguates documents
/// generated within the same millisecond.
#[must_use]
pub fn artifact_name(now: DateTime<Utc>, suffix: usize) -> String {
    let stamp = now.format("%Y%m%d_%H%M%S_%3f");
    if suffix == 0 {
        format!("combined_{stamp}.json")
    } else {
        format!("combined_{stamp}_{suffix}.json")
    }
}

/// Write `combined` to a new file under `output_dir`, never replacing one
///
/// # Errors
///
/// `Io` when serialization or the write fails, or every suffix is taken.
pub fn persist_artifact(
    output_dir: &Path,
    now: DateTime<Utc>,
    combined: &CombinedDocument,
) -> Result<PathBuf> {
    let json = serde_json::to_string_pretty(combined).map_err(|e| TracerError::Io {
        message: format!("Failed to serialize combined document: {e}"),
    })?;

    for suffix in 0..MAX_ARTIFACT_SUFFIX {
        let path = output_dir.join(artifact_name(now, suffix));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(TracerError::io(format!("Failed to create {}", path.display()), e)),
        };
        file.write_all(json.as_bytes())
            .map_err(|e| TracerError::io(format!("Failed to write {}", path.display()), e))?;
        return Ok(path);
    }

    Err(TracerError::Io {
        message: format!("No free artifact name in {}", output_dir.display()),
    })
}

/// Correlate an upstream response with the monitor's outcome
#[must_use]
pub fn build_online_document(
    api: &ApiResponse,
    outcome: &TailOutcome,
    generated_at: DateTime<Utc>,
) -> CombinedDocument {
    let rejections = RejectionSet::new(&outcome.entries, outcome.coverage());
    let mut combined = correlate(api, &rejections);
    combined.metadata.timestamp = Some(generated_at.to_rfc3339());
    combined.metadata.rejection_log_version.clone_from(&outcome.log_version);
    combined.metadata.rejection_log_timestamp.clone_from(&outcome.log_timestamp);
    combined
}

/// Blocking half of the online path: wait for entries, correlate, persist
///
/// # Errors
///
/// `CorrelationFailure` when the response is not a chat completion or the
/// document cannot be written.
pub fn correlate_and_persist(
    monitor: &TailMonitor,
    output_dir: &Path,
    body: &[u8],
    baseline: usize,
) -> Result<PathBuf> {
    let api = ApiResponse::parse_str(&String::from_utf8_lossy(body))
        .map_err(|e| TracerError::CorrelationFailure(e.to_string()))?;

    let outcome = monitor.collect(CorrelationKey::MostRecentTask, baseline);
    debug!(
        status = ?outcome.status,
        entries = outcome.entries.len(),
        polls = outcome.polls,
        "tail monitor finished"
    );

    let now = Utc::now();
    let combined = build_online_document(&api, &outcome, now);
    let path = persist_artifact(output_dir, now, &combined)
        .map_err(|e| TracerError::CorrelationFailure(e.to_string()))?;

    info!(
        path = %path.display(),
        steps = combined.summary.total_steps,
        rejected = combined.summary.rejected_steps,
        "combined document saved"
    );
    Ok(path)
}

fn error_response(err: &TracerError) -> Response {
    let status = match err {
        TracerError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        TracerError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn into_response(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    response
}

async fn relay_handler(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorResponse {
                    error: format!("Failed to read request body: {e}"),
                }),
            )
                .into_response();
        },
    };

    let path = parts.uri.path().to_string();
    let target = state.config.upstream_target(&path, parts.uri.query());
    let correlated = state.correlation_enabled() && requests_token_telemetry(&parts.method, &path, &body);

    let baseline = if correlated {
        let monitor = Arc::clone(&state.monitor);
        tokio::task::spawn_blocking(move || monitor.entry_count())
            .await
            .unwrap_or(0)
    } else {
        0
    };

    debug!(method = %parts.method, %target, correlated, "relaying request");
    let upstream = match state
        .upstream
        .forward(parts.method.clone(), &target, &parts.headers, body)
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(%target, "upstream request failed: {e}");
            return error_response(&e);
        },
    };

    if !(correlated && upstream.status.is_success() && upstream.is_json()) {
        return into_response(upstream);
    }

    let artifact = correlate_blocking(&state, upstream.body.clone(), baseline).await;
    let mut response = into_response(upstream);
    match artifact {
        Ok(path) => attach_artifact_header(&mut response, &state.config.artifact_header, &path),
        Err(e) => warn!("correlation skipped, returning upstream response unchanged: {e}"),
    }
    response
}

/// Run the blocking correlation path on the blocking pool and wait for it
async fn correlate_blocking(state: &ProxyState, body: Bytes, baseline: usize) -> Result<PathBuf> {
    let monitor = Arc::clone(&state.monitor);
    let output_dir = state.config.output_dir.clone();
    tokio::task::spawn_blocking(move || correlate_and_persist(&monitor, &output_dir, &body, baseline))
        .await
        .map_err(|e| TracerError::CorrelationFailure(format!("correlation task failed: {e}")))?
}

fn attach_artifact_header(response: &mut Response, header: &str, path: &Path) {
    let name = HeaderName::from_bytes(header.as_bytes());
    let value = HeaderValue::from_str(&path.display().to_string());
    match (name, value) {
        (Ok(name), Ok(value)) => {
            response.headers_mut().insert(name, value);
        },
        _ => warn!(path = %path.display(), "artifact path is not a valid header value"),
    }
}

#[cfg(test)]
mod tests;
