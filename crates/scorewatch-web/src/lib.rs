//! Axum + Askama dashboard: diff log chart and status endpoint.

use std::future::Future;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use scorewatch_core::DiffLogEntry;
use scorewatch_storage::ScoreStore;
use scorewatch_sync::{interval_label, ThresholdSource, DEFAULT_INTERVAL_MINUTES};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "scorewatch-web";

pub const THRESHOLD_NOT_SET: &str = "not set";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ScoreStore>,
    pub threshold: Arc<dyn ThresholdSource>,
    pub interval: String,
}

impl AppState {
    pub fn new(store: Arc<dyn ScoreStore>, threshold: Arc<dyn ThresholdSource>) -> Self {
        Self {
            store,
            threshold,
            interval: interval_label(DEFAULT_INTERVAL_MINUTES),
        }
    }

    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = interval.into();
        self
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct ChartTemplate {
    labels_json: String,
    values_json: String,
    entry_count: usize,
    latest_label: String,
    interval: String,
}

impl ChartTemplate {
    fn from_log(log: &[DiffLogEntry], interval: &str) -> Self {
        let labels = log.iter().map(|e| e.timestamp.as_str()).collect::<Vec<_>>();
        let values = log.iter().map(|e| e.total_diff).collect::<Vec<_>>();
        Self {
            labels_json: script_json(&serde_json::json!(labels)),
            values_json: script_json(&serde_json::json!(values)),
            entry_count: log.len(),
            latest_label: log
                .last()
                .map(|e| format!("{} at {}", e.total_diff, e.timestamp))
                .unwrap_or_else(|| "n/a".into()),
            interval: interval.to_string(),
        }
    }
}

/// JSON safe to inline inside a `<script>` block.
fn script_json(value: &serde_json::Value) -> String {
    value.to_string().replace('<', "\\u003c")
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "dashboard listening");
    }
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    Ok(TcpListener::bind(("0.0.0.0", port)).await?)
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let log = match state.store.read_log().await {
        Ok(log) => log,
        Err(err) => {
            warn!("diff log unavailable, rendering empty chart: {err}");
            Vec::new()
        }
    };
    render_html(ChartTemplate::from_log(&log, &state.interval))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let threshold = state
        .threshold
        .raw()
        .unwrap_or_else(|| THRESHOLD_NOT_SET.to_string());
    Json(serde_json::json!({
        "status": "running",
        "interval": state.interval,
        "threshold_score": threshold,
    }))
    .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
