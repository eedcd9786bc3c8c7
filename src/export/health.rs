use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::event::EventKey;
use crate::repository::EventRepository;

const NAMESPACE: &str = "yunikorn_history";

/// Prometheus metrics for collector health.
///
/// All metrics use the "yunikorn_history" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Stream ===
    /// Records decoded from the event stream.
    pub events_received: Counter,
    /// Records by event type and change type.
    pub events_by_type: CounterVec,
    /// Stream lines that failed to decode.
    pub decode_errors: Counter,
    /// Handler invocations that returned an error.
    pub handler_errors: Counter,
    /// Reconnect attempts after a failed or ended stream.
    pub stream_reconnects: Counter,
    /// Whether the event stream is open (1=yes, 0=no).
    pub stream_connected: Gauge,
    /// Dispatcher state, see `ServiceState::as_gauge`.
    pub service_state: Gauge,
    /// Time from decode to handler completion for one record.
    pub event_processing_duration: Histogram,

    // === Persistence ===
    /// Durable repository call duration by operation.
    pub repository_op_duration: HistogramVec,
    /// Durable repository failures by operation.
    pub repository_errors: CounterVec,
    /// Completed history rollups.
    pub history_rollups: Counter,

    // === Scheduler API ===
    /// Scheduler REST requests by endpoint and status.
    pub api_requests_total: CounterVec,
    /// Scheduler REST request duration by endpoint.
    pub api_request_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total records decoded from the event stream.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_by_type = CounterVec::new(
            Opts::new(
                "events_by_type_total",
                "Total records by event type and change type.",
            )
            .namespace(NAMESPACE),
            &["type", "change_type"],
        )?;
        let decode_errors = Counter::with_opts(
            Opts::new(
                "decode_errors_total",
                "Total stream lines that failed to decode.",
            )
            .namespace(NAMESPACE),
        )?;
        let handler_errors = Counter::with_opts(
            Opts::new(
                "handler_errors_total",
                "Total records whose handler returned an error.",
            )
            .namespace(NAMESPACE),
        )?;
        let stream_reconnects = Counter::with_opts(
            Opts::new(
                "stream_reconnects_total",
                "Total event stream reconnect attempts.",
            )
            .namespace(NAMESPACE),
        )?;
        let stream_connected = Gauge::with_opts(
            Opts::new(
                "stream_connected",
                "Whether the event stream is open (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let service_state = Gauge::with_opts(
            Opts::new(
                "service_state",
                "Dispatcher state (0=idle 1=connecting 2=streaming 3=reconnecting 4=draining 5=stopped).",
            )
            .namespace(NAMESPACE),
        )?;
        let event_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "event_processing_duration_seconds",
                "Time to count and handle a single record.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let repository_op_duration = HistogramVec::new(
            HistogramOpts::new(
                "repository_op_duration_seconds",
                "Durable repository call duration by operation.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["op"],
        )?;
        let repository_errors = CounterVec::new(
            Opts::new(
                "repository_errors_total",
                "Total durable repository failures by operation.",
            )
            .namespace(NAMESPACE),
            &["op"],
        )?;
        let history_rollups = Counter::with_opts(
            Opts::new("history_rollups_total", "Total completed history rollups.")
                .namespace(NAMESPACE),
        )?;
        let api_requests_total = CounterVec::new(
            Opts::new(
                "api_requests_total",
                "Total scheduler REST requests by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let api_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "api_request_duration_seconds",
                "Scheduler REST request duration by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["endpoint"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_by_type.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(handler_errors.clone()))?;
        registry.register(Box::new(stream_reconnects.clone()))?;
        registry.register(Box::new(stream_connected.clone()))?;
        registry.register(Box::new(service_state.clone()))?;
        registry.register(Box::new(event_processing_duration.clone()))?;
        registry.register(Box::new(repository_op_duration.clone()))?;
        registry.register(Box::new(repository_errors.clone()))?;
        registry.register(Box::new(history_rollups.clone()))?;
        registry.register(Box::new(api_requests_total.clone()))?;
        registry.register(Box::new(api_request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_by_type,
            decode_errors,
            handler_errors,
            stream_reconnects,
            stream_connected,
            service_state,
            event_processing_duration,
            repository_op_duration,
            repository_errors,
            history_rollups,
            api_requests_total,
            api_request_duration,
        })
    }

    /// Counts one decoded record.
    pub fn record_event(&self, key: &EventKey) {
        self.events_received.inc();
        self.events_by_type
            .with_label_values(&[key.event_type.as_str(), key.change_type.as_str()])
            .inc();
    }

    /// Records one durable repository call.
    pub fn record_repository_op(&self, op: &str, ok: bool, duration: Duration) {
        self.repository_op_duration
            .with_label_values(&[op])
            .observe(duration.as_secs_f64());
        if !ok {
            self.repository_errors.with_label_values(&[op]).inc();
        }
    }

    /// Records one scheduler REST request.
    pub fn record_api_request(&self, endpoint: &str, status: &str, duration: Duration) {
        self.api_requests_total
            .with_label_values(&[endpoint, status])
            .inc();
        self.api_request_duration
            .with_label_values(&[endpoint])
            .observe(duration.as_secs_f64());
    }

    /// Text exposition of every registered metric.
    pub fn gather_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics, /healthz and /events/counts.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the port is 0.
    pub async fn start(&self, events: Arc<dyn EventRepository>) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            events,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/events/counts", get(counts_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    events: Arc<dyn EventRepository>,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /events/counts - snapshot of the event repository as JSON.
async fn counts_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.events.counts() {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "reading event counts");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
