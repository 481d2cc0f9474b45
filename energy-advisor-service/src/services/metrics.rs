//! Prometheus metrics for energy-advisor-service.
//!
//! Covers the chat endpoint, the streaming relay and the upstream model.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Registry and every collector, registered together.
pub struct Metrics {
    pub registry: Registry,
    pub chat_requests_total: IntCounterVec,
    pub relay_fragments_total: IntCounter,
    pub relay_bytes_total: IntCounter,
    pub relays_in_flight: IntGauge,
    pub relay_duration_seconds: HistogramVec,
    pub upstream_open_latency_seconds: HistogramVec,
    pub upstream_errors_total: IntCounterVec,
    pub genai_tokens_total: IntCounterVec,
}

// `None` when registration failed; recording is then a no-op.
static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once and from several
/// threads; exactly one registry is ever built.
pub fn init_metrics() {
    METRICS.get_or_init(|| match build_metrics() {
        Ok(metrics) => {
            tracing::info!("Prometheus metrics initialized");
            Some(metrics)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize Prometheus metrics");
            None
        }
    });
}

/// Collectors only record once `init_metrics` has run.
fn initialized() -> Option<&'static Metrics> {
    METRICS.get().and_then(Option::as_ref)
}

fn build_metrics() -> Result<Metrics, prometheus::Error> {
    let registry = Registry::new();

    let chat_requests_total = IntCounterVec::new(
        Opts::new("chat_requests_total", "Total chat requests by outcome"),
        &["outcome"], // accepted, invalid, upstream_failed
    )?;

    let relay_fragments_total = IntCounter::new(
        "relay_fragments_total",
        "Text fragments forwarded to clients",
    )?;

    let relay_bytes_total = IntCounter::new(
        "relay_bytes_total",
        "Response body bytes written by the relay",
    )?;

    let relays_in_flight = IntGauge::new(
        "relays_in_flight",
        "Number of responses currently being streamed",
    )?;

    let relay_duration_seconds = HistogramVec::new(
        HistogramOpts::new(
            "relay_duration_seconds",
            "Time from first byte to end of the streamed response",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["outcome"], // completed, failed, disconnected
    )?;

    let upstream_open_latency_seconds = HistogramVec::new(
        HistogramOpts::new(
            "upstream_open_latency_seconds",
            "Time to open the upstream completion stream",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["provider", "model"],
    )?;

    let upstream_errors_total = IntCounterVec::new(
        Opts::new("upstream_errors_total", "Upstream model errors"),
        &["provider", "phase", "error_type"], // phase: open, mid_stream
    )?;

    let genai_tokens_total = IntCounterVec::new(
        Opts::new("genai_tokens_total", "Total tokens processed"),
        &["model", "type"], // type: input, output
    )?;

    registry.register(Box::new(chat_requests_total.clone()))?;
    registry.register(Box::new(relay_fragments_total.clone()))?;
    registry.register(Box::new(relay_bytes_total.clone()))?;
    registry.register(Box::new(relays_in_flight.clone()))?;
    registry.register(Box::new(relay_duration_seconds.clone()))?;
    registry.register(Box::new(upstream_open_latency_seconds.clone()))?;
    registry.register(Box::new(upstream_errors_total.clone()))?;
    registry.register(Box::new(genai_tokens_total.clone()))?;

    Ok(Metrics {
        registry,
        chat_requests_total,
        relay_fragments_total,
        relay_bytes_total,
        relays_in_flight,
        relay_duration_seconds,
        upstream_open_latency_seconds,
        upstream_errors_total,
        genai_tokens_total,
    })
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match initialized() {
        Some(m) => &m.registry,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

// Helper functions for recording metrics

/// Record the outcome of a `/chat` request up to the point streaming starts.
pub fn record_chat_request(outcome: &str) {
    if let Some(m) = initialized() {
        m.chat_requests_total.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_relays_in_flight() {
    if let Some(m) = initialized() {
        m.relays_in_flight.inc();
    }
}

pub fn dec_relays_in_flight() {
    if let Some(m) = initialized() {
        m.relays_in_flight.dec();
    }
}

/// Record a finished relay.
pub fn record_relay(outcome: &str, fragments: u64, bytes: u64, duration_secs: f64) {
    if let Some(m) = initialized() {
        m.relay_fragments_total.inc_by(fragments);
        m.relay_bytes_total.inc_by(bytes);
        m.relay_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }
}

/// Record how long opening the upstream stream took.
pub fn record_upstream_open_latency(provider: &str, model: &str, duration_secs: f64) {
    if let Some(m) = initialized() {
        m.upstream_open_latency_seconds
            .with_label_values(&[provider, model])
            .observe(duration_secs);
    }
}

/// Record an upstream error, split by whether streaming had started.
pub fn record_upstream_error(provider: &str, phase: &str, error_type: &str) {
    if let Some(m) = initialized() {
        m.upstream_errors_total
            .with_label_values(&[provider, phase, error_type])
            .inc();
    }
}

/// Record token usage reported by the model.
pub fn record_tokens(model: &str, input_tokens: u32, output_tokens: u32) {
    if let Some(m) = initialized() {
        m.genai_tokens_total
            .with_label_values(&[model, "input"])
            .inc_by(u64::from(input_tokens));
        m.genai_tokens_total
            .with_label_values(&[model, "output"])
            .inc_by(u64::from(output_tokens));
    }
}
