//! Prometheus metrics for monitoring the bridge.
//!
//! Besides the usual request counters, the registry tracks how often the
//! tool-call bridge recovers an invocation and in which encoding.

use crate::transformer::TurnSummary;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by method, endpoint, and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by endpoint
    pub active_requests: GaugeVec,

    /// Tool calls emitted as tool_use blocks, by encoding and tool name
    pub tool_calls_bridged: IntCounterVec,

    /// Turns where upstream signalled a tool call but none was emitted
    pub stop_reason_downgrades: IntCounterVec,

    /// Stop reasons reported to clients
    pub stop_reasons: IntCounterVec,

    /// Upstream failures by kind (status code or transport)
    pub upstream_errors: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
///
/// # Examples
///
/// ```no_run
/// use llm_bridge_rust::core::metrics::init_metrics;
///
/// let metrics = init_metrics();
/// metrics.request_count.with_label_values(&["GET", "/health", "200"]).inc();
/// ```
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "llm_bridge_requests_total",
            "Total number of requests",
            &["method", "endpoint", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "llm_bridge_request_duration_seconds",
            "Request duration in seconds",
            &["method", "endpoint"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "llm_bridge_active_requests",
            "Number of active requests",
            &["endpoint"]
        )
        .expect("Failed to register active_requests metric");

        let tool_calls_bridged = register_int_counter_vec!(
            "llm_bridge_tool_calls_total",
            "Tool calls emitted as tool_use blocks",
            &["encoding", "tool"]
        )
        .expect("Failed to register tool_calls_bridged metric");

        let stop_reason_downgrades = register_int_counter_vec!(
            "llm_bridge_stop_reason_downgrades_total",
            "Upstream tool_calls finish reasons downgraded to end_turn",
            &["mode"]
        )
        .expect("Failed to register stop_reason_downgrades metric");

        let stop_reasons = register_int_counter_vec!(
            "llm_bridge_stop_reasons_total",
            "Stop reasons reported to clients",
            &["mode", "stop_reason"]
        )
        .expect("Failed to register stop_reasons metric");

        let upstream_errors = register_int_counter_vec!(
            "llm_bridge_upstream_errors_total",
            "Upstream request failures",
            &["kind"]
        )
        .expect("Failed to register upstream_errors metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            tool_calls_bridged,
            stop_reason_downgrades,
            stop_reasons,
            upstream_errors,
        }
    })
}

/// Get the global metrics instance, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

impl Metrics {
    /// Record the outcome of one translated turn. `mode` is `stream` or `json`.
    pub fn record_turn(&self, mode: &str, summary: &TurnSummary) {
        if let (Some(tool), Some(encoding)) = (&summary.tool_name, summary.encoding) {
            self.tool_calls_bridged
                .with_label_values(&[encoding.as_str(), tool.as_str()])
                .inc();
        }
        if summary.downgraded {
            self.stop_reason_downgrades.with_label_values(&[mode]).inc();
        }
        self.stop_reasons
            .with_label_values(&[mode, summary.stop_reason.as_str()])
            .inc();
    }

    /// Record an upstream failure.
    pub fn record_upstream_error(&self, kind: &str) {
        self.upstream_errors.with_label_values(&[kind]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::{Encoding, StopReason};

    #[test]
    fn test_metrics_initialization() {
        let metrics = init_metrics();
        metrics
            .request_count
            .with_label_values(&["GET", "/test", "200"])
            .inc();

        // Verify the same instance is returned
        let metrics2 = get_metrics();
        assert!(std::ptr::eq(metrics, metrics2));
    }

    #[test]
    fn test_request_count_metric() {
        let metrics = init_metrics();

        // Use unique label values to avoid conflicts with other tests
        let labels = ["POST", "/v1/messages-unique", "201"];
        let initial = metrics.request_count.with_label_values(&labels).get();
        metrics.request_count.with_label_values(&labels).inc();
        let after = metrics.request_count.with_label_values(&labels).get();

        assert_eq!(after, initial + 1);
    }

    #[test]
    fn test_active_requests_metric() {
        let metrics = init_metrics();
        let gauge = metrics.active_requests.with_label_values(&["/v1/messages-gauge"]);

        let initial = gauge.get();
        gauge.inc();
        assert_eq!(gauge.get(), initial + 1.0);
        gauge.dec();
        assert_eq!(gauge.get(), initial);
    }

    #[test]
    fn test_record_turn_counts_bridged_tool() {
        let metrics = init_metrics();
        let counter = metrics
            .tool_calls_bridged
            .with_label_values(&["embedded_json", "MetricsProbe"]);
        let before = counter.get();

        metrics.record_turn(
            "json",
            &TurnSummary {
                tool_name: Some("MetricsProbe".to_string()),
                encoding: Some(Encoding::EmbeddedJson),
                downgraded: false,
                stop_reason: StopReason::ToolUse,
            },
        );

        assert_eq!(counter.get(), before + 1);
    }

    #[test]
    fn test_record_turn_counts_downgrade() {
        let metrics = init_metrics();
        let counter = metrics
            .stop_reason_downgrades
            .with_label_values(&["downgrade-probe"]);
        let before = counter.get();

        metrics.record_turn(
            "downgrade-probe",
            &TurnSummary {
                downgraded: true,
                stop_reason: StopReason::EndTurn,
                ..Default::default()
            },
        );

        assert_eq!(counter.get(), before + 1);
    }

    #[test]
    fn test_record_upstream_error() {
        let metrics = init_metrics();
        let before = metrics.upstream_errors.with_label_values(&["599"]).get();
        metrics.record_upstream_error("599");
        assert_eq!(
            metrics.upstream_errors.with_label_values(&["599"]).get(),
            before + 1
        );
    }
}
