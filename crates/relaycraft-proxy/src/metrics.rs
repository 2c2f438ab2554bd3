//! Prometheus metrics (SPEC_FULL §2.1): request counters, rule-match
//! counters, and a database write latency histogram, served on their own
//! listener the way the teacher's `main.rs` ran a standalone metrics server.
//! This is ambient observability, not a feature the distilled spec asked
//! for — it is carried regardless.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};

pub static REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "relaycraft_requests_total",
        "Total number of proxied requests, by method and response status class",
        &["method", "status_class"]
    )
    .expect("metric can be created")
});

pub static RULE_MATCHES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "relaycraft_rule_matches_total",
        "Total number of rule matches, by rule id and phase",
        &["rule_id", "phase"]
    )
    .expect("metric can be created")
});

pub static DB_WRITE_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "relaycraft_db_write_duration_ms",
        "Flow database write latency in milliseconds",
        &["operation"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 200.0, 500.0, 1000.0]
    )
    .expect("metric can be created")
});

pub static ACTIVE_FLOWS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "relaycraft_active_flows",
        "Number of flows currently held in the in-memory traffic ring"
    )
    .expect("metric can be created")
});

pub static BREAKPOINTS_PAUSED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "relaycraft_breakpoints_paused",
        "Number of flows currently suspended at a breakpoint"
    )
    .expect("metric can be created")
});

/// Record a completed request for the counters above.
pub fn record_request(method: &str, status: u16) {
    let class = match status {
        0 => "aborted",
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };
    REQUESTS_TOTAL.with_label_values(&[method, class]).inc();
}

pub fn record_rule_match(rule_id: &str, phase: &str) {
    RULE_MATCHES_TOTAL
        .with_label_values(&[rule_id, phase])
        .inc();
}

pub fn record_db_write(operation: &str, duration_ms: f64) {
    DB_WRITE_DURATION_MS
        .with_label_values(&[operation])
        .observe(duration_ms);
}

/// Render the current metric snapshot in Prometheus text exposition format,
/// for the metrics server's `/metrics` handler.
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return format!("# encoding error: {e}\n");
    }
    String::from_utf8(buf).unwrap_or_else(|e| format!("# utf8 error: {e}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_increments_status_class() {
        record_request("GET", 200);
        record_request("GET", 404);
        record_request("GET", 0);
        let rendered = collect_metrics();
        assert!(rendered.contains("relaycraft_requests_total"));
    }

    #[test]
    fn record_rule_match_increments_counter() {
        record_rule_match("rule-1", "request");
        let rendered = collect_metrics();
        assert!(rendered.contains("relaycraft_rule_matches_total"));
    }

    #[test]
    fn record_db_write_observes_histogram() {
        record_db_write("store_flow", 12.5);
        let rendered = collect_metrics();
        assert!(rendered.contains("relaycraft_db_write_duration_ms"));
    }

    #[test]
    fn gauges_can_be_set() {
        ACTIVE_FLOWS.set(42);
        BREAKPOINTS_PAUSED.set(1);
        assert_eq!(ACTIVE_FLOWS.get(), 42);
        assert_eq!(BREAKPOINTS_PAUSED.get(), 1);
    }
}
