// Prometheus instrumentation. Metric families live in a crate-local
// registry; process metrics get their own registry so they pick up the
// whatsapp_api_ namespace.
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::LazyLock;

pub const AI_LATENCY_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static PROCESS_REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let registry = Registry::new_custom(Some("whatsapp_api".to_string()), None)
        .expect("process registry");
    #[cfg(target_os = "linux")]
    {
        let collector = prometheus::process_collector::ProcessCollector::for_self();
        if let Err(err) = registry.register(Box::new(collector)) {
            tracing::warn!("process collector unavailable: {err}");
        }
    }
    registry
});

pub static SESSIONS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("whatsapp_sessions_active", "Live sessions currently connected")
        .expect("sessions_active gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register sessions_active");
    gauge
});

pub static MESSAGES_SENT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("whatsapp_messages_sent_total", "Messages delivered to the chat network"),
        &["agentId"],
    )
    .expect("messages_sent counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register messages_sent");
    counter
});

pub static MESSAGES_RECEIVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("whatsapp_messages_received_total", "Inbound messages accepted for dispatch"),
        &["agentId"],
    )
    .expect("messages_received counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register messages_received");
    counter
});

pub static ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("whatsapp_errors_total", "Errors by agent and code"),
        &["agentId", "code"],
    )
    .expect("errors counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register errors_total");
    counter
});

pub static AI_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new("whatsapp_ai_latency_seconds", "AI backend round-trip latency")
            .buckets(AI_LATENCY_BUCKETS.to_vec()),
        &["agentId"],
    )
    .expect("ai_latency histogram");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("register ai_latency");
    histogram
});

pub fn ai_latency_for(agent_id: &str) -> Histogram {
    AI_LATENCY.with_label_values(&[agent_id])
}

pub fn record_error(agent_id: &str, code: &str) {
    ERRORS_TOTAL.with_label_values(&[agent_id, code]).inc();
}

/// Force-register every family so the exposition is complete before any
/// of them has been touched.
pub fn init() {
    LazyLock::force(&SESSIONS_ACTIVE);
    LazyLock::force(&MESSAGES_SENT);
    LazyLock::force(&MESSAGES_RECEIVED);
    LazyLock::force(&ERRORS_TOTAL);
    LazyLock::force(&AI_LATENCY);
    LazyLock::force(&PROCESS_REGISTRY);
}

/// Text exposition for GET /metrics.
pub fn render() -> String {
    init();
    let encoder = TextEncoder::new();
    let mut families = REGISTRY.gather();
    families.extend(PROCESS_REGISTRY.gather());
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        return format!("# metric encode failed: {err}\n");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_registered_families() {
        SESSIONS_ACTIVE.set(0);
        MESSAGES_SENT.with_label_values(&["metrics-test"]).inc();
        record_error("metrics-test", "AI_TIMEOUT");
        ai_latency_for("metrics-test").observe(1.5);

        let body = render();
        assert!(body.contains("whatsapp_sessions_active"));
        assert!(body.contains("whatsapp_messages_sent_total"));
        assert!(body.contains("whatsapp_errors_total"));
        assert!(body.contains("whatsapp_ai_latency_seconds"));
    }

    #[test]
    fn latency_buckets_match_contract() {
        assert_eq!(AI_LATENCY_BUCKETS, &[0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);
    }
}
