use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static CACHE_LOOKUPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CACHE_INVALIDATIONS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static BACKEND_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static POLICY_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "genq_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create genq_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "genq_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create genq_gateway_http_request_duration_seconds"),
        )
    })
}

fn cache_lookups_total() -> &'static IntCounterVec {
    CACHE_LOOKUPS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "genq_gateway_cache_lookups_total",
                    "Query cache lookups by outcome.",
                ),
                &["outcome"],
            )
            .expect("create genq_gateway_cache_lookups_total"),
        )
    })
}

fn cache_invalidations_total() -> &'static IntCounter {
    CACHE_INVALIDATIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "genq_gateway_cache_invalidations_total",
                "Query cache flushes caused by a data version change.",
            )
            .expect("create genq_gateway_cache_invalidations_total"),
        )
    })
}

fn backend_calls_total() -> &'static IntCounterVec {
    BACKEND_CALLS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "genq_gateway_backend_calls_total",
                    "Backend calls by operation and outcome.",
                ),
                &["operation", "outcome"],
            )
            .expect("create genq_gateway_backend_calls_total"),
        )
    })
}

fn policy_decisions_total() -> &'static IntCounterVec {
    POLICY_DECISIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "genq_gateway_policy_decisions_total",
                    "Access policy decisions by outcome.",
                ),
                &["outcome"],
            )
            .expect("create genq_gateway_policy_decisions_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_cache_lookup(outcome: &str) {
    cache_lookups_total().with_label_values(&[outcome]).inc();
}

pub fn inc_cache_invalidation() {
    cache_invalidations_total().inc();
}

pub fn observe_backend_call(operation: &str, outcome: &str) {
    backend_calls_total()
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn observe_policy_decision(outcome: &str) {
    policy_decisions_total().with_label_values(&[outcome]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = cache_invalidations_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
