// Prometheus metrics for the wordmeter service
//
// Exposed on the /metrics HTTP endpoint:
// - Request volume and in-flight requests (counter, gauge)
// - End-to-end stream duration (histogram)
// - Words generated (counter)
// - Request record write latency (histogram)
// - Rate limiter drops and quota cache hit ratio (counters)

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Request metrics
    pub static ref REQUESTS_TOTAL: IntCounter = IntCounter::new(
        "requests_total",
        "Total number of API requests received"
    ).expect("Failed to create requests total metric");

    pub static ref ACTIVE_REQUESTS: IntGauge = IntGauge::new(
        "active_requests",
        "Current number of in-flight requests"
    ).expect("Failed to create active requests metric");

    pub static ref REQUEST_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("request_duration_seconds", "End-to-end handler duration for API requests")
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 40.0, 60.0, 75.0]),
    ).expect("Failed to create request duration metric");

    // Output metrics
    pub static ref WORDS_GENERATED_TOTAL: IntCounter = IntCounter::new(
        "words_generated_total",
        "Total number of words generated across all streams"
    ).expect("Failed to create words generated metric");

    // Store metrics
    pub static ref DB_WRITE_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("db_write_duration_seconds", "Duration of request record writes")
            .buckets(vec![0.005, 0.01, 0.02, 0.05, 0.1, 0.25, 0.5]),
    ).expect("Failed to create db write duration metric");

    // Admission metrics
    pub static ref RATE_LIMIT_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "rate_limit_dropped_total",
        "Requests rejected by the per-user rate limiter"
    ).expect("Failed to create rate limit dropped metric");

    pub static ref RATE_LIMIT_TRACKED_USERS: IntGauge = IntGauge::new(
        "rate_limit_tracked_users",
        "Number of live rate limit counters"
    ).expect("Failed to create rate limit tracked users metric");

    // Cache metrics
    pub static ref QUOTA_CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "quota_cache_hits_total",
        "Quota reads served from the cache"
    ).expect("Failed to create quota cache hits metric");

    pub static ref QUOTA_CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "quota_cache_misses_total",
        "Quota reads that fell through to the durable store"
    ).expect("Failed to create quota cache misses metric");
}

/// Initialize metrics registry - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(WORDS_GENERATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_WRITE_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_TRACKED_USERS.clone()))?;
    REGISTRY.register(Box::new(QUOTA_CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUOTA_CACHE_MISSES_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
