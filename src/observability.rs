//! Metric names and log setup. Metrics go through the `metrics` facade;
//! with no recorder installed they are no-ops.

use tracing_subscriber::EnvFilter;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests handled. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "roombook_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "roombook_http_request_duration_seconds";

/// Counter: booking operations by outcome. Labels: op, outcome.
pub const BOOKING_OPS_TOTAL: &str = "roombook_booking_ops_total";

/// Counter: write attempts repeated after a lock timeout.
pub const WRITE_RETRIES_TOTAL: &str = "roombook_write_retries_total";

// ── Store ───────────────────────────────────────────────────────

/// Counter: events durably committed. Labels: event.
pub const EVENTS_COMMITTED_TOTAL: &str = "roombook_events_committed_total";

/// Counter: room lock waits that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "roombook_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

// ── Availability cache ──────────────────────────────────────────

pub const CACHE_HITS_TOTAL: &str = "roombook_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "roombook_cache_misses_total";
pub const CACHE_INVALIDATIONS_TOTAL: &str = "roombook_cache_invalidations_total";

/// Gauge: entries dropped by the last sweep.
pub const CACHE_EVICTED: &str = "roombook_cache_evicted";

/// Install the global `tracing` subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
