//! Centralized runtime configuration for the ingest data-plane.
//!
//! Every tunable enumerated in the external-interfaces section of the spec
//! lives here as a named constant (documenting the default's rationale,
//! following the queue-sizing constants convention elsewhere in this crate)
//! plus an environment-variable override read once at startup.

use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Global-public adapter poll interval. Matches upstream's advertised
/// per-credential refresh cadence; polling faster just burns rate-limit
/// budget without improving freshness.
pub const DEFAULT_PUBLIC_POLL_SECS: u64 = 600;

/// Regional-commercial adapter global token bucket rate (requests/sec),
/// conservative default for a typical per-vendor free/starter tier.
pub const DEFAULT_COMMERCIAL_RATE_PER_SEC: u32 = 1;

/// Ingestion worker batch size: after the first blocking `reserve`, drain up
/// to this many more messages with a short timeout to amortize persistence
/// round-trips without unboundedly delaying the first message in a batch.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Number of parallel ingestion worker tasks.
pub const DEFAULT_INGEST_WORKERS: usize = 4;

/// Number of parallel webhook dispatcher tasks.
pub const DEFAULT_DISPATCH_WORKERS: usize = 4;

/// Queue retry backoff base (milliseconds): `base * 2^(attempts-1) + jitter`.
pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;

/// Upper bound on the random jitter added to each retry backoff.
pub const DEFAULT_RETRY_JITTER_MS: u64 = 250;

/// Default max delivery/ingest attempts before a message is parked in the DLQ.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Hot cache capacity: bounded so memory stays predictable regardless of how
/// many distinct aircraft have ever been seen.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 50_000;

/// Hot cache TTL after `last_contact`, independent of the eviction-by-size
/// policy: an aircraft that stops reporting should fall out of "live" state
/// well before it would be evicted purely for being the oldest entry.
pub const DEFAULT_CACHE_TTL_SECS: i64 = 300;

/// Minimum cache-only hit count below which the read API additionally
/// queries the durable store for a bounds query.
pub const DEFAULT_MIN_RESULTS_BEFORE_DB_FALLBACK: usize = 25;

/// Read API visibility freshness window: records older than this are
/// considered gone even if still present in cache or store.
pub const DEFAULT_VISIBILITY_WINDOW_SECS: i64 = 900;

/// Staleness override threshold: a stored record older than this by
/// `last_contact` no longer blocks a lower-priority/equal-`last_contact`
/// replacement — recovery from a source outage must not get stuck.
pub const DEFAULT_STALE_THRESHOLD_SECS: i64 = 600;

/// Webhook HTTP call timeout.
pub const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 10_000;

/// Whether non-HTTPS webhook callback URLs are rejected by default.
pub const DEFAULT_ENFORCE_HTTPS: bool = true;

/// Per-subscriber governor failure-breaker threshold (consecutive failures
/// before the breaker opens).
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;

/// Per-subscriber governor breaker reset window before a half-open probe.
pub const DEFAULT_BREAKER_RESET_SECS: i64 = 300;

/// Shutdown grace period: time given to in-flight worker/dispatcher messages
/// to finish before remaining reservations are abandoned.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Calculate the warning threshold for queue depth monitoring (80% of
/// capacity).
pub const fn queue_warning_threshold(size: usize) -> usize {
    (size * 80) / 100
}

// ============================================================================
// Redis key layout
// ============================================================================

pub const INGEST_QUEUE_PREFIX: &str = "flyoverhead:aircraft_ingest";
pub const WEBHOOK_QUEUE_PREFIX: &str = "flyoverhead:webhooks";

// ============================================================================
// Environment-driven configuration
// ============================================================================

/// Runtime configuration resolved from the environment at process start.
///
/// Each field mirrors one of the "enumerated effects" in the external
/// interfaces section; unset variables fall back to the defaults above.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,

    pub batch_size: usize,
    pub ingest_workers: usize,
    pub dispatch_workers: usize,
    pub poll_timeout: Duration,

    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_jitter_ms: u64,

    pub cache_max_entries: usize,
    pub cache_ttl: chrono::Duration,
    pub min_results_before_db_fallback: usize,
    pub visibility_window: chrono::Duration,
    pub stale_threshold: chrono::Duration,

    pub webhook_enforce_https: bool,
    pub webhook_timeout: Duration,

    pub breaker_threshold: u32,
    pub breaker_reset: chrono::Duration,

    pub public_poll_interval: Duration,
    pub commercial_rate_per_sec: u32,

    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults for anything unset. Called once at process start;
    /// the teacher's convention of `.ok()`/`unwrap_or_else` over env::var is
    /// used throughout rather than a config-file format, since every knob
    /// here is a scalar, not structured data.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),

            batch_size: env_parse_or("INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            ingest_workers: env_parse_or("INGEST_WORKERS", DEFAULT_INGEST_WORKERS),
            dispatch_workers: env_parse_or("DISPATCH_WORKERS", DEFAULT_DISPATCH_WORKERS),
            poll_timeout: Duration::from_millis(env_parse_or("QUEUE_POLL_TIMEOUT_MS", 5_000)),

            max_attempts: env_parse_or("MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            retry_base_ms: env_parse_or("RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS),
            retry_jitter_ms: env_parse_or("RETRY_JITTER_MS", DEFAULT_RETRY_JITTER_MS),

            cache_max_entries: env_parse_or("LIVE_STATE_MAX_ENTRIES", DEFAULT_CACHE_MAX_ENTRIES),
            cache_ttl: chrono::Duration::seconds(env_parse_or(
                "LIVE_STATE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            min_results_before_db_fallback: env_parse_or(
                "MIN_RESULTS_BEFORE_DB_FALLBACK",
                DEFAULT_MIN_RESULTS_BEFORE_DB_FALLBACK,
            ),
            visibility_window: chrono::Duration::seconds(env_parse_or(
                "VISIBILITY_WINDOW_SECS",
                DEFAULT_VISIBILITY_WINDOW_SECS,
            )),
            stale_threshold: chrono::Duration::seconds(env_parse_or(
                "STALE_THRESHOLD_SECS",
                DEFAULT_STALE_THRESHOLD_SECS,
            )),

            webhook_enforce_https: env_parse_or("WEBHOOK_ENFORCE_HTTPS", DEFAULT_ENFORCE_HTTPS),
            webhook_timeout: Duration::from_millis(env_parse_or(
                "WEBHOOK_TIMEOUT_MS",
                DEFAULT_WEBHOOK_TIMEOUT_MS,
            )),

            breaker_threshold: env_parse_or("BREAKER_THRESHOLD", DEFAULT_BREAKER_THRESHOLD),
            breaker_reset: chrono::Duration::seconds(env_parse_or(
                "BREAKER_RESET_SECS",
                DEFAULT_BREAKER_RESET_SECS,
            )),

            public_poll_interval: Duration::from_secs(env_parse_or(
                "PUBLIC_POLL_SECS",
                DEFAULT_PUBLIC_POLL_SECS,
            )),
            commercial_rate_per_sec: env_parse_or(
                "COMMERCIAL_RATE_PER_SEC",
                DEFAULT_COMMERCIAL_RATE_PER_SEC,
            ),

            shutdown_grace: Duration::from_secs(env_parse_or(
                "SHUTDOWN_GRACE_SECS",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )),
        })
    }
}

fn require_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{key} must be set in environment variables"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_warning_threshold() {
        assert_eq!(queue_warning_threshold(100), 80);
        assert_eq!(queue_warning_threshold(50_000), 40_000);
    }

    #[test]
    fn test_env_parse_or_falls_back_on_missing() {
        let val: u64 = env_parse_or("FLYOVERHEAD_DOES_NOT_EXIST_XYZ", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_parse_or_falls_back_on_unparseable() {
        // SAFETY: test-only, single-threaded within this process's test harness
        // for this specific var name.
        unsafe {
            std::env::set_var("FLYOVERHEAD_TEST_BAD_INT", "not-a-number");
        }
        let val: u64 = env_parse_or("FLYOVERHEAD_TEST_BAD_INT", 7);
        assert_eq!(val, 7);
        unsafe {
            std::env::remove_var("FLYOVERHEAD_TEST_BAD_INT");
        }
    }
}
