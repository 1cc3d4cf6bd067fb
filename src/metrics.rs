//! Fire-and-forget counters and latency recorders.
//!
//! Recording never fails a request: [`Metrics`] methods are synchronous and
//! infallible. The in-memory implementation updates a map under a short
//! lock; the Redis implementation spawns the write and logs failures with
//! `warn!`.

use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Metric names.
pub mod names {
    pub const CAPTURE_ACCEPTED: &str = "capture.accepted";
    pub const CAPTURE_REJECTED: &str = "capture.rejected";
    pub const ANALYZE_OK: &str = "analyze.ok";
    pub const ANALYZE_SANITIZED: &str = "analyze.sanitized";
    pub const ANALYZE_LOW_CONFIDENCE: &str = "analyze.low_confidence";
    pub const OCR_OK: &str = "ocr.ok";
    pub const MODEL_ERROR: &str = "model.error";
    pub const QA_OK: &str = "qa.ok";
    pub const GUARD_ORIGIN_REJECTED: &str = "guard.origin_rejected";
    pub const GUARD_SESSION_REJECTED: &str = "guard.session_rejected";
    pub const GUARD_RATE_LIMITED: &str = "guard.rate_limited";
    pub const RATE_LIMIT_FALLBACK: &str = "guard.rate_limit_fallback";
    pub const ANALYZE_LATENCY_MS: &str = "analyze.latency_ms";
    pub const QA_LATENCY_MS: &str = "qa.latency_ms";
}

/// Metrics sink.
pub trait Metrics: Send + Sync {
    fn incr(&self, name: &'static str);
    fn record_latency(&self, name: &'static str, ms: u64);
}

/// Aggregated latency samples.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Default)]
struct Registry {
    counters: BTreeMap<&'static str, u64>,
    latencies: BTreeMap<&'static str, LatencySummary>,
}

/// Process-local metrics.
#[derive(Debug, Default, Clone)]
pub struct MemoryMetrics {
    inner: Arc<Mutex<Registry>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .map(|r| r.counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn latency(&self, name: &str) -> LatencySummary {
        self.inner
            .lock()
            .map(|r| r.latencies.get(name).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Metrics for MemoryMetrics {
    fn incr(&self, name: &'static str) {
        if let Ok(mut r) = self.inner.lock() {
            *r.counters.entry(name).or_default() += 1;
        }
    }

    fn record_latency(&self, name: &'static str, ms: u64) {
        if let Ok(mut r) = self.inner.lock() {
            let s = r.latencies.entry(name).or_default();
            s.count += 1;
            s.total_ms += ms;
            s.max_ms = s.max_ms.max(ms);
        }
    }
}

/// Counters kept in Redis under `<prefix>:metrics:<name>`.
///
/// Latencies are stored as `<name>:count` and `<name>:total_ms`.
#[derive(Clone)]
pub struct RedisMetrics {
    client: redis::Client,
    prefix: String,
}

impl RedisMetrics {
    pub fn new(url: &str, prefix: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.to_string(),
        })
    }

    fn spawn_incr(&self, key: String, by: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("metrics: no runtime, dropping {}", key);
            return;
        };
        let client = self.client.clone();
        handle.spawn(async move {
            let result: Result<u64, redis::RedisError> = async {
                let mut conn = client.get_multiplexed_async_connection().await?;
                conn.incr(&key, by).await
            }
            .await;
            if let Err(e) = result {
                warn!("metrics: failed to record {}: {}", key, e);
            }
        });
    }
}

impl Metrics for RedisMetrics {
    fn incr(&self, name: &'static str) {
        self.spawn_incr(format!("{}:metrics:{name}", self.prefix), 1);
    }

    fn record_latency(&self, name: &'static str, ms: u64) {
        self.spawn_incr(format!("{}:metrics:{name}:count", self.prefix), 1);
        self.spawn_incr(format!("{}:metrics:{name}:total_ms", self.prefix), ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_counters_accumulate() {
        let m = MemoryMetrics::new();
        m.incr(names::ANALYZE_OK);
        m.incr(names::ANALYZE_OK);
        m.incr(names::MODEL_ERROR);
        assert_eq!(m.counter(names::ANALYZE_OK), 2);
        assert_eq!(m.counter(names::MODEL_ERROR), 1);
        assert_eq!(m.counter(names::QA_OK), 0);
    }

    #[test]
    fn memory_latency_summary() {
        let m = MemoryMetrics::new();
        m.record_latency(names::QA_LATENCY_MS, 120);
        m.record_latency(names::QA_LATENCY_MS, 80);
        assert_eq!(
            m.latency(names::QA_LATENCY_MS),
            LatencySummary {
                count: 2,
                total_ms: 200,
                max_ms: 120
            }
        );
    }

    #[tokio::test]
    async fn unreachable_redis_never_fails_the_caller() {
        let m = RedisMetrics::new("redis://127.0.0.1:1/", "test").unwrap();
        m.incr(names::ANALYZE_OK);
        m.record_latency(names::ANALYZE_LATENCY_MS, 5);
    }

    #[test]
    fn redis_metrics_outside_runtime_is_a_noop() {
        let m = RedisMetrics::new("redis://127.0.0.1:1/", "test").unwrap();
        m.incr(names::QA_OK);
    }
}
