//! Fixed-window rate limiting.
//!
//! A window opens with the first request for a key and lasts
//! `window_secs`; at most `max` requests are accepted inside it. Rejections
//! carry the seconds until the window closes, which becomes `Retry-After`.
//!
//! [`MemoryRateLimiter`] keeps windows in a process-local map.
//! [`RedisRateLimiter`] delegates atomicity to Redis (`INCR` + `EXPIRE`) and
//! falls back to a local limiter for any request where Redis fails.

use crate::metrics::{names, Metrics};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::session::now_ms;

/// Stale windows are swept once the map holds more keys than this.
const SWEEP_THRESHOLD: usize = 1024;

/// Upper bound on one Redis round trip before falling back.
const REMOTE_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of one counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub ok: bool,
    /// Requests counted in the current window, this one included.
    pub count: u64,
    /// Seconds until the window resets; at least 1.
    pub reset_seconds: u64,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request against `key`.
    async fn hit(&self, key: &str) -> RateDecision;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start_ms: u64,
    count: u64,
}

/// Process-local fixed windows.
#[derive(Debug)]
pub struct MemoryRateLimiter {
    max: u64,
    window_ms: u64,
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryRateLimiter {
    pub fn new(max: u32, window_secs: u64) -> Self {
        Self {
            max: u64::from(max),
            window_ms: window_secs * 1000,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// [`RateLimiter::hit`] with an explicit clock.
    pub async fn hit_at(&self, key: &str, now_ms: u64) -> RateDecision {
        let mut windows = self.windows.lock().await;

        if windows.len() > SWEEP_THRESHOLD {
            let window_ms = self.window_ms;
            windows.retain(|_, w| now_ms < w.start_ms + window_ms);
        }

        let w = windows.entry(key.to_string()).or_insert(Window {
            start_ms: now_ms,
            count: 0,
        });
        if now_ms >= w.start_ms + self.window_ms {
            *w = Window {
                start_ms: now_ms,
                count: 0,
            };
        }
        w.count += 1;

        let remaining_ms = (w.start_ms + self.window_ms).saturating_sub(now_ms);
        RateDecision {
            ok: w.count <= self.max,
            count: w.count,
            reset_seconds: remaining_ms.div_ceil(1000).max(1),
        }
    }

    /// Keys currently tracked.
    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn hit(&self, key: &str) -> RateDecision {
        self.hit_at(key, now_ms()).await
    }
}

/// Windows counted in Redis, shared by every process using the same prefix.
pub struct RedisRateLimiter {
    client: redis::Client,
    prefix: String,
    max: u64,
    window_secs: u64,
    fallback: MemoryRateLimiter,
    metrics: Arc<dyn Metrics>,
}

impl RedisRateLimiter {
    pub fn new(
        url: &str,
        prefix: &str,
        max: u32,
        window_secs: u64,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.to_string(),
            max: u64::from(max),
            window_secs,
            fallback: MemoryRateLimiter::new(max, window_secs),
            metrics,
        })
    }

    async fn remote_hit(&self, key: &str) -> Result<RateDecision, redis::RedisError> {
        let window_key = format!("{}:rl:{key}", self.prefix);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = conn.incr(&window_key, 1_u64).await?;
        if count == 1 {
            let _: bool = conn.expire(&window_key, self.window_secs as i64).await?;
        }
        let mut ttl: i64 = conn.ttl(&window_key).await?;
        if ttl < 0 {
            // Counter without expiry: the EXPIRE after the first INCR was lost.
            let _: bool = conn.expire(&window_key, self.window_secs as i64).await?;
            ttl = self.window_secs as i64;
        }
        Ok(RateDecision {
            ok: count <= self.max,
            count,
            reset_seconds: (ttl as u64).max(1),
        })
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn hit(&self, key: &str) -> RateDecision {
        match timeout(REMOTE_TIMEOUT, self.remote_hit(key)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!("rate limit: redis failed ({}), using local window", e);
                self.metrics.incr(names::RATE_LIMIT_FALLBACK);
                self.fallback.hit(key).await
            }
            Err(_) => {
                debug!("rate limit: redis timed out, using local window");
                self.metrics.incr(names::RATE_LIMIT_FALLBACK);
                self.fallback.hit(key).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemoryMetrics;

    const T0: u64 = 1_700_000_000_000;

    #[tokio::test]
    async fn five_pass_sixth_is_rejected() {
        let rl = MemoryRateLimiter::new(5, 60);
        for i in 1..=5 {
            let d = rl.hit_at("qa:1.2.3.4", T0 + i * 1000).await;
            assert!(d.ok, "call {i}");
            assert_eq!(d.count, i);
        }
        let d = rl.hit_at("qa:1.2.3.4", T0 + 10_500).await;
        assert!(!d.ok);
        assert_eq!(d.count, 6);
        assert_eq!(d.reset_seconds, 51);
    }

    #[tokio::test]
    async fn next_window_starts_fresh() {
        let rl = MemoryRateLimiter::new(5, 60);
        for _ in 0..7 {
            rl.hit_at("k", T0).await;
        }
        let d = rl.hit_at("k", T0 + 60_000).await;
        assert!(d.ok);
        assert_eq!(d.count, 1);
        assert_eq!(d.reset_seconds, 60);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let rl = MemoryRateLimiter::new(1, 60);
        assert!(rl.hit_at("analyze:a", T0).await.ok);
        assert!(!rl.hit_at("analyze:a", T0).await.ok);
        assert!(rl.hit_at("analyze:b", T0).await.ok);
        assert!(rl.hit_at("qa:a", T0).await.ok);
    }

    #[tokio::test]
    async fn reset_is_at_least_one_second() {
        let rl = MemoryRateLimiter::new(1, 60);
        rl.hit_at("k", T0).await;
        let d = rl.hit_at("k", T0 + 59_999).await;
        assert!(!d.ok);
        assert_eq!(d.reset_seconds, 1);
    }

    #[tokio::test]
    async fn stale_windows_are_swept() {
        let rl = MemoryRateLimiter::new(5, 60);
        for i in 0..=SWEEP_THRESHOLD {
            rl.hit_at(&format!("k{i}"), T0).await;
        }
        assert_eq!(rl.tracked_keys().await, SWEEP_THRESHOLD + 1);
        rl.hit_at("fresh", T0 + 61_000).await;
        assert_eq!(rl.tracked_keys().await, 1);
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_to_local_window() {
        let metrics = Arc::new(MemoryMetrics::new());
        let rl = RedisRateLimiter::new("redis://127.0.0.1:1/", "test", 2, 60, metrics.clone())
            .unwrap();
        assert!(rl.hit("k").await.ok);
        assert!(rl.hit("k").await.ok);
        assert!(!rl.hit("k").await.ok);
        assert_eq!(metrics.counter(names::RATE_LIMIT_FALLBACK), 3);
    }
}
