//! Request guards, evaluated in a fixed order before any route work:
//!
//! ```text
//! origin ──▶ session ──▶ rate limit
//!  (403)      (401)        (429 + Retry-After)
//! ```
//!
//! The first failing step short-circuits. Token issuance itself runs the
//! origin and rate-limit steps only, since the caller has no token yet.

pub mod origin;
pub mod rate_limit;
pub mod session;

use crate::error::ApiError;
use crate::metrics::{names, Metrics};
use rate_limit::RateLimiter;
use session::SessionSigner;
use std::sync::Arc;
use tracing::debug;

/// Caller identity used when no forwarding header names one.
pub const ANONYMOUS: &str = "anonymous";

/// The request attributes the guards look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub origin: Option<String>,
    pub referer: Option<String>,
    pub session_token: Option<String>,
    /// Caller IP or [`ANONYMOUS`].
    pub client_ip: String,
}

impl RequestMeta {
    /// Caller IP from `x-forwarded-for` (first entry), else `x-real-ip`.
    pub fn client_ip_from(forwarded_for: Option<&str>, real_ip: Option<&str>) -> String {
        let non_empty = |v: &str| Some(v.trim()).filter(|v| !v.is_empty()).map(str::to_string);
        forwarded_for
            .and_then(|v| v.split(',').next())
            .and_then(non_empty)
            .or_else(|| real_ip.and_then(non_empty))
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }
}

/// Which guards a route needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePolicy {
    /// Rate-limit key prefix.
    pub name: &'static str,
    pub require_session: bool,
    pub rate_limited: bool,
    /// 401 message for this route.
    pub session_message: &'static str,
}

impl RoutePolicy {
    pub const SESSION: RoutePolicy = RoutePolicy {
        name: "session",
        require_session: false,
        rate_limited: true,
        session_message: "",
    };
    pub const CAPTURE: RoutePolicy = RoutePolicy {
        name: "capture",
        require_session: true,
        rate_limited: true,
        session_message: "Session expired, reload the page and take the photo again",
    };
    pub const OCR: RoutePolicy = RoutePolicy {
        name: "ocr",
        require_session: true,
        rate_limited: true,
        session_message: "Session expired, take another photo",
    };
    pub const ANALYZE: RoutePolicy = RoutePolicy {
        name: "analyze",
        require_session: true,
        rate_limited: true,
        session_message: "Session expired, take another photo",
    };
    pub const QA: RoutePolicy = RoutePolicy {
        name: "qa",
        require_session: true,
        rate_limited: true,
        session_message: "Session expired, reload the page to keep asking",
    };
}

/// Origin, session and rate-limit checks for one deployment.
#[derive(Clone)]
pub struct Guard {
    allowed_origin: Option<String>,
    signer: SessionSigner,
    limiter: Arc<dyn RateLimiter>,
    metrics: Arc<dyn Metrics>,
}

impl Guard {
    pub fn new(
        allowed_origin: Option<String>,
        signer: SessionSigner,
        limiter: Arc<dyn RateLimiter>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            allowed_origin,
            signer,
            limiter,
            metrics,
        }
    }

    pub fn signer(&self) -> &SessionSigner {
        &self.signer
    }

    /// Run the guards `policy` asks for, in order.
    pub async fn check(&self, meta: &RequestMeta, policy: &RoutePolicy) -> Result<(), ApiError> {
        if !origin::origin_allowed(
            self.allowed_origin.as_deref(),
            meta.origin.as_deref(),
            meta.referer.as_deref(),
        ) {
            debug!("{}: origin rejected ({:?})", policy.name, meta.origin);
            self.metrics.incr(names::GUARD_ORIGIN_REJECTED);
            return Err(ApiError::OriginForbidden);
        }

        if policy.require_session {
            let token = meta.session_token.as_deref().unwrap_or_default();
            if let Err(reason) = self.signer.verify(token) {
                debug!("{}: session rejected ({})", policy.name, reason);
                self.metrics.incr(names::GUARD_SESSION_REJECTED);
                return Err(ApiError::unauthorized(policy.session_message));
            }
        }

        if policy.rate_limited {
            let key = format!("{}:{}", policy.name, meta.client_ip);
            let decision = self.limiter.hit(&key).await;
            if !decision.ok {
                debug!(
                    "{}: rate limited ({} requests, reset in {}s)",
                    policy.name, decision.count, decision.reset_seconds
                );
                self.metrics.incr(names::GUARD_RATE_LIMITED);
                return Err(ApiError::RateLimited {
                    retry_after_secs: decision.reset_seconds,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemoryMetrics;
    use rate_limit::MemoryRateLimiter;

    fn guard(metrics: Arc<MemoryMetrics>) -> Guard {
        Guard::new(
            Some("https://plainpaper.example".into()),
            SessionSigner::new("secret", 300),
            Arc::new(MemoryRateLimiter::new(2, 60)),
            metrics,
        )
    }

    fn meta(g: &Guard) -> RequestMeta {
        RequestMeta {
            origin: Some("https://plainpaper.example".into()),
            referer: None,
            session_token: Some(g.signer().issue().token),
            client_ip: "10.0.0.1".into(),
        }
    }

    #[tokio::test]
    async fn passes_with_origin_token_and_budget() {
        let g = guard(Arc::new(MemoryMetrics::new()));
        assert!(g.check(&meta(&g), &RoutePolicy::ANALYZE).await.is_ok());
    }

    #[tokio::test]
    async fn origin_checked_before_session() {
        let metrics = Arc::new(MemoryMetrics::new());
        let g = guard(metrics.clone());
        let m = RequestMeta {
            origin: Some("https://evil.example".into()),
            session_token: None,
            ..meta(&g)
        };
        let err = g.check(&m, &RoutePolicy::ANALYZE).await.unwrap_err();
        assert_eq!(err.status(), 403);
        assert_eq!(metrics.counter(names::GUARD_ORIGIN_REJECTED), 1);
        assert_eq!(metrics.counter(names::GUARD_SESSION_REJECTED), 0);
    }

    #[tokio::test]
    async fn missing_token_gets_route_message() {
        let g = guard(Arc::new(MemoryMetrics::new()));
        let m = RequestMeta {
            session_token: None,
            ..meta(&g)
        };
        let err = g.check(&m, &RoutePolicy::QA).await.unwrap_err();
        assert_eq!(err.status(), 401);
        assert_eq!(err.to_string(), RoutePolicy::QA.session_message);
    }

    #[tokio::test]
    async fn session_failure_does_not_consume_rate_budget() {
        let g = guard(Arc::new(MemoryMetrics::new()));
        let bad = RequestMeta {
            session_token: Some("bogus.token".into()),
            ..meta(&g)
        };
        for _ in 0..5 {
            assert_eq!(g.check(&bad, &RoutePolicy::OCR).await.unwrap_err().status(), 401);
        }
        assert!(g.check(&meta(&g), &RoutePolicy::OCR).await.is_ok());
    }

    #[tokio::test]
    async fn rate_limit_is_per_route() {
        let g = guard(Arc::new(MemoryMetrics::new()));
        let m = meta(&g);
        g.check(&m, &RoutePolicy::QA).await.unwrap();
        g.check(&m, &RoutePolicy::QA).await.unwrap();
        let err = g.check(&m, &RoutePolicy::QA).await.unwrap_err();
        assert_eq!(err.status(), 429);
        assert!(err.retry_after_secs().unwrap() >= 1);
        assert!(g.check(&m, &RoutePolicy::ANALYZE).await.is_ok());
    }

    #[tokio::test]
    async fn session_issuance_needs_no_token() {
        let g = guard(Arc::new(MemoryMetrics::new()));
        let m = RequestMeta {
            session_token: None,
            ..meta(&g)
        };
        assert!(g.check(&m, &RoutePolicy::SESSION).await.is_ok());
    }

    #[test]
    fn client_ip_resolution() {
        assert_eq!(
            RequestMeta::client_ip_from(Some("203.0.113.7, 10.0.0.1"), Some("10.0.0.2")),
            "203.0.113.7"
        );
        assert_eq!(RequestMeta::client_ip_from(None, Some(" 10.0.0.2 ")), "10.0.0.2");
        assert_eq!(RequestMeta::client_ip_from(Some(""), None), ANONYMOUS);
        assert_eq!(RequestMeta::client_ip_from(None, None), ANONYMOUS);
    }
}
