//! Service configuration.
//!
//! Every limit, TTL and provider knob lives in [`ServiceConfig`], built via
//! [`ServiceConfigBuilder`] or loaded from `PLAINPAPER_*` environment
//! variables with [`ServiceConfig::from_env`]. Collaborators (provider,
//! capture store, rate limiter, metrics) are not part of the config; they are
//! injected when the [`crate::service::DocumentService`] is assembled.

use crate::error::ConfigError;
use crate::prompts::Lang;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

/// Configuration for the document-explanation service.
///
/// # Example
/// ```rust
/// use plainpaper::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .allowed_origin("https://plainpaper.example")
///     .session_secret("a-long-random-secret")
///     .rate_limit(5, 60)
///     .build()
///     .unwrap();
/// assert_eq!(config.rate_limit_max, 5);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Exact origin allowed to call the API, e.g. `https://app.example`.
    ///
    /// `None` is development mode: only loopback origins are accepted.
    pub allowed_origin: Option<String>,

    /// Shared secret for HMAC session tokens.
    ///
    /// When `None` a random secret is generated per process, so tokens do not
    /// survive a restart.
    #[serde(skip_serializing)]
    pub session_secret: Option<String>,

    /// Session token lifetime in seconds. Default: 300.
    pub session_ttl_secs: u64,

    /// Capture lifetime in seconds. Default: 600.
    pub capture_ttl_secs: u64,

    /// Maximum number of captures held by the in-memory store. Default: 80.
    pub max_captures: usize,

    /// Maximum cumulative bytes held by the in-memory store. Default: 120 MiB.
    pub max_store_bytes: usize,

    /// Maximum decoded image size in bytes. Default: 8 MiB.
    pub max_image_bytes: usize,

    /// Decoded payloads below this size are treated as corrupt. Default: 32.
    pub min_image_bytes: usize,

    /// Requests allowed per key and window. Default: 5.
    pub rate_limit_max: u32,

    /// Fixed rate-limit window length in seconds. Default: 60.
    pub rate_limit_window_secs: u64,

    /// Remote KV (Redis) URL. Switches capture store, rate limiter and
    /// metrics to the remote backends.
    pub redis_url: Option<String>,

    /// Key prefix used in the remote KV. Default: `plainpaper`.
    pub redis_prefix: String,

    /// LLM provider name (e.g. "openai", "anthropic"). `None` auto-detects.
    pub provider_name: Option<String>,

    /// Model identifier. `None` uses the provider default.
    pub model: Option<String>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 1200.
    pub max_tokens: usize,

    /// Retries on a failed provider call. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 400.
    pub retry_backoff_ms: u64,

    /// Per-card text cap in characters. Default: 500.
    pub card_max_chars: usize,

    /// Notice text cap in characters. Default: 420.
    pub notice_max_chars: usize,

    /// Results below this confidence get the cautionary notice. Default: 0.45.
    pub low_confidence_threshold: f64,

    /// One-time confidence penalty when the sanitizer altered text. Default: 0.1.
    pub sanitizer_penalty: f64,

    /// Accepted question length in characters. Default: 3..=600.
    pub question_min_chars: usize,
    pub question_max_chars: usize,

    /// Maximum QA context length in characters. Default: 8000.
    pub context_max_chars: usize,

    /// Language used when a request does not name one. Default: Spanish.
    pub default_lang: Lang,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            allowed_origin: None,
            session_secret: None,
            session_ttl_secs: 300,
            capture_ttl_secs: 600,
            max_captures: 80,
            max_store_bytes: 120 * 1024 * 1024,
            max_image_bytes: 8 * 1024 * 1024,
            min_image_bytes: 32,
            rate_limit_max: 5,
            rate_limit_window_secs: 60,
            redis_url: None,
            redis_prefix: "plainpaper".to_string(),
            provider_name: None,
            model: None,
            temperature: 0.1,
            max_tokens: 1200,
            max_retries: 2,
            retry_backoff_ms: 400,
            card_max_chars: 500,
            notice_max_chars: 420,
            low_confidence_threshold: 0.45,
            sanitizer_penalty: 0.1,
            question_min_chars: 3,
            question_max_chars: 600,
            context_max_chars: 8000,
            default_lang: Lang::default(),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("allowed_origin", &self.allowed_origin)
            .field("session_secret", &self.session_secret.as_ref().map(|_| "<redacted>"))
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("capture_ttl_secs", &self.capture_ttl_secs)
            .field("max_captures", &self.max_captures)
            .field("max_store_bytes", &self.max_store_bytes)
            .field("max_image_bytes", &self.max_image_bytes)
            .field("rate_limit_max", &self.rate_limit_max)
            .field("rate_limit_window_secs", &self.rate_limit_window_secs)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("default_lang", &self.default_lang)
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Reopen a built configuration for further overrides.
    pub fn into_builder(self) -> ServiceConfigBuilder {
        ServiceConfigBuilder { config: self }
    }

    /// Load configuration from `PLAINPAPER_*` environment variables.
    ///
    /// Unset or unparsable numeric variables keep their defaults. A count too
    /// large for its field is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let mut b = Self::builder()
            .session_ttl_secs(env_u64("PLAINPAPER_SESSION_TTL_SECS", d.session_ttl_secs))
            .capture_ttl_secs(env_u64("PLAINPAPER_CAPTURE_TTL_SECS", d.capture_ttl_secs))
            .max_captures(env_usize("PLAINPAPER_MAX_CAPTURES", d.max_captures))
            .max_store_bytes(env_usize("PLAINPAPER_MAX_STORE_BYTES", d.max_store_bytes))
            .max_image_bytes(env_usize("PLAINPAPER_MAX_IMAGE_BYTES", d.max_image_bytes))
            .rate_limit(
                env_u32("PLAINPAPER_RATE_LIMIT_MAX", d.rate_limit_max)?,
                env_u64("PLAINPAPER_RATE_LIMIT_WINDOW_SECS", d.rate_limit_window_secs),
            )
            .max_retries(env_u32("PLAINPAPER_MAX_RETRIES", d.max_retries)?);

        if let Some(v) = env_string("PLAINPAPER_ALLOWED_ORIGIN") {
            b = b.allowed_origin(v);
        }
        if let Some(v) = env_string("PLAINPAPER_SESSION_SECRET") {
            b = b.session_secret(v);
        }
        if let Some(v) = env_string("PLAINPAPER_REDIS_URL") {
            b = b.redis_url(v);
        }
        if let Some(v) = env_string("PLAINPAPER_PROVIDER") {
            b = b.provider_name(v);
        }
        if let Some(v) = env_string("PLAINPAPER_MODEL") {
            b = b.model(v);
        }
        if let Some(lang) = env_string("PLAINPAPER_LANG").and_then(|v| Lang::parse(&v)) {
            b = b.default_lang(lang);
        }
        b.build()
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_string(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    narrow_u32(name, env_u64(name, u64::from(default)))
}

fn narrow_u32(name: &str, value: u64) -> Result<u32, ConfigError> {
    u32::try_from(value)
        .map_err(|_| ConfigError::Invalid(format!("{name}={value} does not fit in 32 bits")))
}

fn env_usize(name: &str, default: usize) -> usize {
    env_string(name)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn allowed_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        self.config.allowed_origin = Some(origin.trim_end_matches('/').to_string());
        self
    }

    pub fn session_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.session_secret = Some(secret.into());
        self
    }

    pub fn session_ttl_secs(mut self, secs: u64) -> Self {
        self.config.session_ttl_secs = secs;
        self
    }

    pub fn capture_ttl_secs(mut self, secs: u64) -> Self {
        self.config.capture_ttl_secs = secs;
        self
    }

    pub fn max_captures(mut self, n: usize) -> Self {
        self.config.max_captures = n;
        self
    }

    pub fn max_store_bytes(mut self, n: usize) -> Self {
        self.config.max_store_bytes = n;
        self
    }

    pub fn max_image_bytes(mut self, n: usize) -> Self {
        self.config.max_image_bytes = n;
        self
    }

    pub fn min_image_bytes(mut self, n: usize) -> Self {
        self.config.min_image_bytes = n;
        self
    }

    pub fn rate_limit(mut self, max: u32, window_secs: u64) -> Self {
        self.config.rate_limit_max = max;
        self.config.rate_limit_window_secs = window_secs;
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis_url = Some(url.into());
        self
    }

    pub fn redis_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.redis_prefix = prefix.into();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn card_max_chars(mut self, n: usize) -> Self {
        self.config.card_max_chars = n;
        self
    }

    pub fn notice_max_chars(mut self, n: usize) -> Self {
        self.config.notice_max_chars = n;
        self
    }

    pub fn low_confidence_threshold(mut self, t: f64) -> Self {
        self.config.low_confidence_threshold = t;
        self
    }

    pub fn question_chars(mut self, min: usize, max: usize) -> Self {
        self.config.question_min_chars = min;
        self.config.question_max_chars = max;
        self
    }

    pub fn context_max_chars(mut self, n: usize) -> Self {
        self.config.context_max_chars = n;
        self
    }

    pub fn default_lang(mut self, lang: Lang) -> Self {
        self.config.default_lang = lang;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, ConfigError> {
        let c = &self.config;
        if c.rate_limit_max == 0 || c.rate_limit_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate limit must allow at least 1 request per non-empty window".into(),
            ));
        }
        if c.session_ttl_secs == 0 || c.capture_ttl_secs == 0 {
            return Err(ConfigError::Invalid("TTLs must be ≥ 1 second".into()));
        }
        if c.min_image_bytes >= c.max_image_bytes {
            return Err(ConfigError::Invalid(format!(
                "min image size ({}) must be below max image size ({})",
                c.min_image_bytes, c.max_image_bytes
            )));
        }
        if !(0.0..=1.0).contains(&c.low_confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "low-confidence threshold must be within 0–1, got {}",
                c.low_confidence_threshold
            )));
        }
        if c.question_min_chars > c.question_max_chars {
            return Err(ConfigError::Invalid(
                "question min length exceeds max length".into(),
            ));
        }
        if let Some(origin) = &c.allowed_origin {
            if !(origin.starts_with("https://") || origin.starts_with("http://")) {
                return Err(ConfigError::Invalid(format!(
                    "allowed origin must be an http(s) origin, got '{origin}'"
                )));
            }
        }
        Ok(self.config)
    }
}
