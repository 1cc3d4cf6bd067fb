//! Route-level operations of the document-explanation service.
//!
//! [`DocumentService`] owns the injected collaborators (model provider,
//! capture store, rate limiter, metrics) and runs every operation through
//! the same sequence:
//!
//! ```text
//! guard ──▶ validate ──▶ load capture ──▶ provider ──▶ extract ──▶ shape
//! ```
//!
//! ## Streaming
//!
//! The streaming variants spawn one producer task per request that pushes
//! events into a bounded channel; the returned stream is the receiving end.
//! When the client goes away the next send fails and the producer stops.
//! Errors before the first event (guard, validation, unknown capture) are
//! returned as `Err`; errors after it become a terminal `error` event.

use crate::config::ServiceConfig;
use crate::error::{ApiError, ConfigError, ModelError};
use crate::guard::rate_limit::{MemoryRateLimiter, RateLimiter, RedisRateLimiter};
use crate::guard::session::{now_ms, IssuedToken, SessionSigner};
use crate::guard::{Guard, RequestMeta, RoutePolicy};
use crate::metrics::{names, MemoryMetrics, Metrics, RedisMetrics};
use crate::pipeline::input::{validate_image, ImageLimits};
use crate::pipeline::llm::{
    analyze_stream_or_fallback, answer_stream_or_fallback, EdgequakeProvider, ImageInput,
    ModelProvider, TextRequest, VisionRequest,
};
use crate::pipeline::postprocess::{
    build_result_with, clean_text, extract_json_object, shape_card, AnalysisResult, BuiltResult,
    ResultPolicy,
};
use crate::pipeline::sanitize::{Sanitizer, StreamingSanitizer, ELLIPSIS};
use crate::prompts::{analyze_prompt, qa_prompt, Lang, PromptDefaults, OCR_PROMPT};
use crate::store::{
    Capture, CaptureImage, CaptureStore, MemoryCaptureStore, RedisCaptureStore, StoreStats,
};
use crate::stream::cards::CardExtractor;
use crate::stream::{AnalyzeEvent, AnalyzeStream, QaEvent, QaStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// OCR text cap in characters.
pub const OCR_MAX_CHARS: usize = 6000;

/// Q&A answer cap in characters.
pub const ANSWER_MAX_CHARS: usize = 1500;

/// Events buffered between a producer task and a slow client.
const STREAM_BUFFER: usize = 32;

// ── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    /// `data:image/...;base64,...`
    #[serde(default)]
    pub image: String,
    /// Optional OCR-optimised variant of the same photo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrRequest {
    #[serde(default)]
    pub capture_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub capture_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    /// Delete the capture after a successful analysis.
    #[serde(default)]
    pub consume: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaRequest {
    #[serde(default)]
    pub question: String,
    /// Analysis or OCR text the question is about.
    #[serde(default)]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

// ── Service ──────────────────────────────────────────────────────────────────

/// The document-explanation service. Cheap to clone.
#[derive(Clone)]
pub struct DocumentService {
    config: Arc<ServiceConfig>,
    guard: Guard,
    store: Arc<dyn CaptureStore>,
    provider: Arc<dyn ModelProvider>,
    metrics: Arc<dyn Metrics>,
    policy: ResultPolicy,
}

impl DocumentService {
    pub fn builder(config: ServiceConfig) -> DocumentServiceBuilder {
        DocumentServiceBuilder {
            config,
            provider: None,
            store: None,
            limiter: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn lang(&self, tag: Option<&str>) -> Lang {
        tag.and_then(Lang::parse).unwrap_or(self.config.default_lang)
    }

    /// Count and log a model failure, then wrap it for the caller.
    fn model_failure(&self, e: ModelError) -> ApiError {
        self.metrics.incr(names::MODEL_ERROR);
        warn!("{}: {}", self.provider.name(), e);
        ApiError::UpstreamModel(e)
    }

    async fn load_capture(&self, id: &str) -> Result<Capture, ApiError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(ApiError::MissingField { field: "captureId" });
        }
        self.store.get(id).await?.ok_or(ApiError::CaptureNotFound)
    }

    fn vision_request(&self, image: &CaptureImage, prompt: String) -> VisionRequest {
        VisionRequest {
            model: self.config.model.clone(),
            prompt,
            image: ImageInput {
                base64: image.base64.clone(),
                mime: image.mime.clone(),
            },
        }
    }

    /// Store usage, for health checks.
    pub async fn health(&self) -> Result<StoreStats, ApiError> {
        Ok(self.store.stats().await?)
    }

    // ── Session ──────────────────────────────────────────────────────────

    /// Mint a session token. Requires the origin check only.
    pub async fn issue_session(&self, meta: &RequestMeta) -> Result<IssuedToken, ApiError> {
        self.guard.check(meta, &RoutePolicy::SESSION).await?;
        Ok(self.guard.signer().issue())
    }

    // ── Capture ──────────────────────────────────────────────────────────

    /// Validate and store an uploaded photo. Returns the capture id.
    pub async fn capture(&self, meta: &RequestMeta, req: &CaptureRequest) -> Result<String, ApiError> {
        self.guard.check(meta, &RoutePolicy::CAPTURE).await?;
        match self.store_capture(req).await {
            Ok(id) => {
                self.metrics.incr(names::CAPTURE_ACCEPTED);
                Ok(id)
            }
            Err(e) => {
                debug!("capture rejected: {}", e);
                self.metrics.incr(names::CAPTURE_REJECTED);
                Err(e)
            }
        }
    }

    async fn store_capture(&self, req: &CaptureRequest) -> Result<String, ApiError> {
        if req.image.trim().is_empty() {
            return Err(ApiError::MissingField { field: "image" });
        }
        let limits = ImageLimits::from(self.config.as_ref());
        let image = validate_image(&req.image, limits)?;
        let ocr_image = match req.ocr_image.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(url) => Some(CaptureImage::from(validate_image(url, limits)?)),
            None => None,
        };

        let capture = Capture::new(image.into(), ocr_image, now_ms());
        let id = capture.id.clone();
        let size = capture.byte_size();
        self.store.put(capture).await?;
        info!("Stored capture {} ({} bytes)", id, size);
        Ok(id)
    }

    // ── OCR ──────────────────────────────────────────────────────────────

    /// Transcribe the captured document. Uses the OCR-optimised image when
    /// one was uploaded.
    pub async fn ocr(&self, meta: &RequestMeta, req: &OcrRequest) -> Result<String, ApiError> {
        self.guard.check(meta, &RoutePolicy::OCR).await?;
        let capture = self.load_capture(&req.capture_id).await?;
        let request = self.vision_request(capture.ocr_source(), OCR_PROMPT.to_string());

        let reply = self
            .provider
            .analyze(&request)
            .await
            .map_err(|e| self.model_failure(e))?;

        let text = Sanitizer::shared().sanitize_capped(&clean_text(&ocr_text(&reply.raw)), OCR_MAX_CHARS);
        if text.text.is_empty() {
            return Err(self.model_failure(ModelError::EmptyAnswer));
        }
        self.metrics.incr(names::OCR_OK);
        Ok(text.text)
    }

    // ── Analyze ──────────────────────────────────────────────────────────

    /// Explain the captured document as five fixed cards.
    pub async fn analyze(&self, meta: &RequestMeta, req: &AnalyzeRequest) -> Result<AnalysisResult, ApiError> {
        self.guard.check(meta, &RoutePolicy::ANALYZE).await?;
        let lang = self.lang(req.lang.as_deref());
        let capture = self.load_capture(&req.capture_id).await?;
        let request = self.vision_request(&capture.image, analyze_prompt(lang));

        let start = Instant::now();
        let reply = self
            .provider
            .analyze(&request)
            .await
            .map_err(|e| self.model_failure(e))?;
        let raw = extract_json_object(&reply.raw).map_err(|e| self.model_failure(e))?;
        let built = build_result_with(&raw, &PromptDefaults::for_lang(lang), &self.policy);

        self.finish_analysis(&built, &capture.id, req.consume, start).await;
        Ok(built.result)
    }

    /// Streaming [`DocumentService::analyze`]: `card*` then `result`, or `error`.
    pub async fn analyze_stream(
        &self,
        meta: &RequestMeta,
        req: &AnalyzeRequest,
    ) -> Result<AnalyzeStream, ApiError> {
        self.guard.check(meta, &RoutePolicy::ANALYZE).await?;
        let lang = self.lang(req.lang.as_deref());
        let capture = self.load_capture(&req.capture_id).await?;
        let request = self.vision_request(&capture.image, analyze_prompt(lang));
        let capture_id = capture.id;
        let consume = req.consume;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(last) = this
                .produce_analysis(request, lang, &capture_id, consume, &tx)
                .await
            {
                let _ = tx.send(last).await;
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Drive the provider stream, emitting cards as they complete. Returns
    /// the terminal event, or `None` once the client is gone.
    async fn produce_analysis(
        &self,
        request: VisionRequest,
        lang: Lang,
        capture_id: &str,
        consume: bool,
        tx: &mpsc::Sender<AnalyzeEvent>,
    ) -> Option<AnalyzeEvent> {
        let start = Instant::now();
        let error = |e: ModelError| AnalyzeEvent::Error {
            message: self.model_failure(e).to_string(),
        };

        let mut chunks = match analyze_stream_or_fallback(self.provider.as_ref(), &request).await {
            Ok(s) => s,
            Err(e) => return Some(error(e)),
        };

        let mut buffer = String::new();
        let mut extractor = CardExtractor::new();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(delta) => buffer.push_str(&delta),
                Err(e) => return Some(error(e)),
            }
            for (id, raw) in extractor.feed(&buffer) {
                let (card, _) = shape_card(id, Some(&raw), lang, &self.policy, Sanitizer::shared());
                if tx.send(AnalyzeEvent::Card { card }).await.is_err() {
                    debug!("analyze stream: client disconnected");
                    return None;
                }
            }
        }

        let raw = match extract_json_object(&buffer) {
            Ok(v) => v,
            Err(e) => return Some(error(e)),
        };
        let built = build_result_with(&raw, &PromptDefaults::for_lang(lang), &self.policy);
        debug!("analyze stream: {} of 5 cards streamed early", extractor.emitted());
        self.finish_analysis(&built, capture_id, consume, start).await;
        Some(AnalyzeEvent::Result {
            result: built.result,
        })
    }

    async fn finish_analysis(&self, built: &BuiltResult, capture_id: &str, consume: bool, start: Instant) {
        let elapsed = start.elapsed().as_millis() as u64;
        self.metrics.incr(names::ANALYZE_OK);
        self.metrics.record_latency(names::ANALYZE_LATENCY_MS, elapsed);
        if built.stats.sanitized {
            self.metrics.incr(names::ANALYZE_SANITIZED);
        }
        if built.stats.confidence_low {
            self.metrics.incr(names::ANALYZE_LOW_CONFIDENCE);
        }
        info!(
            "Analyzed capture {} in {}ms (confidence {:.2})",
            capture_id, elapsed, built.result.confidence
        );

        if consume {
            if let Err(e) = self.store.delete(capture_id).await {
                warn!("failed to delete capture {}: {}", capture_id, e);
            }
        }
    }

    // ── Q&A ──────────────────────────────────────────────────────────────

    fn qa_request(&self, req: &QaRequest) -> Result<TextRequest, ApiError> {
        let c = &self.config;
        let question = req.question.trim();
        if question.is_empty() {
            return Err(ApiError::MissingField { field: "question" });
        }
        let len = question.chars().count();
        if len < c.question_min_chars || len > c.question_max_chars {
            return Err(ApiError::InvalidQuestion {
                min: c.question_min_chars,
                max: c.question_max_chars,
            });
        }

        let context = req.context.trim();
        if context.is_empty() {
            return Err(ApiError::MissingField { field: "context" });
        }
        if context.chars().count() > c.context_max_chars {
            return Err(ApiError::InvalidContext {
                max: c.context_max_chars,
            });
        }

        let lang = self.lang(req.lang.as_deref());
        Ok(TextRequest {
            model: c.model.clone(),
            prompt: qa_prompt(lang, context),
            question: question.to_string(),
        })
    }

    /// Answer a follow-up question about a document.
    pub async fn answer(&self, meta: &RequestMeta, req: &QaRequest) -> Result<String, ApiError> {
        self.guard.check(meta, &RoutePolicy::QA).await?;
        let request = self.qa_request(req)?;

        let start = Instant::now();
        let reply = self
            .provider
            .answer(&request)
            .await
            .map_err(|e| self.model_failure(e))?;
        let answer = Sanitizer::shared().sanitize_capped(&clean_text(&reply.raw), ANSWER_MAX_CHARS);
        if answer.text.is_empty() {
            return Err(self.model_failure(ModelError::EmptyAnswer));
        }

        self.metrics.incr(names::QA_OK);
        self.metrics
            .record_latency(names::QA_LATENCY_MS, start.elapsed().as_millis() as u64);
        Ok(answer.text)
    }

    /// Streaming [`DocumentService::answer`]: `delta*` then `done`, or `error`.
    pub async fn answer_stream(&self, meta: &RequestMeta, req: &QaRequest) -> Result<QaStream, ApiError> {
        self.guard.check(meta, &RoutePolicy::QA).await?;
        let request = self.qa_request(req)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(last) = this.produce_answer(request, &tx).await {
                let _ = tx.send(last).await;
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn produce_answer(&self, request: TextRequest, tx: &mpsc::Sender<QaEvent>) -> Option<QaEvent> {
        let start = Instant::now();
        let error = |e: ModelError| QaEvent::Error {
            message: self.model_failure(e).to_string(),
        };

        let mut chunks = match answer_stream_or_fallback(self.provider.as_ref(), &request).await {
            Ok(s) => s,
            Err(e) => return Some(error(e)),
        };

        let mut sanitizer = StreamingSanitizer::new(Sanitizer::shared());
        let mut out = DeltaBudget::new(ANSWER_MAX_CHARS);
        while let Some(chunk) = chunks.next().await {
            let delta = match chunk {
                Ok(d) => d,
                Err(e) => return Some(error(e)),
            };
            if let Some(text) = sanitizer.push(&delta).and_then(|s| out.admit(s)) {
                if tx.send(QaEvent::Delta { text }).await.is_err() {
                    debug!("qa stream: client disconnected");
                    return None;
                }
            }
        }
        if let Some(text) = sanitizer.finish().and_then(|s| out.admit(s)) {
            if tx.send(QaEvent::Delta { text }).await.is_err() {
                return None;
            }
        }

        if !out.started {
            return Some(error(ModelError::EmptyAnswer));
        }
        self.metrics.incr(names::QA_OK);
        self.metrics
            .record_latency(names::QA_LATENCY_MS, start.elapsed().as_millis() as u64);
        Some(QaEvent::Done)
    }
}

/// Character budget for a streamed answer. Leading whitespace is dropped;
/// the segment that crosses the cap is cut and ends with an ellipsis.
struct DeltaBudget {
    remaining: usize,
    started: bool,
}

impl DeltaBudget {
    fn new(max_chars: usize) -> Self {
        Self {
            remaining: max_chars,
            started: false,
        }
    }

    fn admit(&mut self, segment: String) -> Option<String> {
        if self.remaining == 0 {
            return None;
        }
        let segment = if self.started {
            segment
        } else {
            segment.trim_start().to_string()
        };
        if segment.is_empty() {
            return None;
        }
        self.started = true;

        let len = segment.chars().count();
        if len <= self.remaining {
            self.remaining -= len;
            return Some(segment);
        }
        let mut cut: String = segment.chars().take(self.remaining.saturating_sub(1)).collect();
        cut.push(ELLIPSIS);
        self.remaining = 0;
        Some(cut)
    }
}

/// OCR replies are `{"text": ...}` or plain text.
fn ocr_text(raw: &str) -> String {
    extract_json_object(raw)
        .ok()
        .and_then(|v| v.get("text").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}

// ── Assembly ─────────────────────────────────────────────────────────────────

/// Assembles a [`DocumentService`], defaulting every collaborator not set
/// explicitly: Redis-backed when `redis_url` is configured, in-memory
/// otherwise; the provider from [`EdgequakeProvider::from_config`].
pub struct DocumentServiceBuilder {
    config: ServiceConfig,
    provider: Option<Arc<dyn ModelProvider>>,
    store: Option<Arc<dyn CaptureStore>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    metrics: Option<Arc<dyn Metrics>>,
}

impl DocumentServiceBuilder {
    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn store(mut self, store: Arc<dyn CaptureStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<DocumentService, ConfigError> {
        let config = self.config;
        let remote = |e: redis::RedisError| ConfigError::Invalid(format!("redis: {e}"));

        let metrics: Arc<dyn Metrics> = match (self.metrics, &config.redis_url) {
            (Some(m), _) => m,
            (None, Some(url)) => Arc::new(RedisMetrics::new(url, &config.redis_prefix).map_err(remote)?),
            (None, None) => Arc::new(MemoryMetrics::new()),
        };

        let store: Arc<dyn CaptureStore> = match (self.store, &config.redis_url) {
            (Some(s), _) => s,
            (None, Some(url)) => Arc::new(
                RedisCaptureStore::new(url, &config.redis_prefix, config.capture_ttl_secs)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            ),
            (None, None) => Arc::new(MemoryCaptureStore::new(
                config.capture_ttl_secs,
                config.max_captures,
                config.max_store_bytes,
            )),
        };

        let limiter: Arc<dyn RateLimiter> = match (self.limiter, &config.redis_url) {
            (Some(l), _) => l,
            (None, Some(url)) => Arc::new(
                RedisRateLimiter::new(
                    url,
                    &config.redis_prefix,
                    config.rate_limit_max,
                    config.rate_limit_window_secs,
                    Arc::clone(&metrics),
                )
                .map_err(remote)?,
            ),
            (None, None) => Arc::new(MemoryRateLimiter::new(
                config.rate_limit_max,
                config.rate_limit_window_secs,
            )),
        };

        let signer = match &config.session_secret {
            Some(secret) => SessionSigner::new(secret, config.session_ttl_secs),
            None => {
                warn!("No session secret configured; using a random one (tokens will not survive a restart)");
                SessionSigner::random(config.session_ttl_secs)
            }
        };

        let provider: Arc<dyn ModelProvider> = match self.provider {
            Some(p) => p,
            None => Arc::new(
                EdgequakeProvider::from_config(&config)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            ),
        };

        info!(
            "Service ready: provider={}, backend={}, origin={}",
            provider.name(),
            if config.redis_url.is_some() { "redis" } else { "memory" },
            config.allowed_origin.as_deref().unwrap_or("<loopback only>")
        );

        let guard = Guard::new(config.allowed_origin.clone(), signer, limiter, Arc::clone(&metrics));
        let policy = ResultPolicy::from(&config);
        Ok(DocumentService {
            config: Arc::new(config),
            guard,
            store,
            provider,
            metrics,
            policy,
        })
    }
}
