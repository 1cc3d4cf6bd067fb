//! Model provider abstraction and the edgequake-llm adapter.
//!
//! The service talks to models only through [`ModelProvider`]: a single-shot
//! `analyze` (image → raw text) and `answer` (question → text), plus optional
//! streaming variants. Callers must treat streaming as optional and fall back
//! to the single-shot call wrapped in a one-element stream; see
//! [`analyze_stream_or_fallback`] and [`answer_stream_or_fallback`].
//!
//! ## Retry Strategy
//!
//! [`EdgequakeProvider`] retries failed chat calls with exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`): with 400 ms base and 2 retries the
//! wait sequence is 400 ms → 800 ms.
//!
//! ## Streaming
//!
//! Streaming calls go through edgequake-llm's chat stream with no tools, so
//! image messages keep their roles. Only content chunks are forwarded. A
//! provider that cannot stream, or whose stream request fails, yields `None`
//! and the caller falls back to the retried single-shot call.

use crate::config::ServiceConfig;
use crate::error::ModelError;
use async_trait::async_trait;
use edgequake_llm::traits::StreamChunk;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Incremental text produced by a streaming provider call.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

/// Base64 image sent to a vision model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub base64: String,
    pub mime: String,
}

/// Image + instructions.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub model: Option<String>,
    pub prompt: String,
    pub image: ImageInput,
}

/// Instructions + user question.
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub model: Option<String>,
    pub prompt: String,
    pub question: String,
}

/// Accounting for one provider call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyMeta {
    pub provider: String,
    pub model: Option<String>,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub duration_ms: u64,
    pub retries: u32,
}

/// Raw reply text and its accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub raw: String,
    pub meta: ReplyMeta,
}

/// An LLM backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Short provider label used in logs and metrics.
    fn name(&self) -> &str;

    /// Send a document photo with instructions; returns the raw reply text.
    async fn analyze(&self, request: &VisionRequest) -> Result<ModelReply, ModelError>;

    /// Streaming `analyze`. `None` when the provider cannot stream.
    async fn analyze_stream(
        &self,
        request: &VisionRequest,
    ) -> Option<Result<TextStream, ModelError>> {
        let _ = request;
        None
    }

    /// Answer a text question.
    async fn answer(&self, request: &TextRequest) -> Result<ModelReply, ModelError>;

    /// Streaming `answer`. `None` when the provider cannot stream.
    async fn answer_stream(&self, request: &TextRequest) -> Option<Result<TextStream, ModelError>> {
        let _ = request;
        None
    }
}

fn single_item(text: String) -> TextStream {
    Box::pin(stream::iter(vec![Ok(text)]))
}

/// Stream `analyze` output, falling back to a one-element stream.
pub async fn analyze_stream_or_fallback(
    provider: &dyn ModelProvider,
    request: &VisionRequest,
) -> Result<TextStream, ModelError> {
    match provider.analyze_stream(request).await {
        Some(result) => result,
        None => {
            debug!("{}: no streaming analyze, using single-shot", provider.name());
            let reply = provider.analyze(request).await?;
            Ok(single_item(reply.raw))
        }
    }
}

/// Stream `answer` output, falling back to a one-element stream.
pub async fn answer_stream_or_fallback(
    provider: &dyn ModelProvider,
    request: &TextRequest,
) -> Result<TextStream, ModelError> {
    match provider.answer_stream(request).await {
        Some(result) => result,
        None => {
            debug!("{}: no streaming answer, using single-shot", provider.name());
            let reply = provider.answer(request).await?;
            Ok(single_item(reply.raw))
        }
    }
}

// ── edgequake-llm adapter ────────────────────────────────────────────────────

/// [`ModelProvider`] backed by any edgequake-llm chat provider
/// (OpenAI, Anthropic, Gemini, Mistral, Ollama, …).
pub struct EdgequakeProvider {
    inner: Arc<dyn LLMProvider>,
    label: String,
    model: Option<String>,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl std::fmt::Debug for EdgequakeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgequakeProvider")
            .field("label", &self.label)
            .field("model", &self.model)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl EdgequakeProvider {
    /// Wrap a pre-constructed provider.
    pub fn new(inner: Arc<dyn LLMProvider>, label: impl Into<String>, config: &ServiceConfig) -> Self {
        Self {
            inner,
            label: label.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    /// Resolve the provider from config, then from the environment.
    ///
    /// Order: `provider_name` → `OPENAI_API_KEY` → edgequake-llm auto-detection.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ModelError> {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-mini");

        if let Some(ref name) = config.provider_name {
            let inner = create_provider(name, model)?;
            return Ok(Self::new(inner, name.clone(), config));
        }

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                let inner = create_provider("openai", model)?;
                return Ok(Self::new(inner, "openai", config));
            }
        }

        let (inner, _) = ProviderFactory::from_env().map_err(|e| ModelError::NotConfigured {
            provider: "auto".to_string(),
            hint: format!("No LLM provider auto-detected: {e}"),
        })?;
        Ok(Self::new(inner, "auto", config))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }

    async fn chat_with_retry(&self, messages: Vec<ChatMessage>) -> Result<ModelReply, ModelError> {
        let start = Instant::now();
        let options = self.options();
        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    self.label, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.inner.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    let duration = start.elapsed();
                    debug!(
                        "{}: {} input tokens, {} output tokens, {:?}",
                        self.label, response.prompt_tokens, response.completion_tokens, duration
                    );
                    return Ok(ModelReply {
                        raw: response.content,
                        meta: ReplyMeta {
                            provider: self.label.clone(),
                            model: self.model.clone(),
                            input_tokens: response.prompt_tokens,
                            output_tokens: response.completion_tokens,
                            duration_ms: duration.as_millis() as u64,
                            retries: attempt,
                        },
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    warn!("{}: attempt {} failed: {}", self.label, attempt + 1, msg);
                    last_err = Some(msg);
                }
            }
        }

        Err(ModelError::Provider {
            retries: self.max_retries,
            detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
        })
    }

    /// Open a content stream, or `None` to use the single-shot path.
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Option<Result<TextStream, ModelError>> {
        if !self.inner.supports_streaming() {
            return None;
        }
        let options = self.options();
        let chunks = match self
            .inner
            .chat_with_tools_stream(&messages, &[], None, Some(&options))
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("{}: stream unavailable, using single-shot: {}", self.label, e);
                return None;
            }
        };

        let label = self.label.clone();
        let text = chunks.filter_map(move |chunk| {
            let item = match chunk {
                Ok(StreamChunk::Content(text)) if !text.is_empty() => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => {
                    warn!("{}: stream failed: {}", label, e);
                    Some(Err(ModelError::Provider {
                        retries: 0,
                        detail: e.to_string(),
                    }))
                }
            };
            async move { item }
        });
        Some(Ok(Box::pin(text)))
    }
}

fn vision_messages(request: &VisionRequest) -> Vec<ChatMessage> {
    let image =
        ImageData::new(request.image.base64.clone(), request.image.mime.clone()).with_detail("high");
    vec![
        ChatMessage::system(request.prompt.as_str()),
        ChatMessage::user_with_images("", vec![image]),
    ]
}

fn text_messages(request: &TextRequest) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(request.prompt.as_str()),
        ChatMessage::user(request.question.as_str()),
    ]
}

#[async_trait]
impl ModelProvider for EdgequakeProvider {
    fn name(&self) -> &str {
        &self.label
    }

    async fn analyze(&self, request: &VisionRequest) -> Result<ModelReply, ModelError> {
        self.chat_with_retry(vision_messages(request)).await
    }

    async fn analyze_stream(
        &self,
        request: &VisionRequest,
    ) -> Option<Result<TextStream, ModelError>> {
        self.chat_stream(vision_messages(request)).await
    }

    async fn answer(&self, request: &TextRequest) -> Result<ModelReply, ModelError> {
        self.chat_with_retry(text_messages(request)).await
    }

    async fn answer_stream(&self, request: &TextRequest) -> Option<Result<TextStream, ModelError>> {
        self.chat_stream(text_messages(request)).await
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ModelError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| ModelError::NotConfigured {
        provider: name.to_string(),
        hint: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgequake_llm::{LLMResponse, LlmError};
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SingleShot {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelProvider for SingleShot {
        fn name(&self) -> &str {
            "single-shot"
        }

        async fn analyze(&self, _request: &VisionRequest) -> Result<ModelReply, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModelReply {
                raw: "{\"confidence\": 1}".into(),
                meta: ReplyMeta::default(),
            })
        }

        async fn answer(&self, _request: &TextRequest) -> Result<ModelReply, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModelReply {
                raw: "The fine is 100 euros.".into(),
                meta: ReplyMeta::default(),
            })
        }
    }

    fn text_request() -> TextRequest {
        TextRequest {
            model: None,
            prompt: "p".into(),
            question: "How much?".into(),
        }
    }

    #[tokio::test]
    async fn answer_falls_back_to_single_element_stream() {
        let p = SingleShot {
            calls: AtomicUsize::new(0),
        };
        let items: Vec<_> = answer_stream_or_fallback(&p, &text_request())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_deref().unwrap(), "The fine is 100 euros.");
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn analyze_falls_back_to_single_element_stream() {
        let p = SingleShot {
            calls: AtomicUsize::new(0),
        };
        let request = VisionRequest {
            model: None,
            prompt: "p".into(),
            image: ImageInput {
                base64: "AAAA".into(),
                mime: "image/png".into(),
            },
        };
        let items: Vec<_> = analyze_stream_or_fallback(&p, &request)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 1);
    }

    /// edgequake-llm backend that streams `parts` as content chunks.
    struct Chunked {
        parts: Vec<&'static str>,
        streaming: bool,
        stream_calls: AtomicUsize,
        chat_calls: AtomicUsize,
    }

    impl Chunked {
        fn new(parts: Vec<&'static str>, streaming: bool) -> Arc<Self> {
            Arc::new(Self {
                parts,
                streaming,
                stream_calls: AtomicUsize::new(0),
                chat_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LLMProvider for Chunked {
        fn name(&self) -> &str {
            "chunked"
        }

        fn model(&self) -> &str {
            "chunked-1"
        }

        fn max_context_length(&self) -> usize {
            8192
        }

        async fn complete(&self, _prompt: &str) -> edgequake_llm::Result<LLMResponse> {
            Ok(LLMResponse::new(self.parts.concat(), "chunked-1"))
        }

        async fn complete_with_options(
            &self,
            prompt: &str,
            _options: &CompletionOptions,
        ) -> edgequake_llm::Result<LLMResponse> {
            self.complete(prompt).await
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: Option<&CompletionOptions>,
        ) -> edgequake_llm::Result<LLMResponse> {
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            Ok(LLMResponse::new(self.parts.concat(), "chunked-1"))
        }

        async fn chat_with_tools_stream(
            &self,
            _messages: &[ChatMessage],
            _tools: &[edgequake_llm::ToolDefinition],
            _tool_choice: Option<edgequake_llm::ToolChoice>,
            _options: Option<&CompletionOptions>,
        ) -> edgequake_llm::Result<BoxStream<'static, edgequake_llm::Result<StreamChunk>>> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            if !self.streaming {
                return Err(LlmError::NotSupported("no streaming".into()));
            }
            let mut chunks: Vec<edgequake_llm::Result<StreamChunk>> = self
                .parts
                .iter()
                .map(|p| Ok(StreamChunk::Content(p.to_string())))
                .collect();
            chunks.push(Ok(StreamChunk::Finished {
                reason: "stop".into(),
                ttft_ms: None,
            }));
            Ok(stream::iter(chunks).boxed())
        }

        fn supports_streaming(&self) -> bool {
            true
        }
    }

    fn quick_config() -> ServiceConfig {
        ServiceConfig::builder().max_retries(0).build().unwrap()
    }

    #[tokio::test]
    async fn edgequake_answer_streams_content_chunks() {
        let inner = Chunked::new(vec!["The fine ", "is 90 ", "euros."], true);
        let provider = EdgequakeProvider::new(inner.clone(), "chunked", &quick_config());

        let items: Vec<String> = answer_stream_or_fallback(&provider, &text_request())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec!["The fine ", "is 90 ", "euros."]);
        assert_eq!(inner.stream_calls.load(Ordering::SeqCst), 1);
        assert_eq!(inner.chat_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn edgequake_analyze_streams_content_chunks() {
        let inner = Chunked::new(vec!["{\"cards\": [", "{\"id\": \"whatIs\"}", "]}"], true);
        let provider = EdgequakeProvider::new(inner.clone(), "chunked", &quick_config());
        let request = VisionRequest {
            model: None,
            prompt: "p".into(),
            image: ImageInput {
                base64: "AAAA".into(),
                mime: "image/png".into(),
            },
        };

        let items: Vec<_> = analyze_stream_or_fallback(&provider, &request)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert_eq!(inner.chat_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn edgequake_stream_refusal_falls_back_to_chat() {
        let inner = Chunked::new(vec!["The fine ", "is 90 euros."], false);
        let provider = EdgequakeProvider::new(inner.clone(), "chunked", &quick_config());

        let items: Vec<_> = answer_stream_or_fallback(&provider, &text_request())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_deref().unwrap(), "The fine is 90 euros.");
        assert_eq!(inner.chat_calls.load(Ordering::SeqCst), 1);
    }
}
