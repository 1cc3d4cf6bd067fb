//! # plainpaper
//!
//! Explain photographed bureaucratic documents (fines, tax letters, official
//! notices) in plain language using Vision Language Models.
//!
//! ## Why this crate?
//!
//! The people who most need a letter explained are the least able to judge
//! what a model tells them. Raw model output can echo tax IDs and phone
//! numbers back, issue commands ("you must pay immediately"), drop fields,
//! or invent extra ones. This crate sits between the HTTP routes and the
//! model provider and makes sure every response has the same shape: five
//! fixed cards, identifiers redacted, directive language softened, and a
//! confidence that drops whenever the output had to be altered.
//!
//! ## Pipeline Overview
//!
//! ```text
//! photo (data URL)
//!  │
//!  ├─ 1. Guard     origin ─▶ HMAC session token ─▶ fixed-window rate limit
//!  ├─ 2. Validate  MIME sniffing, size bounds
//!  ├─ 3. Store     ephemeral capture store (memory or Redis, TTL)
//!  ├─ 4. VLM       analyze / OCR / answer via edgequake-llm, with retry
//!  ├─ 5. Extract   JSON object, or cards one by one from a partial stream
//!  ├─ 6. Shape     exactly five cards, sanitized and capped
//!  └─ 7. Deliver   JSON, or NDJSON events (card*/result, delta*/done)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use plainpaper::{DocumentService, RequestMeta, ServiceConfig};
//! use plainpaper::service::{AnalyzeRequest, CaptureRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ServiceConfig::builder().session_secret("change-me").build()?;
//!     let service = DocumentService::builder(config).build()?;
//!
//!     let token = service.issue_session(&RequestMeta::default()).await?.token;
//!     let meta = RequestMeta { session_token: Some(token), ..Default::default() };
//!
//!     let image = std::fs::read_to_string("letter.dataurl")?;
//!     let id = service.capture(&meta, &CaptureRequest { image, ocr_image: None }).await?;
//!     let result = service
//!         .analyze(&meta, &AnalyzeRequest { capture_id: id, lang: Some("en".into()), consume: true })
//!         .await?;
//!     for card in &result.cards {
//!         println!("## {}\n{}\n", card.title, card.text);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `server` | on      | The [`http`] router and the `plainpaper` binary (axum + clap + anyhow + tracing-subscriber) |
//!
//! Disable `server` when embedding the service or using only the client:
//! ```toml
//! plainpaper = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod client;
pub mod config;
pub mod error;
pub mod guard;
#[cfg(feature = "server")]
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod service;
pub mod store;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use client::PlainpaperClient;
pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use error::{ApiError, ClientError, ConfigError, ModelError, NdjsonError, StoreError, TokenError};
pub use guard::{Guard, RequestMeta, RoutePolicy};
pub use pipeline::llm::{EdgequakeProvider, ModelProvider};
pub use pipeline::postprocess::{AnalysisResult, Card};
pub use pipeline::sanitize::{sanitize, Sanitizer};
pub use prompts::{CardId, Lang};
pub use service::{DocumentService, DocumentServiceBuilder};
pub use stream::{AnalyzeEvent, QaEvent};
