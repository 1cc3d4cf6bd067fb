//! Pipeline stages between an uploaded photo and the text shown to the user.
//!
//! Each submodule implements exactly one transformation step and is
//! independently testable.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ llm ──▶ postprocess ──▶ sanitize
//! (data URL) (model)  (5 cards)     (redact + soften)
//! ```
//!
//! 1. [`input`]: parse the data URL, sniff magic bytes, enforce size limits
//! 2. [`llm`]: drive the provider call with retry/backoff; the only stage
//!    with network I/O
//! 3. [`postprocess`]: extract the JSON object and shape it into exactly
//!    five cards, a clamped confidence and a notice
//! 4. [`sanitize`]: redact personal identifiers and soften directive
//!    language in every piece of model text

pub mod input;
pub mod llm;
pub mod postprocess;
pub mod sanitize;
