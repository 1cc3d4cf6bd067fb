//! Streaming wire protocol: events emitted while a model is still generating.
//!
//! ## Why stream?
//!
//! A document explanation takes several seconds. Emitting each card as soon
//! as its JSON object is complete lets the client render the first card while
//! the model is still writing the rest, and Q&A answers appear word by word.
//!
//! Both protocols are newline-delimited JSON ([`ndjson`]) carrying one event
//! per line. Every stream ends with exactly one terminal event (`result` /
//! `done`, or `error`), and nothing follows it.
//!
//! ```text
//! {"type":"card","card":{"id":"whatIs","title":"…","text":"…"}}
//! {"type":"card","card":{"id":"dates","title":"…","text":"…"}}
//! {"type":"result","result":{"confidence":0.8,"cards":[…],"notice":"…"}}
//! ```

pub mod cards;
pub mod ndjson;

use crate::pipeline::postprocess::{AnalysisResult, Card};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// One event of the streaming analyze protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AnalyzeEvent {
    /// A card whose JSON object just became complete.
    Card { card: Card },
    /// Terminal: the full shaped result.
    Result { result: AnalysisResult },
    /// Terminal: the analysis failed.
    Error { message: String },
}

/// One event of the streaming Q&A protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QaEvent {
    /// A sanitized chunk of the answer.
    Delta { text: String },
    /// Terminal: the answer is complete.
    Done,
    /// Terminal: the answer failed.
    Error { message: String },
}

/// Events that can end a stream.
pub trait StreamEvent {
    fn is_terminal(&self) -> bool;
}

impl StreamEvent for AnalyzeEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, AnalyzeEvent::Card { .. })
    }
}

impl StreamEvent for QaEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, QaEvent::Delta { .. })
    }
}

/// A boxed stream of analyze events.
pub type AnalyzeStream = Pin<Box<dyn Stream<Item = AnalyzeEvent> + Send>>;

/// A boxed stream of Q&A events.
pub type QaStream = Pin<Box<dyn Stream<Item = QaEvent> + Send>>;

/// Pass events through up to and including the first terminal one.
pub fn until_terminal<S, T>(events: S) -> impl Stream<Item = T>
where
    S: Stream<Item = T>,
    T: StreamEvent,
{
    events
        .scan(false, |finished, event| {
            if *finished {
                return futures::future::ready(None);
            }
            *finished = event.is_terminal();
            futures::future::ready(Some(event))
        })
        .fuse()
}

/// A stream consisting of a single `error` event.
pub fn analyze_error(message: impl Into<String>) -> AnalyzeStream {
    Box::pin(stream::iter(vec![AnalyzeEvent::Error {
        message: message.into(),
    }]))
}

/// A stream consisting of a single `error` event.
pub fn qa_error(message: impl Into<String>) -> QaStream {
    Box::pin(stream::iter(vec![QaEvent::Error {
        message: message.into(),
    }]))
}
