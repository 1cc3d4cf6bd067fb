//! Partial-JSON card extractor.
//!
//! The analyze model writes one JSON document token by token:
//!
//! ```text
//! {"confidence":0.8,"cards":[{"id":"whatIs","text":"…"},{"id":"whatSays", …
//! ```
//!
//! [`CardExtractor`] is fed the growing buffer after every chunk and returns
//! each card object the moment its closing brace arrives. It tracks string
//! literal state (honouring backslash escapes) so braces inside card text are
//! ignored, and a stack of open-brace offsets so every complete object, at
//! any depth, is tried as JSON. Objects that do not parse, have no known
//! card `id`, or repeat an id already emitted are skipped.
//!
//! Scanning resumes where the previous call stopped, so feeding a buffer one
//! character at a time stays linear in the buffer length.

use crate::prompts::CardId;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Incremental scanner over an append-only JSON buffer.
#[derive(Debug, Default)]
pub struct CardExtractor {
    seen: HashSet<CardId>,
    /// Byte offset where the next scan starts.
    pos: usize,
    in_string: bool,
    escaped: bool,
    /// Byte offsets of currently open `{`.
    open: Vec<usize>,
}

impl CardExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct cards emitted so far.
    pub fn emitted(&self) -> usize {
        self.seen.len()
    }

    pub fn has_seen(&self, id: CardId) -> bool {
        self.seen.contains(&id)
    }

    /// Scan the new tail of `buffer` and return cards completed in it, in
    /// completion order.
    ///
    /// `buffer` must extend the buffer passed on the previous call. A shorter
    /// buffer restarts the scan from the beginning (already-seen ids are
    /// still suppressed).
    pub fn feed(&mut self, buffer: &str) -> Vec<(CardId, Value)> {
        if buffer.len() < self.pos {
            debug!("card extractor: buffer shrank, rescanning");
            self.pos = 0;
            self.in_string = false;
            self.escaped = false;
            self.open.clear();
        }

        let bytes = buffer.as_bytes();
        let mut found = Vec::new();

        for i in self.pos..bytes.len() {
            let b = bytes[i];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' => self.open.push(i),
                b'}' => {
                    if let Some(start) = self.open.pop() {
                        if let Some(card) = self.try_card(&buffer[start..=i]) {
                            found.push(card);
                        }
                    }
                }
                _ => {}
            }
        }

        self.pos = bytes.len();
        found
    }

    fn try_card(&mut self, candidate: &str) -> Option<(CardId, Value)> {
        let value: Value = serde_json::from_str(candidate).ok()?;
        let id = value.get("id").and_then(Value::as_str).and_then(CardId::parse)?;
        if !self.seen.insert(id) {
            return None;
        }
        Some((id, value))
    }
}
