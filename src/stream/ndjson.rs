//! Newline-delimited JSON: one event per line.
//!
//! [`encode_line`] is the writer: one compact JSON value followed by `\n`.
//! [`NdjsonDecoder`] is the push-side reader: feed it transport chunks as
//! they arrive and it returns every line completed so far. [`read_ndjson`]
//! wraps it into a pull-based stream over any byte stream (for example
//! `reqwest::Response::bytes_stream`).
//!
//! Chunk boundaries are arbitrary: a line, or a multi-byte UTF-8 character,
//! may be split across chunks. Bytes are buffered raw and only decoded once a
//! full line is present, so no event is lost or duplicated. A final line
//! without a trailing newline is yielded when the input ends.

use crate::error::NdjsonError;
use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::marker::PhantomData;

/// Serialize `event` as one NDJSON line, newline included.
pub fn encode_line<T: Serialize>(event: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

/// Incremental NDJSON decoder.
#[derive(Debug)]
pub struct NdjsonDecoder<T> {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to contain no newline.
    scanned: usize,
    /// Lines consumed so far, blank ones included.
    line: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for NdjsonDecoder<T> {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            line: 0,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> NdjsonDecoder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and decode every line it completes.
    ///
    /// Blank lines are skipped. A line that fails to decode yields an
    /// [`NdjsonError::InvalidLine`] in its place; decoding continues.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<T, NdjsonError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(rel) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + rel;
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            self.scanned = 0;
            self.line += 1;
            if let Some(item) = self.decode(&line[..line.len() - 1]) {
                out.push(item);
            }
        }
        self.scanned = self.buf.len();
        out
    }

    /// Decode the unterminated remainder, if any. Call once the input ends.
    pub fn finish(&mut self) -> Option<Result<T, NdjsonError>> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        self.line += 1;
        self.decode(&rest)
    }

    /// Bytes buffered without a newline yet.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    fn decode(&self, raw: &[u8]) -> Option<Result<T, NdjsonError>> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(
            serde_json::from_slice(raw).map_err(|source| NdjsonError::InvalidLine {
                line: self.line,
                source,
            }),
        )
    }
}

/// Pull-based NDJSON reader over a fallible byte stream.
///
/// Yields events in line order. A transport error is yielded once as
/// [`NdjsonError::Transport`] and ends the stream.
pub fn read_ndjson<T, S, B, E>(bytes: S) -> impl Stream<Item = Result<T, NdjsonError>>
where
    T: DeserializeOwned,
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    struct State<T, S> {
        bytes: S,
        decoder: NdjsonDecoder<T>,
        pending: VecDeque<Result<T, NdjsonError>>,
        done: bool,
    }

    let state = State {
        bytes,
        decoder: NdjsonDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let decoded = st.decoder.push(chunk.as_ref());
                    st.pending.extend(decoded);
                }
                Some(Err(e)) => {
                    st.done = true;
                    st.pending
                        .push_back(Err(NdjsonError::Transport(e.to_string())));
                }
                None => {
                    st.done = true;
                    st.pending.extend(st.decoder.finish());
                }
            }
        }
    })
}
