//! Server-Sent Events decoding.
//!
//! [`SseDecoder`] is an incremental line scanner: push bytes as they arrive
//! and pull completed events out. [`dispatch`] drives it off a byte stream
//! and hands each event to an [`EventHandler`] the moment its terminating
//! blank line is seen. [`parse`] does the same for an in-memory buffer.
//!
//! Record rules:
//! - `data: `, `event: `, `id: ` and `retry: ` lines assign the matching
//!   field; a repeated field overwrites the earlier value.
//! - Any other line (including `:` comments) is ignored.
//! - A blank line completes the record. Only records with a non-empty
//!   `event` or `data` are emitted.
//! - A record still open when the input ends is discarded.

use std::collections::VecDeque;
use std::pin::{Pin, pin};

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::handler::EventHandler;

/// Longest line the decoder accepts by default.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024 * 1024;

/// A pull-based stream of decoded events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent>> + Send + 'static>>;

/// One SSE record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<String>,
}

impl SseEvent {
    /// An event with only a data field.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// An event with a type and data.
    pub fn with_event(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// True when neither `event` nor `data` carries anything.
    pub fn is_empty(&self) -> bool {
        self.event.as_deref().unwrap_or_default().is_empty()
            && self.data.as_deref().unwrap_or_default().is_empty()
    }

    /// Event type, or `""`.
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or_default()
    }

    /// Data payload, or `""`.
    pub fn payload(&self) -> &str {
        self.data.as_deref().unwrap_or_default()
    }
}

/// Incremental SSE line scanner.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already consumed.
    cursor: usize,
    current: SseEvent,
    max_line_len: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    /// A decoder that fails on lines longer than `max_line_len` bytes.
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            current: SseEvent::default(),
            max_line_len,
        }
    }

    /// Append raw bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.cursor > 0 {
            self.buffer.drain(..self.cursor);
            self.cursor = 0;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Next completed event from the bytes pushed so far.
    ///
    /// Returns `Ok(None)` once every complete line has been consumed.
    pub fn next_event(&mut self) -> Result<Option<SseEvent>> {
        while let Some(offset) = self.buffer[self.cursor..].iter().position(|b| *b == b'\n') {
            let start = self.cursor;
            let mut end = start + offset;
            self.cursor = end + 1;

            if end > start && self.buffer[end - 1] == b'\r' {
                end -= 1;
            }
            if end - start > self.max_line_len {
                return Err(self.line_too_long());
            }

            let raw = &self.buffer[start..end];
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line.to_owned(),
                Err(_) => {
                    tracing::warn!("SSE line contained invalid UTF-8, decoding lossily");
                    String::from_utf8_lossy(raw).into_owned()
                }
            };

            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }

        if self.buffer.len() - self.cursor > self.max_line_len {
            return Err(self.line_too_long());
        }
        Ok(None)
    }

    /// Push a chunk and collect every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>> {
        self.push(chunk);
        let mut events = Vec::new();
        while let Some(event) = self.next_event()? {
            events.push(event);
        }
        Ok(events)
    }

    /// Signal end of input, dropping any unterminated record.
    pub fn finish(&mut self) {
        let pending = self.buffer.len() - self.cursor;
        if pending > 0 || !self.current.is_empty() {
            tracing::debug!(
                pending_bytes = pending,
                "Discarding unterminated SSE record at end of stream"
            );
        }
        self.buffer.clear();
        self.cursor = 0;
        self.current = SseEvent::default();
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.current.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.current));
        }

        if let Some(value) = line.strip_prefix("data: ") {
            self.current.data = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("event: ") {
            self.current.event = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("id: ") {
            self.current.id = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("retry: ") {
            self.current.retry = Some(value.to_string());
        }
        None
    }

    fn line_too_long(&self) -> Error {
        Error::Stream(format!("SSE line exceeds {} bytes", self.max_line_len))
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a byte stream and deliver each event to `handler`.
///
/// Delivery is fail-fast: the first handler error stops the scan. Any error
/// (handler, byte stream or scanner) is passed to `on_error` and returned.
/// `on_complete` runs exactly once, last, on every path.
pub async fn dispatch<S, H>(stream: S, handler: &mut H) -> Result<()>
where
    S: Stream<Item = Result<Bytes>>,
    H: EventHandler + ?Sized,
{
    dispatch_until(stream, handler, None).await
}

/// Like [`dispatch`], over a fully buffered body.
pub async fn parse<H>(buffer: &[u8], handler: &mut H) -> Result<()>
where
    H: EventHandler + ?Sized,
{
    let chunk = Bytes::copy_from_slice(buffer);
    dispatch(futures::stream::once(async move { Ok(chunk) }), handler).await
}

/// [`dispatch`] that also stops with [`Error::Cancelled`] when `cancel` fires.
pub(crate) async fn dispatch_until<S, H>(
    stream: S,
    handler: &mut H,
    cancel: Option<&CancellationToken>,
) -> Result<()>
where
    S: Stream<Item = Result<Bytes>>,
    H: EventHandler + ?Sized,
{
    let outcome = pump(stream, handler, cancel).await;
    if let Err(err) = &outcome {
        tracing::debug!(error = %err, "SSE stream ended with error");
        handler.on_error(err).await;
    }
    handler.on_complete().await;
    outcome
}

async fn pump<S, H>(stream: S, handler: &mut H, cancel: Option<&CancellationToken>) -> Result<()>
where
    S: Stream<Item = Result<Bytes>>,
    H: EventHandler + ?Sized,
{
    let mut stream = pin!(stream);
    let mut decoder = SseDecoder::new();
    let mut delivered = 0usize;

    loop {
        let next = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                item = stream.next() => item,
            },
            None => stream.next().await,
        };
        let Some(chunk) = next else {
            break;
        };

        decoder.push(&chunk?);
        while let Some(event) = decoder.next_event()? {
            tracing::trace!(event = %event.event_type(), id = ?event.id, "Dispatching SSE event");
            handler.on_event(event).await?;
            delivered += 1;
        }
    }

    decoder.finish();
    tracing::debug!(events = delivered, "SSE stream complete");
    Ok(())
}

/// Turn a byte stream into a pull-based [`EventStream`].
///
/// The stream ends after the first error.
pub fn decode<S>(stream: S) -> EventStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    struct State {
        inner: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
        decoder: SseDecoder,
        pending: VecDeque<SseEvent>,
        failed: Option<Error>,
        done: bool,
    }

    let state = State {
        inner: Box::pin(stream),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        failed: None,
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if let Some(err) = state.failed.take() {
                return Some((Err(err), state));
            }
            if state.done {
                return None;
            }

            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.decoder.push(&chunk);
                    loop {
                        match state.decoder.next_event() {
                            Ok(Some(event)) => state.pending.push_back(event),
                            Ok(None) => break,
                            Err(err) => {
                                state.failed = Some(err);
                                state.done = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    state.failed = Some(err);
                    state.done = true;
                }
                None => {
                    state.decoder.finish();
                    state.done = true;
                }
            }
        }
    }))
}
