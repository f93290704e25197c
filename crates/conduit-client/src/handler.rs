//! Event handlers for streamed responses.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::sse::SseEvent;

/// Receives the events of one stream.
///
/// For every stream the dispatcher calls `on_event` zero or more times, then
/// `on_error` at most once, then `on_complete` exactly once.
///
/// Returning an error from `on_event` aborts the stream: later events are
/// never delivered. Each event reaches the handler at most once and in
/// order, which is what downstream consumers such as channels rely on.
#[async_trait]
pub trait EventHandler: Send {
    /// Handle one decoded event.
    async fn on_event(&mut self, event: SseEvent) -> Result<()>;

    /// The stream failed. Called at most once, before `on_complete`.
    async fn on_error(&mut self, _error: &Error) {}

    /// The stream is over. Always the last call.
    async fn on_complete(&mut self) {}
}

/// Decode an event's `data` as a JSON object.
///
/// Payloads that are not a JSON object come back as
/// `{"raw_data": "<data>"}` so one odd event never breaks a stream.
pub fn decode_json(event: &SseEvent) -> Value {
    let data = event.payload();
    match serde_json::from_str::<Map<String, Value>>(data) {
        Ok(object) => Value::Object(object),
        Err(_) => json!({ "raw_data": data }),
    }
}

/// Handler that passes each event's JSON payload to a closure.
pub struct JsonHandler<F> {
    callback: F,
}

impl<F> JsonHandler<F>
where
    F: FnMut(Value) -> Result<()> + Send,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> EventHandler for JsonHandler<F>
where
    F: FnMut(Value) -> Result<()> + Send,
{
    async fn on_event(&mut self, event: SseEvent) -> Result<()> {
        (self.callback)(decode_json(&event))
    }

    async fn on_error(&mut self, error: &Error) {
        tracing::warn!(error = %error, "Event stream failed");
    }
}

/// Forwards decoded JSON payloads onto a bounded channel.
pub(crate) struct ChannelRelay {
    tx: mpsc::Sender<Result<Value>>,
}

impl ChannelRelay {
    pub(crate) fn new(tx: mpsc::Sender<Result<Value>>) -> Self {
        Self { tx }
    }

    /// Report the terminal error and drop the sender, closing the channel.
    pub(crate) async fn close(self, outcome: Result<()>) {
        match outcome {
            Ok(()) => {}
            // The receiver is gone; nobody is left to tell.
            Err(Error::Handler(_)) if self.tx.is_closed() => {}
            Err(err) => {
                let _ = self.tx.send(Err(err)).await;
            }
        }
    }
}

#[async_trait]
impl EventHandler for ChannelRelay {
    async fn on_event(&mut self, event: SseEvent) -> Result<()> {
        self.tx
            .send(Ok(decode_json(&event)))
            .await
            .map_err(|_| Error::handler("event receiver dropped"))
    }
}
