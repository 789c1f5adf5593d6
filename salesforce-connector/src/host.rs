//! Host-facing message envelope and lifecycle emitter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Message envelope exchanged with the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Message {
    /// Identifier assigned by the host, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Payload.
    #[serde(default)]
    pub body: Value,
    /// Transport headers.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub headers: serde_json::Map<String, Value>,
}

impl Message {
    /// Creates a message carrying `body`.
    pub fn with_body(body: Value) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }
}

/// Payload of an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error kind, see [`crate::Error::kind`].
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl From<&crate::Error> for ErrorPayload {
    fn from(error: &crate::Error) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Lifecycle events the connector sends to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum Event {
    /// A result record.
    Data(Message),
    /// A failed invocation.
    Error(ErrorPayload),
    /// The invocation finished.
    End,
    /// New polling state to persist.
    Snapshot(Value),
    /// Rotated credential material to persist.
    UpdateKeys(Value),
}

impl Event {
    /// Event name as the host knows it.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Data(_) => "data",
            Event::Error(_) => "error",
            Event::End => "end",
            Event::Snapshot(_) => "snapshot",
            Event::UpdateKeys(_) => "updateKeys",
        }
    }
}

/// Errors returned by an [`Emitter`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum EmitError {
    /// The host stopped receiving events.
    #[error("Host closed the event channel")]
    Closed,
    /// The host refused the event.
    #[error("Host rejected {event} event: {message}")]
    Rejected {
        /// Name of the rejected event.
        event: &'static str,
        /// Reason given by the host.
        message: String,
    },
}

/// Lifecycle callback supplied by the host.
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Delivers one event to the host.
    async fn emit(&self, event: Event) -> Result<(), EmitError>;
}

/// [`Emitter`] that forwards events over an unbounded tokio channel.
///
/// # Example
///
/// ```
/// use salesforce_connector::host::{ChannelEmitter, Emitter, Event};
/// use tokio_stream::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() {
/// let (emitter, mut events) = ChannelEmitter::new();
/// emitter.emit(Event::End).await.unwrap();
/// drop(emitter);
/// assert_eq!(events.next().await, Some(Event::End));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelEmitter {
    /// Creates the emitter together with the stream the host reads from.
    pub fn new() -> (Self, UnboundedReceiverStream<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, UnboundedReceiverStream::new(receiver))
    }
}

#[async_trait]
impl Emitter for ChannelEmitter {
    async fn emit(&self, event: Event) -> Result<(), EmitError> {
        self.sender.send(event).map_err(|_| EmitError::Closed)
    }
}
