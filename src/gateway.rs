//! Event gateway between the tool layer and connected clients.
//!
//! Outbound: named events with JSON payloads, delivered per-session through
//! an mpsc queue so ordering is preserved for a given session. Delivery is
//! best-effort; once the transport is gone events are dropped silently and
//! the job layer keeps running to completion.
//!
//! Inbound: the client-facing wire protocol. Incoming frames are decoded
//! into [`ClientRequest`] and routed either to the dispatcher (as a function
//! call) or to session housekeeping.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Queue depth per session. Progress events are coalesced upstream, so this
/// only needs to absorb short bursts.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event: String,
    pub payload: Value,
}

/// Per-session outbound event channels.
#[derive(Default)]
pub struct EventGateway {
    connections: DashMap<Uuid, mpsc::Sender<Event>>,
}

impl EventGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a transport for a session. The receiver side is drained by the
    /// connection's writer task.
    pub fn register(&self, session_id: Uuid) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.connections.insert(session_id, tx);
        rx
    }

    pub fn unregister(&self, session_id: Uuid) {
        self.connections.remove(&session_id);
    }

    pub fn is_connected(&self, session_id: Uuid) -> bool {
        self.connections.contains_key(&session_id)
    }

    /// Deliver an event, waiting for queue space. Used for result and error
    /// events that must not be dropped while the client is connected.
    pub async fn send(&self, session_id: Uuid, event: impl Into<String>, payload: Value) {
        let sender = match self.connections.get(&session_id) {
            Some(s) => s.clone(),
            None => {
                trace!(session_id = %session_id, "event dropped, no transport");
                return;
            }
        };
        let event = Event {
            event: event.into(),
            payload,
        };
        if sender.send(event).await.is_err() {
            debug!(session_id = %session_id, "event dropped, transport closed");
        }
    }

    /// Best-effort delivery for high-frequency events (progress). A full
    /// queue drops the event; a later one supersedes it anyway.
    pub fn try_send(&self, session_id: Uuid, event: impl Into<String>, payload: Value) {
        if let Some(sender) = self.connections.get(&session_id) {
            let _ = sender.try_send(Event {
                event: event.into(),
                payload,
            });
        }
    }
}

/// Frames accepted from clients.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Shorthand for calling `generate_image`.
    ImageGenerationRequest(Map<String, Value>),
    /// Shorthand for calling `analyze_document`.
    DocumentAnalysisRequest(Map<String, Value>),
    DeleteDocumentRequest { document_id: String },
    ClearImageData,
    /// Generic path for every other registered function.
    FunctionCall {
        function_name: String,
        #[serde(default)]
        arguments: Map<String, Value>,
    },
}

/// Where an incoming frame goes after decoding.
#[derive(Debug)]
pub enum Routed {
    Call {
        function_name: String,
        arguments: Map<String, Value>,
    },
    DeleteDocument {
        document_id: String,
    },
    ClearImageData,
}

impl ClientRequest {
    pub fn route(self) -> Routed {
        match self {
            Self::ImageGenerationRequest(arguments) => Routed::Call {
                function_name: "generate_image".into(),
                arguments,
            },
            Self::DocumentAnalysisRequest(arguments) => Routed::Call {
                function_name: "analyze_document".into(),
                arguments,
            },
            Self::DeleteDocumentRequest { document_id } => Routed::DeleteDocument { document_id },
            Self::ClearImageData => Routed::ClearImageData,
            Self::FunctionCall {
                function_name,
                arguments,
            } => Routed::Call {
                function_name,
                arguments,
            },
        }
    }
}
