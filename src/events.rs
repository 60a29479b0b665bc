//! Domain events published by the run handlers and delivered to live clients.

use serde::{Deserialize, Serialize};

/// Kinds of changes observable by real-time clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    RunCreated,
    RunUpdated,
    RunDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunCreated => "run-created",
            EventKind::RunUpdated => "run-updated",
            EventKind::RunDeleted => "run-deleted",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published change notification.
///
/// Serializes to the wire shape `{"event": "<kind>", "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    #[serde(rename = "data")]
    pub payload: serde_json::Value,
}

impl DomainEvent {
    pub fn run_created(id: &str) -> Self {
        Self::for_run(EventKind::RunCreated, id)
    }

    pub fn run_updated(id: &str) -> Self {
        Self::for_run(EventKind::RunUpdated, id)
    }

    pub fn run_deleted(id: &str) -> Self {
        Self::for_run(EventKind::RunDeleted, id)
    }

    fn for_run(kind: EventKind, id: &str) -> Self {
        Self {
            kind,
            payload: serde_json::json!({ "id": id }),
        }
    }

    /// Serialize into the frame a transport writes.
    pub fn to_frame(&self) -> serde_json::Result<WireFrame> {
        Ok(WireFrame {
            kind: self.kind,
            text: serde_json::to_string(self)?,
        })
    }
}

/// One serialized event, ready to be written to a single client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub kind: EventKind,
    pub text: String,
}
