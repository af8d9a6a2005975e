use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Claims;

/// Identifier for a single tool invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An authorized invocation in flight. Created only after an allowed
/// [`AuthDecision`](super::AuthDecision); dropped when the call terminates.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub call_id: CallId,
    pub tool_name: String,
    pub arguments: Value,
    pub caller_claims: Claims,
}

/// A progress notification emitted by a running tool.
///
/// `sequence` is strictly increasing per call id, starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub call_id: CallId,
    pub sequence: u64,
    pub payload: Value,
}

/// One element of a call's event stream. Per call the stream is zero or
/// more `Progress` events followed by exactly one terminal variant;
/// nothing follows the terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    Progress(ProgressEvent),
    Result { call_id: CallId, value: Value },
    Error { call_id: CallId, message: String },
    Cancelled { call_id: CallId },
}

impl CallEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallEvent::Progress(_))
    }

    pub fn call_id(&self) -> CallId {
        match self {
            CallEvent::Progress(event) => event.call_id,
            CallEvent::Result { call_id, .. }
            | CallEvent::Error { call_id, .. }
            | CallEvent::Cancelled { call_id } => *call_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_unique() {
        assert_ne!(CallId::new(), CallId::new());
    }

    #[test]
    fn terminal_classification() {
        let id = CallId::new();
        let progress = CallEvent::Progress(ProgressEvent {
            call_id: id,
            sequence: 1,
            payload: Value::Null,
        });
        assert!(!progress.is_terminal());
        assert!(CallEvent::Result { call_id: id, value: Value::Null }.is_terminal());
        assert!(CallEvent::Cancelled { call_id: id }.is_terminal());
        assert_eq!(progress.call_id(), id);
    }

    #[test]
    fn event_serialization_is_tagged() {
        let id = CallId::new();
        let json = serde_json::to_value(CallEvent::Cancelled { call_id: id }).unwrap();
        assert_eq!(json.get("type").unwrap(), "cancelled");
    }
}
