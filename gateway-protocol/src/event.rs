use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use strum_macros::EnumString;

/// A structured record emitted by the agent on stdout.
///
/// The gateway never interprets `type`; it is kept as a free-form string so
/// new event kinds added on the agent side flow through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    #[serde(default = "now_timestamp")]
    pub timestamp: Value,
    /// Any additional top-level fields the agent attached to the record.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: now_timestamp(),
            extra: Map::new(),
        }
    }

    /// Classifies the event against the kinds the agent is known to emit.
    pub fn kind(&self) -> EventKind {
        match self.event_type.parse::<EventKind>() {
            Ok(kind) => kind,
            Err(_) => EventKind::Unknown(self.event_type.clone()),
        }
    }
}

/// Event kinds emitted by the current agent. Used for logging only; the codec
/// forwards every kind, including [`EventKind::Unknown`], unchanged.
#[derive(Debug, Clone, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    ProcessStart,
    PhaseChange,
    LlmRequestStart,
    LlmRequestError,
    ToolExecutionStart,
    ToolExecutionResult,
    FileOperationStart,
    FileOperationComplete,
    SystemLog,
    WaitingForApproval,
    ApprovalResponseReceived,
    ProcessEnd,
    #[strum(default)]
    Unknown(String),
}

impl EventKind {
    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Unknown(_))
    }
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

fn now_timestamp() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn known_kinds_parse_from_snake_case() {
        let event = AgentEvent::new("tool_execution_result", json!({}));
        assert_eq!(event.kind(), EventKind::ToolExecutionResult);
        assert!(event.kind().is_known());
    }

    #[test]
    fn unrecognized_kind_is_kept_verbatim() {
        let event = AgentEvent::new("brand_new_kind", json!({"a": 1}));
        assert_eq!(
            event.kind(),
            EventKind::Unknown("brand_new_kind".to_string())
        );
        assert!(!event.kind().is_known());
    }

    #[test]
    fn missing_payload_and_timestamp_are_filled_in() {
        let event: AgentEvent =
            serde_json::from_value(json!({"type": "system_log"})).expect("decode event");
        assert_eq!(event.payload, json!({}));
        assert!(event.timestamp.is_string());
    }
}
