//! Line codec for the agent's stdout.
//!
//! The agent multiplexes structured events and free-form log text on the same
//! stream. A line is an event only when it starts with [`EVENT_MARKER`] and the
//! rest of the line is one JSON object carrying a string `type`.

use serde_json::Value;
use thiserror::Error;

use crate::event::AgentEvent;

pub const EVENT_MARKER: &str = "WEBSOCKET_EVENT:";

#[derive(Debug)]
pub enum DecodedLine {
    Event(AgentEvent),
    PlainText(String),
    /// The line carried the marker but the record could not be decoded. The
    /// raw line is preserved so it can still be shown to the operator.
    Malformed { line: String, error: DecodeError },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid event json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("event record is not a json object")]
    NotAnObject,
    #[error("event record has no string `type` field")]
    MissingType,
}

pub fn decode_line(line: &str) -> DecodedLine {
    let Some(record) = line.strip_prefix(EVENT_MARKER) else {
        return DecodedLine::PlainText(line.to_string());
    };
    match decode_record(record) {
        Ok(event) => DecodedLine::Event(event),
        Err(error) => DecodedLine::Malformed {
            line: line.to_string(),
            error,
        },
    }
}

fn decode_record(record: &str) -> Result<AgentEvent, DecodeError> {
    let value: Value = serde_json::from_str(record)?;
    let Value::Object(map) = &value else {
        return Err(DecodeError::NotAnObject);
    };
    if !map.get("type").is_some_and(Value::is_string) {
        return Err(DecodeError::MissingType);
    }
    Ok(serde_json::from_value(value)?)
}

/// Serializes an event for the socket. The record is re-emitted structurally:
/// no fields are renamed or dropped.
pub fn encode_event(event: &AgentEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Renders an event the way the agent writes it on stdout.
pub fn encode_line(event: &AgentEvent) -> Result<String, serde_json::Error> {
    Ok(format!("{EVENT_MARKER}{}", encode_event(event)?))
}
