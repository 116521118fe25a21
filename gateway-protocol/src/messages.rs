use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::event::AgentEvent;

/// Opaque task parameters forwarded to the agent on `run`.
pub type TaskParams = Map<String, Value>;

/// Messages accepted from the browser.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Auth { token: String },
    Run { params: TaskParams },
    Stdin { data: String },
    Stop,
    Attach,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unsupported message type `{0}`")]
    UnsupportedType(String),
    #[error("invalid `{kind}` message: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

impl FrameError {
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::InvalidJson(_) => "invalid_frame",
            FrameError::UnsupportedType(_) => "unsupported_type",
            FrameError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

impl ClientMessage {
    /// Parses a text frame of the form `{type, payload?}`.
    ///
    /// `auth` and `stdin` also accept their field at the top level of the frame
    /// (`{"type":"auth","token":"..."}`), which is what the browser sends.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawClientFrame = serde_json::from_str(text)?;
        match raw.kind.as_str() {
            "auth" => {
                let token = raw
                    .token
                    .or_else(|| payload_string(raw.payload.as_ref(), "token"))
                    .ok_or_else(|| FrameError::InvalidPayload {
                        kind: "auth",
                        reason: "missing `token`".to_string(),
                    })?;
                Ok(ClientMessage::Auth { token })
            }
            "run" => {
                let params = match raw.payload {
                    None | Some(Value::Null) => TaskParams::new(),
                    Some(Value::Object(map)) => map,
                    Some(_) => {
                        return Err(FrameError::InvalidPayload {
                            kind: "run",
                            reason: "payload must be an object".to_string(),
                        });
                    }
                };
                Ok(ClientMessage::Run { params })
            }
            "stdin" => {
                let data = raw
                    .data
                    .or_else(|| payload_string(raw.payload.as_ref(), "data"))
                    .ok_or_else(|| FrameError::InvalidPayload {
                        kind: "stdin",
                        reason: "missing string `data`".to_string(),
                    })?;
                Ok(ClientMessage::Stdin { data })
            }
            "stop" => Ok(ClientMessage::Stop),
            "attach" => Ok(ClientMessage::Attach),
            _ => Err(FrameError::UnsupportedType(raw.kind)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::Run { .. } => "run",
            ClientMessage::Stdin { .. } => "stdin",
            ClientMessage::Stop => "stop",
            ClientMessage::Attach => "attach",
        }
    }
}

fn payload_string(payload: Option<&Value>, field: &str) -> Option<String> {
    payload?.get(field)?.as_str().map(str::to_string)
}

/// Everything the gateway writes to the socket: either an agent event forwarded
/// verbatim or one of the gateway's own control messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Control(ControlMessage),
    Event(AgentEvent),
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ControlMessage> for ServerMessage {
    fn from(value: ControlMessage) -> Self {
        ServerMessage::Control(value)
    }
}

impl From<AgentEvent> for ServerMessage {
    fn from(value: AgentEvent) -> Self {
        ServerMessage::Event(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlMessage {
    AuthSuccess {
        message: String,
    },
    Status {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Warning {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    End(ExitReport),
}

impl ControlMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ControlMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        ControlMessage::Warning {
            message: message.into(),
            line: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatusKind {
    Completed,
    Failed,
    Terminated,
}

/// Terminal notification for a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    pub status: ExitStatusKind,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub message: String,
}

impl ExitReport {
    /// Builds a report from what the OS told us about the exit.
    pub fn new(exit_code: Option<i32>, signal: Option<i32>, stop_requested: bool) -> Self {
        let (status, message) = match (exit_code, signal) {
            (Some(0), _) => (
                ExitStatusKind::Completed,
                "process exited with code 0".to_string(),
            ),
            (Some(code), _) => (
                ExitStatusKind::Failed,
                format!("process exited with code {code}"),
            ),
            (None, Some(sig)) if stop_requested => (
                ExitStatusKind::Terminated,
                format!("process stopped on request (signal {sig})"),
            ),
            (None, Some(sig)) => (
                ExitStatusKind::Terminated,
                format!("process terminated by signal {sig}"),
            ),
            (None, None) => (
                ExitStatusKind::Terminated,
                "process exited without a status".to_string(),
            ),
        };
        Self {
            status,
            exit_code,
            signal,
            message,
        }
    }
}
