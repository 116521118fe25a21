//! Per-socket state machine.
//!
//! A session is transport neutral: it consumes [`InboundFrame`]s and produces
//! [`OutboundFrame`]s over channels, and the HTTP layer bridges those to a
//! real WebSocket.

use agent_gateway_protocol::ClientMessage;
use agent_gateway_protocol::ControlMessage;
use agent_gateway_protocol::DecodedLine;
use agent_gateway_protocol::ServerMessage;
use agent_gateway_protocol::TaskParams;
use agent_gateway_protocol::decode_line;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::sleep_until;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::AuthError;
use crate::gateway::Gateway;
use crate::ids::ConnectionId;
use crate::ids::UserId;
use crate::supervisor::OutputLine;
use crate::supervisor::OutputStream;
use crate::supervisor::ProcessOutput;
use crate::supervisor::ProcessStatus;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAuth,
    Authenticated { user_id: UserId },
    Running { user_id: UserId },
    Idle { user_id: UserId },
    Closed,
}

pub struct GatewaySession {
    gateway: Gateway,
    connection_id: ConnectionId,
    state: SessionState,
    registered: Option<UserId>,
    outbound: mpsc::Sender<OutboundFrame>,
    output: Option<mpsc::Receiver<ProcessOutput>>,
}

impl GatewaySession {
    pub fn new(gateway: Gateway, outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            gateway,
            connection_id: ConnectionId::new(),
            state: SessionState::AwaitingAuth,
            registered: None,
            outbound,
            output: None,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Drives the session until the socket closes, authentication fails or the
    /// gateway shuts down. The user's process is left running.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundFrame>) {
        let auth_deadline = Instant::now() + self.gateway.config().auth.handshake_timeout();
        let shutdown = self.gateway.shutdown_token();
        debug!(connection_id = %self.connection_id, "socket opened");

        while self.state != SessionState::Closed {
            let awaiting_auth = self.state == SessionState::AwaitingAuth;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.close(CLOSE_NORMAL, "server shutting down").await;
                }
                frame = inbound.recv() => match frame {
                    Some(InboundFrame::Text(text)) => self.handle_text(&text).await,
                    Some(InboundFrame::Close) | None => self.state = SessionState::Closed,
                },
                output = next_output(&mut self.output) => self.handle_output(output).await,
                () = sleep_until(auth_deadline), if awaiting_auth => {
                    self.reject(AuthError::Timeout).await;
                }
            }
        }

        if let Some(user_id) = self.registered.take() {
            self.gateway
                .registry()
                .unregister(&user_id, self.connection_id);
            info!(%user_id, connection_id = %self.connection_id, "socket closed");
        } else {
            debug!(connection_id = %self.connection_id, "unauthenticated socket closed");
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(err) if self.state == SessionState::AwaitingAuth => {
                self.reject_with(err.code(), &err.to_string()).await;
                return;
            }
            Err(err) => {
                debug!(connection_id = %self.connection_id, "rejected client frame: {err}");
                self.send_error(err.code(), err.to_string()).await;
                return;
            }
        };
        self.dispatch(message).await;
    }

    async fn dispatch(&mut self, message: ClientMessage) {
        use SessionState::*;

        match (self.state.clone(), message) {
            (AwaitingAuth, ClientMessage::Auth { token }) => self.authenticate(&token).await,
            (AwaitingAuth, other) => {
                debug!(kind = other.kind(), "first message was not auth");
                self.reject(AuthError::MissingToken).await;
            }
            (Closed, _) => {}
            (_, ClientMessage::Auth { .. }) => {
                self.send_error("already_authenticated", "socket is already authenticated")
                    .await;
            }
            (
                Authenticated { user_id } | Idle { user_id } | Running { user_id },
                ClientMessage::Run { params },
            ) => self.start_process(user_id, params).await,
            (Running { user_id }, ClientMessage::Stdin { data }) => {
                self.relay_stdin(user_id, data).await;
            }
            (_, ClientMessage::Stdin { .. }) => {
                self.send_error("no_process", "no process is attached; send `run` first")
                    .await;
            }
            (
                Authenticated { user_id } | Idle { user_id } | Running { user_id },
                ClientMessage::Stop,
            ) => self.stop_process(user_id).await,
            (Authenticated { user_id } | Idle { user_id }, ClientMessage::Attach) => {
                self.attach_process(user_id).await;
            }
            (Running { .. }, ClientMessage::Attach) => {
                self.send(ControlMessage::warning(
                    "already attached to the running process",
                ))
                .await;
            }
        }
    }

    async fn authenticate(&mut self, token: &str) {
        let user_id = match self.gateway.tokens().validate(token) {
            Ok(user_id) => user_id,
            Err(err) => {
                warn!(connection_id = %self.connection_id, code = err.code(), "socket authentication failed");
                self.reject(err).await;
                return;
            }
        };
        if let Err(err) = self
            .gateway
            .registry()
            .register(user_id.clone(), self.connection_id)
        {
            warn!(%user_id, connection_id = %self.connection_id, "rejecting second socket for user");
            self.reject(err).await;
            return;
        }
        self.registered = Some(user_id.clone());
        self.state = SessionState::Authenticated {
            user_id: user_id.clone(),
        };
        info!(%user_id, connection_id = %self.connection_id, "socket authenticated");
        self.send(ControlMessage::AuthSuccess {
            message: format!("authenticated as {user_id}"),
        })
        .await;

        let supervisor = self.gateway.supervisor().clone();
        if let Some(info) = supervisor.get(&user_id).await {
            self.send(ControlMessage::Status {
                message: "a process is already running; send `attach` to resume its output"
                    .to_string(),
                pid: info.pid,
            })
            .await;
        } else if let Some(info) = supervisor.unclaimed_exit(&user_id).await {
            self.send(ControlMessage::Status {
                message: "your last process exited while disconnected; send `attach` to read how it ended"
                    .to_string(),
                pid: info.pid,
            })
            .await;
        }
    }

    async fn start_process(&mut self, user_id: UserId, params: TaskParams) {
        match self.gateway.supervisor().start(user_id.clone(), params).await {
            Ok(attachment) => {
                self.output = Some(attachment.output);
                self.state = SessionState::Running { user_id };
                self.send(ControlMessage::Status {
                    message: "process started".to_string(),
                    pid: attachment.info.pid,
                })
                .await;
            }
            Err(err) => {
                warn!(%user_id, code = err.code(), "failed to start agent process: {err}");
                self.send_error(err.code(), err.to_string()).await;
            }
        }
    }

    async fn relay_stdin(&mut self, user_id: UserId, data: String) {
        let mut bytes = data.into_bytes();
        bytes.push(b'\n');
        if let Err(err) = self.gateway.supervisor().write_stdin(&user_id, bytes).await {
            self.send_error(err.code(), err.to_string()).await;
        }
    }

    async fn stop_process(&mut self, user_id: UserId) {
        if self.gateway.supervisor().stop(&user_id).await {
            self.send(ControlMessage::Status {
                message: "stop requested".to_string(),
                pid: None,
            })
            .await;
        } else {
            self.send(ControlMessage::warning("no process is running"))
                .await;
        }
    }

    async fn attach_process(&mut self, user_id: UserId) {
        let Some(attachment) = self.gateway.supervisor().attach(&user_id).await else {
            self.send(ControlMessage::warning("no process to attach to"))
                .await;
            return;
        };
        let message = match attachment.info.status {
            ProcessStatus::Exited(_) => "attached to exited process",
            _ => "attached to running process",
        };
        self.output = Some(attachment.output);
        self.state = SessionState::Running { user_id };
        self.send(ControlMessage::Status {
            message: message.to_string(),
            pid: attachment.info.pid,
        })
        .await;
        if attachment.dropped_lines > 0 {
            self.send(ControlMessage::warning(format!(
                "{} lines of output were dropped while detached",
                attachment.dropped_lines
            )))
            .await;
        }
        for item in attachment.replay {
            self.forward(item).await;
        }
    }

    async fn handle_output(&mut self, output: Option<ProcessOutput>) {
        match output {
            Some(item) => self.forward(item).await,
            None => {
                self.output = None;
                self.become_idle();
            }
        }
    }

    async fn forward(&mut self, item: ProcessOutput) {
        match item {
            ProcessOutput::Line(OutputLine {
                stream: OutputStream::Stderr,
                text,
            }) => self.send(ControlMessage::Stderr { data: text }).await,
            ProcessOutput::Line(OutputLine {
                stream: OutputStream::Stdout,
                text,
            }) => match decode_line(&text) {
                DecodedLine::Event(event) => {
                    if !event.kind().is_known() {
                        debug!(event_type = %event.event_type, "forwarding unrecognised agent event");
                    }
                    self.send(event).await;
                }
                DecodedLine::PlainText(data) => self.send(ControlMessage::Stdout { data }).await,
                DecodedLine::Malformed { line, error } => {
                    debug!(connection_id = %self.connection_id, "malformed agent event: {error}");
                    self.send(ControlMessage::Warning {
                        message: format!("malformed agent event: {error}"),
                        line: Some(line),
                    })
                    .await;
                }
            },
            ProcessOutput::Exited(report) => {
                self.output = None;
                self.become_idle();
                self.send(ControlMessage::End(report)).await;
            }
        }
    }

    fn become_idle(&mut self) {
        if let SessionState::Running { user_id } = &self.state {
            self.state = SessionState::Idle {
                user_id: user_id.clone(),
            };
        }
    }

    async fn send(&mut self, message: impl Into<ServerMessage>) {
        if self
            .outbound
            .send(OutboundFrame::Message(message.into()))
            .await
            .is_err()
        {
            debug!(connection_id = %self.connection_id, "socket writer gone");
            self.state = SessionState::Closed;
        }
    }

    async fn send_error(&mut self, code: &str, message: impl Into<String>) {
        self.send(ControlMessage::error(code, message)).await;
    }

    async fn reject(&mut self, err: AuthError) {
        self.reject_with(err.code(), &err.to_string()).await;
    }

    /// Authentication failures are final: report, then close with a policy
    /// violation.
    async fn reject_with(&mut self, code: &str, message: &str) {
        self.send_error(code, message).await;
        self.close(CLOSE_POLICY_VIOLATION, message).await;
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let _ = self
            .outbound
            .send(OutboundFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
        self.state = SessionState::Closed;
    }
}

async fn next_output(output: &mut Option<mpsc::Receiver<ProcessOutput>>) -> Option<ProcessOutput> {
    match output {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
