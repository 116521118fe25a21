#![allow(clippy::expect_used)]

use std::time::Duration;

use agent_gateway_core::AgentConfig;
use agent_gateway_core::Gateway;
use agent_gateway_core::GatewayConfig;
use agent_gateway_core::InboundFrame;
use agent_gateway_core::OutboundFrame;
use agent_gateway_core::ProcessOutput;
use agent_gateway_core::SessionHandle;
use agent_gateway_core::UserId;
use agent_gateway_core::supervisor::OutputLine;
use agent_gateway_protocol::ExitReport;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(15);

/// Agent config that runs `script` under `/bin/sh -c` with the shortest stop
/// grace period.
pub fn sh_agent(script: &str) -> AgentConfig {
    AgentConfig {
        program: "/bin/sh".into(),
        args: vec!["-c".to_string(), script.to_string()],
        stop_grace_ms: 500,
        ..AgentConfig::default()
    }
}

pub fn gateway_with_agent(script: &str) -> Gateway {
    Gateway::new(GatewayConfig {
        agent: sh_agent(script),
        ..GatewayConfig::default()
    })
}

/// Reads process output until the exit report arrives.
pub async fn collect_until_exit(
    output: &mut mpsc::Receiver<ProcessOutput>,
) -> (Vec<OutputLine>, ExitReport) {
    let mut lines = Vec::new();
    loop {
        let item = timeout(RECV_TIMEOUT, output.recv())
            .await
            .expect("timed out waiting for process output")
            .expect("output channel closed before exit");
        match item {
            ProcessOutput::Line(line) => lines.push(line),
            ProcessOutput::Exited(report) => return (lines, report),
        }
    }
}

/// A session driven directly through its frame channels, standing in for a
/// browser socket.
pub struct TestSocket {
    handle: SessionHandle,
}

impl TestSocket {
    pub fn open(gateway: &Gateway) -> Self {
        Self {
            handle: gateway.spawn_session(),
        }
    }

    /// Opens a socket and authenticates it as `user`.
    pub async fn connect(gateway: &Gateway, user: &str) -> Self {
        let mut socket = Self::open(gateway);
        let token = gateway.tokens().issue(UserId::new(user));
        socket
            .send(json!({"type": "auth", "token": token.value}))
            .await;
        let reply = socket.next_json().await;
        assert_eq!(reply["type"], "auth_success", "unexpected reply: {reply}");
        socket
    }

    pub async fn send(&self, frame: Value) {
        self.handle
            .inbound
            .send(InboundFrame::Text(frame.to_string()))
            .await
            .expect("session is gone");
    }

    pub async fn next_frame(&mut self) -> OutboundFrame {
        timeout(RECV_TIMEOUT, self.handle.outbound.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("session closed its outbound channel")
    }

    pub async fn next_json(&mut self) -> Value {
        match self.next_frame().await {
            OutboundFrame::Message(message) => {
                serde_json::to_value(&message).expect("serialize server message")
            }
            OutboundFrame::Close { code, reason } => {
                panic!("expected a message, got close {code}: {reason}")
            }
        }
    }

    /// Skips frames until one of the given `type` arrives.
    pub async fn next_of_type(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.next_json().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    pub async fn expect_close(&mut self) -> (u16, String) {
        match self.next_frame().await {
            OutboundFrame::Close { code, reason } => (code, reason),
            OutboundFrame::Message(message) => panic!("expected close, got {message:?}"),
        }
    }

    /// Closes the socket from the client side and waits for the session task.
    pub async fn close(self) {
        let TestSocket { handle } = self;
        let _ = handle.inbound.send(InboundFrame::Close).await;
        timeout(RECV_TIMEOUT, handle.task)
            .await
            .expect("session did not finish")
            .expect("session task panicked");
    }
}
