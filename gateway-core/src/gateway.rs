use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::registry::ConnectionRegistry;
use crate::session::GatewaySession;
use crate::session::InboundFrame;
use crate::session::OutboundFrame;
use crate::supervisor::ProcessSupervisor;
use crate::token::TokenIssuer;

const SESSION_CHANNEL_CAPACITY: usize = 128;

/// Shared state behind every socket: the token table, the per-user connection
/// registry and the process supervisor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    tokens: Arc<TokenIssuer>,
    registry: Arc<ConnectionRegistry>,
    supervisor: ProcessSupervisor,
    shutdown: CancellationToken,
}

/// The two ends a transport needs to drive a spawned session.
#[derive(Debug)]
pub struct SessionHandle {
    pub inbound: mpsc::Sender<InboundFrame>,
    pub outbound: mpsc::Receiver<OutboundFrame>,
    pub task: JoinHandle<()>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let tokens = Arc::new(TokenIssuer::new(config.auth.token_ttl()));
        let supervisor = ProcessSupervisor::new(config.agent.clone());
        Self {
            config: Arc::new(config),
            tokens,
            registry: Arc::new(ConnectionRegistry::new()),
            supervisor,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenIssuer> {
        &self.tokens
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts a session task for a freshly accepted socket.
    pub fn spawn_session(&self) -> SessionHandle {
        let (inbound_tx, inbound_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let session = GatewaySession::new(self.clone(), outbound_tx);
        let task = tokio::spawn(session.run(inbound_rx));
        SessionHandle {
            inbound: inbound_tx,
            outbound: outbound_rx,
            task,
        }
    }

    /// Periodically evicts expired tokens until the gateway shuts down.
    pub fn spawn_token_sweeper(&self) -> JoinHandle<()> {
        self.tokens
            .spawn_sweeper(self.config.auth.sweep_interval(), self.shutdown.child_token())
    }

    /// Closes every session and stops every agent process.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.supervisor.shutdown().await;
    }
}
