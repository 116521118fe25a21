//! Session, token and process management for the agent gateway.

pub mod config;
mod error;
mod gateway;
mod ids;
mod registry;
pub mod session;
pub mod supervisor;
mod token;

pub use config::AgentConfig;
pub use config::AuthConfig;
pub use config::GatewayConfig;
pub use error::AuthError;
pub use error::ConfigError;
pub use error::ProcessError;
pub use gateway::Gateway;
pub use gateway::SessionHandle;
pub use ids::ConnectionId;
pub use ids::UserId;
pub use registry::ConnectionRegistry;
pub use registry::RegisteredSession;
pub use session::CLOSE_NORMAL;
pub use session::CLOSE_POLICY_VIOLATION;
pub use session::GatewaySession;
pub use session::InboundFrame;
pub use session::OutboundFrame;
pub use session::SessionState;
pub use supervisor::ProcessAttachment;
pub use supervisor::ProcessExit;
pub use supervisor::ProcessInfo;
pub use supervisor::ProcessOutput;
pub use supervisor::ProcessStatus;
pub use supervisor::ProcessSupervisor;
pub use token::AuthToken;
pub use token::TokenIssuer;
