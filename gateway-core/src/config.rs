use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_USER_HEADER: &str = "x-user-id";
const DEFAULT_TOKEN_TTL_SECS: u64 = 60;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_AGENT_PROGRAM: &str = "coding-agent";
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;
const MIN_STOP_GRACE_MS: u64 = 500;
const MAX_STOP_GRACE_MS: u64 = 60_000;
const DEFAULT_BACKLOG_LINES: usize = 1_000;

/// Top-level gateway configuration, normally read from a TOML file.
///
/// Every field has a default so an empty file (or no file at all) yields a
/// usable configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Request header carrying the user identity established by the
    /// surrounding application (e.g. set by a reverse proxy).
    pub user_header: String,
    pub auth: AuthConfig,
    pub agent: AgentConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            user_header: DEFAULT_USER_HEADER.to_string(),
            auth: AuthConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads the config from `path`, or returns the defaults when no path is
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_header.trim().is_empty() {
            return Err(ConfigError::Invalid("user_header must not be empty".into()));
        }
        if self.agent.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("agent.program must not be empty".into()));
        }
        if self.auth.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid("auth.token_ttl_secs must be positive".into()));
        }
        if self.auth.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "auth.handshake_timeout_secs must be positive".into(),
            ));
        }
        if self.agent.orphan_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "agent.orphan_timeout_secs must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub token_ttl_secs: u64,
    pub handshake_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// How the agent process is launched and supervised.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// When set, the task parameters JSON is also passed as `<params_arg> <json>`.
    pub params_arg: Option<String>,
    pub stop_grace_ms: u64,
    /// Lines retained while no socket is attached to the process.
    pub backlog_lines: usize,
    /// Stop a process after it has had no attached socket for this long.
    pub orphan_timeout_secs: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_AGENT_PROGRAM),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            params_arg: None,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            backlog_lines: DEFAULT_BACKLOG_LINES,
            orphan_timeout_secs: None,
        }
    }
}

impl AgentConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(
            self.stop_grace_ms
                .clamp(MIN_STOP_GRACE_MS, MAX_STOP_GRACE_MS),
        )
    }

    pub fn orphan_timeout(&self) -> Option<Duration> {
        self.orphan_timeout_secs.map(Duration::from_secs)
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8787))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_uses_defaults() {
        let config = GatewayConfig::from_toml_str("").expect("parse empty config");
        assert_eq!(config.listen.to_string(), "127.0.0.1:8787");
        assert_eq!(config.user_header, DEFAULT_USER_HEADER);
        assert_eq!(config.auth.token_ttl(), Duration::from_secs(60));
        assert_eq!(config.auth.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.agent.stop_grace(), Duration::from_secs(5));
        assert_eq!(config.agent.orphan_timeout(), None);
    }

    #[test]
    fn nested_tables_override_defaults() {
        let config = GatewayConfig::from_toml_str(
            r#"
listen = "0.0.0.0:9000"

[auth]
token_ttl_secs = 30

[agent]
program = "/usr/local/bin/agent"
args = ["--json-events"]
params_arg = "--task-params"
orphan_timeout_secs = 600

[agent.env]
AGENT_MODE = "autonomous"
"#,
        )
        .expect("parse config");
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.auth.token_ttl_secs, 30);
        assert_eq!(config.auth.handshake_timeout_secs, 10);
        assert_eq!(config.agent.program, PathBuf::from("/usr/local/bin/agent"));
        assert_eq!(config.agent.args, vec!["--json-events".to_string()]);
        assert_eq!(config.agent.params_arg.as_deref(), Some("--task-params"));
        assert_eq!(
            config.agent.env.get("AGENT_MODE").map(String::as_str),
            Some("autonomous")
        );
        assert_eq!(
            config.agent.orphan_timeout(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn stop_grace_is_clamped() {
        let mut agent = AgentConfig {
            stop_grace_ms: 1,
            ..AgentConfig::default()
        };
        assert_eq!(agent.stop_grace(), Duration::from_millis(MIN_STOP_GRACE_MS));
        agent.stop_grace_ms = u64::MAX;
        assert_eq!(agent.stop_grace(), Duration::from_millis(MAX_STOP_GRACE_MS));
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert_matches!(
            GatewayConfig::from_toml_str("listen_addr = \"127.0.0.1:1\""),
            Err(ConfigError::Parse(_))
        );
        assert_matches!(
            GatewayConfig::from_toml_str("[auth]\ntoken_ttl_secs = 0"),
            Err(ConfigError::Invalid(_))
        );
        assert_matches!(
            GatewayConfig::from_toml_str("[agent]\norphan_timeout_secs = 0"),
            Err(ConfigError::Invalid(_))
        );
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "user_header = \"x-forwarded-user\"\n").expect("write config");
        let config = GatewayConfig::load(Some(&path)).expect("load config");
        assert_eq!(config.user_header, "x-forwarded-user");

        let missing = dir.path().join("missing.toml");
        assert_matches!(
            GatewayConfig::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        );
    }
}
