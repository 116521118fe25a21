use std::net::SocketAddr;
use std::path::PathBuf;

use agent_gateway_core::Gateway;
use agent_gateway_core::GatewayConfig;
use agent_gateway_server::serve;
use agent_gateway_server::shutdown_signal;
use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs the agent gateway: issues socket tokens over HTTP and bridges
/// authenticated WebSockets to per-user agent processes.
#[derive(Debug, Parser)]
#[command(name = "agent-gateway", version)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `listen` from the config file.
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Agent executable, overriding `agent.program` from the config file.
    #[arg(long, value_name = "PATH")]
    agent_program: Option<PathBuf>,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<GatewayConfig> {
        let mut config = GatewayConfig::load(self.config.as_deref())
            .context("failed to load gateway config")?;
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(program) = &self.agent_program {
            config.agent.program = program.clone();
        }
        config.validate().context("invalid gateway config")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        addr = %listener.local_addr()?,
        agent = %config.agent.program.display(),
        "agent gateway listening"
    );

    serve(listener, Gateway::new(config), shutdown_signal()).await
}
