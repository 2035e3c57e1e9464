//! AIM Daemon - agent identity & action-verification control plane.
//!
//! `aimd` serves:
//! - the signed verification pipeline and its event log
//! - capability grants, security policies and trust scores
//! - MCP attestations and confidence tracking
//! - alerts, audit trail, webhooks and SDK token flows

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aim_daemon::{config::StorageConfig, DaemonConfig, Server};

/// AIM daemon CLI.
#[derive(Parser)]
#[command(name = "aimd")]
#[command(about = "AIM control-plane daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, env = "AIM_CONFIG")]
    config: Option<String>,

    /// Listen address.
    #[arg(short, long, env = "AIM_LISTEN_ADDR")]
    listen: Option<String>,

    /// Storage backend: `memory` or a postgres:// URL.
    #[arg(short, long, env = "AIM_STORAGE")]
    storage: Option<String>,

    /// Log level.
    #[arg(long, env = "AIM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging.
    #[arg(long, env = "AIM_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = DaemonConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;

    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address: {e}"))?;
    }
    if let Some(storage) = cli.storage {
        config.storage = match storage.as_str() {
            "memory" => StorageConfig::Memory,
            url if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
                StorageConfig::Postgres {
                    url: url.to_string(),
                    max_connections: 10,
                    connect_timeout_secs: 5,
                }
            }
            other => anyhow::bail!("unknown storage backend: {other}"),
        };
    }

    println!(
        r#"
     _    ___ __  __
    / \  |_ _|  \/  |
   / _ \  | || |\/| |
  / ___ \ | || |  | |
 /_/   \_\___|_|  |_|

  Agent Identity & Action-Verification Control Plane
  Version: {}
  Listening: {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.server.listen_addr
    );

    let server = Server::new(config).await?;
    server.run().await?;
    Ok(())
}
