//! ptexecd: protocol-test execution daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ptexec_daemon::{Daemon, DaemonConfig};

#[derive(Parser)]
#[command(name = "ptexecd", about = "Protocol test execution and telemetry fan-out daemon")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short = 'c', global = true, env = "PTEXEC_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default)
    Serve,
    /// Print the effective configuration as TOML
    Config,
}

/// Flags that take precedence over the configuration file.
#[derive(Args)]
struct Overrides {
    /// WebSocket listen address
    #[arg(long, global = true, env = "PTEXEC_LISTEN")]
    listen: Option<SocketAddr>,

    /// Record ingest listen address
    #[arg(long, global = true, env = "PTEXEC_INGEST")]
    ingest: Option<SocketAddr>,

    #[arg(long, global = true)]
    max_connections: Option<usize>,

    /// Simulated per-step service time in milliseconds
    #[arg(long, global = true)]
    step_delay_ms: Option<u64>,

    /// Share of steps marked faulty when fault injection is requested
    #[arg(long, global = true)]
    fault_rate: Option<f64>,
}

impl Overrides {
    fn apply(self, config: &mut DaemonConfig) {
        if let Some(addr) = self.listen {
            config.listen_addr = addr;
        }
        if let Some(addr) = self.ingest {
            config.ingest_addr = addr;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(ms) = self.step_delay_ms {
            config.step_delay_ms = ms;
        }
        if let Some(rate) = self.fault_rate {
            config.fault_rate = rate;
        }
    }
}

fn load_config(path: Option<&PathBuf>, overrides: Overrides) -> anyhow::Result<DaemonConfig> {
    let mut config = match path {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate().context("invalid configuration after applying flags")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), cli.overrides)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
        Command::Serve => {
            let filter = std::env::var("PTEXEC_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .init();

            tracing::info!(
                listen = %config.listen_addr,
                ingest = %config.ingest_addr,
                max_connections = config.max_connections,
                "ptexec daemon starting"
            );

            let cancel = CancellationToken::new();
            let running = Daemon::new(config, cancel)
                .start()
                .await
                .context("failed to bind listeners")?;

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            tracing::info!("received ctrl-c, shutting down");
            running.shutdown().await;
        }
    }

    Ok(())
}
