use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use tether_client_core::config::ClientConfig;
use tether_client_core::identity::StateStore;
use tether_client_core::session::{host, viewer};
use tether_client_core::telemetry::{self, LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Share a terminal over a relay with a direct path when one is available")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Relay server URL (overrides TETHER_RELAY_URL)
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Log level used when TETHER_LOG_FILTER is unset
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, global = true)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "TETHER_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Share this machine's shell
    Host,
    /// Attach to a shared shell
    View {
        /// Pairing code shown on the host; omit to pair by account
        #[arg(long)]
        code: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    };
    if let Err(err) = telemetry::init(&log) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(cli).await {
        eprintln!("tether: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ClientConfig::from_env();
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }
    let store = StateStore::new(config.home.clone())?;
    tracing::debug!(target = "tether::main", relay = %config.relay_url, state = %store.dir().display(), "starting");

    match cli.command {
        Command::Host => host::run(config, store).await,
        Command::View { code } => viewer::run(config, store, code).await,
    }
}
