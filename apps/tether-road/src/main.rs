use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tether_road::cli::{self, Cli, Commands};
use tether_road::config::{AuthPolicy, Config};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise the CLI level (warn by default).
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(Commands::Probe {
        url,
        role,
        code,
        listen,
    }) = cli.command
    {
        if let Err(err) = cli::run_probe(url, role, code, listen).await {
            error!("probe failed: {err}");
            std::process::exit(1);
        }
        return;
    }

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.debug_pairing_code {
        config.debug_pairing_code = true;
    }

    info!(port = config.port, "starting tether-road");
    info!(
        code_ttl_secs = config.pairing_code_ttl.as_secs(),
        require_login = config.auth_policy == AuthPolicy::Required,
        provider = config.oauth.is_some(),
        "registry settings"
    );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };
    info!("listening on {addr}");

    tokio::select! {
        result = tether_road::serve(listener, &config) => {
            if let Err(err) = result {
                error!("server error: {err}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
