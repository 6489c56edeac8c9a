//! worldgate-server binary: CLI parsing, logging setup, and the run loop.

use clap::Parser;
use tracing::{error, info};
use worldgate_server::{server, ServerConfig};

/// worldgate-server — request-relay broker for game worlds
#[derive(Parser, Debug)]
#[command(
    name = "worldgate-server",
    version,
    about = "Request-relay broker between REST callers and game-world WebSockets"
)]
struct Cli {
    /// Listen port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level: trace, debug, info, warn, error (overrides LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ServerConfig::load(cli.port, cli.log_level.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        "starting worldgate-server"
    );

    if let Err(e) = server::run(config, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("worldgate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
