//! Chatwire relay gateway entry point.
//!
//! Binary name: `cwire`
//!
//! Parses CLI arguments, loads the relay configuration, starts the hub's
//! maintenance loops, and serves the WebSocket endpoint plus the read-only
//! admin API.

mod config;
mod http;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use chatwire_core::hub::RelayHub;
use state::GatewayState;

#[derive(Debug, Parser)]
#[command(name = "cwire", version, about = "Multi-tenant chat relay gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the relay server.
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind.
        #[arg(long, default_value_t = 8420)]
        port: u16,
    },
    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity; RUST_LOG overrides.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "info,chatwire_core=debug,chatwire_gateway=debug",
        _ => "trace",
    };
    chatwire_observe::tracing_setup::init_tracing(cli.json_logs, filter)
        .map_err(|err| anyhow::anyhow!("failed to initialize tracing: {err}"))?;

    let relay_config = config::load_config(cli.config.as_deref());

    match cli.command {
        Commands::Serve { host, port } => {
            let hub = Arc::new(RelayHub::new(relay_config));
            hub.start().await;

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            println!();
            println!(
                "  {} chatwire relay listening on {}",
                console::style("⚡").bold(),
                console::style(format!("ws://{addr}/ws")).cyan()
            );
            println!(
                "  {} admin API at {}",
                console::style("·").dim(),
                console::style(format!("http://{addr}/admin/v1")).cyan()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(GatewayState {
                hub: Arc::clone(&hub),
            });

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            hub.shutdown().await;
            println!("\n  Server stopped.");
        }

        Commands::Config => {
            println!("{}", toml::to_string_pretty(&relay_config)?);
        }
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
