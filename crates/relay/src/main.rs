use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use broadcast_relay::{AppState, broker, config, router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("config.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

fn print_help() {
    println!(
        "broadcast-relay\n\n\
         USAGE:\n    broadcast-relay [OPTIONS]\n\n\
         OPTIONS:\n    \
         -c, --config <PATH>   Path to the TOML config file [default: config.toml]\n    \
         -p, --port <PORT>     Override server.port from the config\n    \
         -h, --help            Print this help message"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid bind address")?;

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(&config, shutdown.clone()));

    let broker_state = state.clone();
    let broker_config = config.clone();
    tokio::spawn(async move {
        if let Err(e) = broker::run_publisher_signaler(broker_state, broker_config).await {
            tracing::error!("publisher signaler exited: {e}");
        }
    });

    let app = router::build_router(state, &config);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("broadcast relay listening on http://{bind_addr}");

    let shutdown_for_server = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_for_server.cancel();
        })
        .await
        .context("server error")?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
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
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
