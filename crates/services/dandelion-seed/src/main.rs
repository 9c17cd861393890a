use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use dandelion_common::tracing::setup_tracing;

mod config;
mod push;
mod reconcile;
mod server;

use config::SeedConfig;
use reconcile::Agent;

/// Fleet agent: reconciles local app files against dandelion releases.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = "/etc/dandelion/dandelion-seed.yml")]
    config: PathBuf,

    /// Show verbose debug log
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// One-shot reconcile of every configured app, then exit
    #[arg(long, default_value_t = false)]
    sync_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose, false);

    let conf = SeedConfig::load(&cli.config)
        .with_context(|| format!("load config from {}", cli.config.display()))?;
    let conf = Arc::new(conf);
    let agent = Arc::new(Agent::new(Arc::clone(&conf))?);

    if cli.sync_only {
        return agent.check_all().await;
    }

    // startup reconcile; failures are reported over the push channel once
    // it is up, so they do not abort the agent
    if let Err(e) = agent.check_all().await {
        error!(error = %e, "startup reconcile had failures");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    if conf.api.enabled {
        let addr = format!("{}:{}", conf.api.address, conf.api.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind agent api on {addr}"))?;
        info!(addr = %addr, "agent api listening");
        let app = server::routes(Arc::clone(&agent));
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "agent api server error");
            }
        });
    }

    push::run_push_loop(agent, shutdown_rx).await;
    Ok(())
}

#[allow(clippy::expect_used)] // signal handler setup is infallible in practice
async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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
