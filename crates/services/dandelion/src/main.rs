use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dandelion_common::config::AppConfig;
use dandelion_common::tracing::setup_tracing;

/// Centralized configuration distribution and deployment management.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = "/etc/dandelion/dandelion.yml")]
    config: PathBuf,

    /// Show verbose debug log
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose, false);

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("load config from {}", cli.config.display()))?;
    tracing::info!(config = %cli.config.display(), "dandelion starting");

    dandelion_server::run(Arc::new(config)).await
}
