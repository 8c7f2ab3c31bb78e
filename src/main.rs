//! gsm-migrate - command line entry point.
//!
//! Copies marked secrets from one project to another, or backs them up
//! locally and deletes them from the source with `--delete`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gsm_migrate::{
    backup::DEFAULT_BACKUP_DIR, ignore::DEFAULT_IGNORE_FILE, run, Config, GcpSecretStore, RunMode,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gsm-migrate")]
#[command(about = "Migrate Secret Manager secrets between projects")]
#[command(version)]
struct Cli {
    /// Source project id
    #[arg(long = "srcpid")]
    source_project: String,

    /// Destination project id
    #[arg(long = "dstpid")]
    destination_project: String,

    /// Back up and delete all the keys and values instead of copying them
    #[arg(long)]
    delete: bool,

    /// File listing keys to skip, one per line
    #[arg(long, default_value = DEFAULT_IGNORE_FILE)]
    ignore_file: PathBuf,

    /// Directory backups are written to in delete mode
    #[arg(long, default_value = DEFAULT_BACKUP_DIR)]
    backup_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let succeeded = runtime.block_on(async_main(cli))?;
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn async_main(cli: Cli) -> anyhow::Result<bool> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gsm_migrate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::new(
        &cli.source_project,
        &cli.destination_project,
        RunMode::from_delete_flag(cli.delete),
    );
    config.ignore_file = cli.ignore_file;
    config.backup_dir = cli.backup_dir;
    let config = config.with_env_overrides()?;
    config.validate()?;
    info!(
        "Loaded configuration: source={} destination={} mode={}",
        config.source_project,
        config.destination_project,
        config.mode.as_str()
    );

    let store = GcpSecretStore::from_env()
        .await
        .context("failed to setup client")?;

    let report = run(&config, Arc::new(store)).await?;
    report.log_summary();
    Ok(report.is_success())
}
