//! Thin CLI harness around [`vaultd::VaultPipeline`]. Loads a vault config
//! from a YAML file, starts the pipeline, and runs it until `Ctrl-C`.
//!
//! Not a product surface: it does not implement HTTP routing or a
//! notification transport. Those are external collaborators that would sit
//! in front of a [`vaultd::VaultPipeline`] in a real deployment.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use vaultd::VaultPipeline;

#[derive(Parser, Debug)]
#[command(name = "vaultd", about = "Vault event pipeline daemon")]
struct Cli {
    /// Path to a vault configuration YAML file.
    config: PathBuf,

    /// Trigger a full reindex immediately after startup, then keep running.
    #[arg(long)]
    reindex: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vaultd::init_logging();

    let cli = Cli::parse();

    let config = vaultd::VaultConfig::from_file(&cli.config)
        .with_context(|| format!("loading vault config from {:?}", cli.config))?;

    info!(
        "[INFO] [main] starting vaultd for vault '{}' ({})",
        config.vault_name, config.vault_id
    );

    let pipeline = VaultPipeline::new(&config).context("constructing vault pipeline")?;
    pipeline.run().await.context("starting vault pipeline")?;

    if cli.reindex {
        pipeline.trigger_reindex().await.context("triggering reindex")?;
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("[INFO] [main] shutdown signal received");

    pipeline.shutdown();
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    info!("[INFO] [main] vaultd stopped");
    Ok(())
}
