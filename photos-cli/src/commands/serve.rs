//! Long-running index: render cycles and periodic sync.

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;

use crate::utils;

pub async fn execute() -> Result<()> {
    let service = utils::connect().await?;
    println!("{} photo index running, Ctrl-C to stop", "Serving".green().bold());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    service.shutdown().await.context("Failed to stop photo index")?;
    Ok(())
}
