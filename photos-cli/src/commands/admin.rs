//! Administrative commands over the whole store.

use anyhow::{Context, Result};
use colored::Colorize;
use photos_core::OwnerId;
use tracing::warn;

use crate::utils;

pub async fn transfer_all(from: OwnerId, to: Option<OwnerId>) -> Result<()> {
    let service = utils::connect().await?;
    let result = service
        .transfer_all(from, to)
        .await
        .with_context(|| format!("Failed to transfer the photos of {from}"));
    service.shutdown().await.ok();
    let count = result?;

    let target = to.map_or_else(|| "nobody".to_string(), |to| to.to_string());
    println!(
        "{} {} photo(s) from {} to {}",
        "Transferred".green().bold(),
        count,
        from,
        target
    );
    Ok(())
}

pub async fn prune(confirm: bool) -> Result<()> {
    let service = utils::connect().await?;
    let result = service.prune(confirm).await.context("Failed to prune");
    service.shutdown().await.ok();
    let report = result?;

    if report.is_clean() {
        println!(
            "{} {} photo(s) scanned, nothing to prune",
            "Clean".green().bold(),
            report.total
        );
        return Ok(());
    }

    for id in &report.blank {
        println!("   {} photo {} has no image", "blank".yellow(), id);
    }
    for mapping in &report.orphaned {
        println!(
            "   {} surface {} is bound to missing photo {}",
            "orphan".yellow(),
            mapping.surface_id,
            mapping.photo_id
        );
    }

    if confirm {
        warn!(
            blank = report.blank.len(),
            removed = report.removed(),
            "Pruned photo store"
        );
        println!(
            "{} {} blank photo(s) and {} mapping(s) removed",
            "Pruned".red().bold(),
            report.blank.len(),
            report.removed()
        );
    } else {
        println!(
            "{} {} blank of {} photo(s), {} orphaned mapping(s). Re-run with --confirm to delete.",
            "Dry run".yellow().bold(),
            report.blank.len(),
            report.total,
            report.orphaned.len()
        );
    }
    Ok(())
}
