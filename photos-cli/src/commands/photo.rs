//! Per-photo commands.
//!
//! Each command boots the index, performs one operation and shuts it down.

use std::future::Future;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use photos_core::{
    parse_url, DownloadOutcome, OwnerId, PhotoError, PhotoId, PhotoService, Rgb, SurfaceId,
    FREE_PHOTO_NAME,
};
use tracing::{info, warn};

use crate::utils::{self, handle_json, print_handle, LoadFailed};

/// Run `op` against a freshly booted index, shutting it down afterwards.
async fn with_service<T, F, Fut>(op: F) -> Result<T>
where
    F: FnOnce(PhotoService) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let service = utils::connect().await?;
    let result = op(service.clone()).await;
    if let Err(e) = service.shutdown().await {
        warn!(error = %e, "Photo index did not shut down cleanly");
    }
    result
}

pub async fn create(owner: Option<OwnerId>, name: String, color: Option<Rgb>) -> Result<()> {
    let color = color.unwrap_or_else(Rgb::random);
    let handle = with_service(|service| async move {
        service
            .create(owner, name, color)
            .await
            .context("Failed to create photo")
    })
    .await?;

    info!(photo_id = %handle.id(), "Created photo");
    print_handle("Created", &handle);
    Ok(())
}

pub async fn grant(owner: OwnerId) -> Result<()> {
    let handle = with_service(|service| async move {
        service
            .create(Some(owner), FREE_PHOTO_NAME, Rgb::random())
            .await
            .with_context(|| format!("Failed to grant a photo to {owner}"))
    })
    .await?;

    print_handle("Granted", &handle);
    Ok(())
}

pub async fn load(id: PhotoId, raw_url: String, force: bool) -> Result<()> {
    let url = parse_url(&raw_url).context("Failed to parse URL")?;
    if force {
        warn!(photo_id = %id, "Download size cap overridden");
    }

    let outcome = with_service(|service| {
        let url = url.clone();
        async move {
            service
                .load_from_url(id, url.as_str(), force)
                .await
                .with_context(|| format!("Failed to load photo {id}"))
        }
    })
    .await?;

    let message = outcome.describe(&url);
    if outcome.is_success() {
        println!("{} {}", "Loaded".green().bold(), message);
        return Ok(());
    }
    println!("{} {}", "Failed".red().bold(), message);
    Err(LoadFailed {
        status: outcome.status(),
        save_failure: matches!(outcome, DownloadOutcome::SaveFailure(_)),
    }
    .into())
}

pub async fn rename(id: PhotoId, name: String) -> Result<()> {
    let handle = with_service(|service| async move {
        service
            .rename(id, name)
            .await
            .with_context(|| format!("Failed to rename photo {id}"))
    })
    .await?;

    print_handle("Renamed", &handle);
    Ok(())
}

pub async fn recolor(id: PhotoId, color: Rgb) -> Result<()> {
    let handle = with_service(|service| async move {
        service
            .recolor(id, color)
            .await
            .with_context(|| format!("Failed to recolor photo {id}"))
    })
    .await?;

    print_handle("Recolored", &handle);
    Ok(())
}

pub async fn transfer(id: PhotoId, owner: OwnerId) -> Result<()> {
    let handle = with_service(|service| async move {
        service
            .transfer_ownership(id, Some(owner))
            .await
            .with_context(|| format!("Failed to transfer photo {id}"))
    })
    .await?;

    print_handle("Transferred", &handle);
    Ok(())
}

pub async fn confiscate(id: PhotoId) -> Result<()> {
    let handle = with_service(|service| async move {
        service
            .confiscate(id)
            .await
            .with_context(|| format!("Failed to confiscate photo {id}"))
    })
    .await?;

    print_handle("Confiscated", &handle);
    Ok(())
}

pub async fn delete(id: PhotoId) -> Result<()> {
    with_service(|service| async move {
        service
            .delete_photo(id)
            .await
            .with_context(|| format!("Failed to delete photo {id}"))
    })
    .await?;

    println!("{} photo {}", "Deleted".green().bold(), id);
    Ok(())
}

pub async fn info(id: Option<PhotoId>, surface: Option<SurfaceId>) -> Result<()> {
    let handle = with_service(|service| async move {
        let found = match (id, surface) {
            (Some(id), _) => service
                .find_by_id(id)
                .await?
                .ok_or(PhotoError::NotFound(id))?,
            (None, Some(surface)) => service.find_by_surface(surface).await?.ok_or_else(|| {
                PhotoError::validation(format!("No photo is bound to surface {surface}"))
            })?,
            (None, None) => bail!("Either a photo id or --surface is required"),
        };
        Ok::<_, anyhow::Error>(found)
    })
    .await
    .context("Failed to look up photo")?;

    print_handle("Photo", &handle);
    println!("   {} {:?}", "Render state:".dimmed(), handle.render_state);
    println!(
        "   {} {}",
        "Updated:".dimmed(),
        handle.record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    Ok(())
}

pub async fn list(owner: OwnerId, json: bool) -> Result<()> {
    let photos = with_service(|service| async move {
        service
            .list_by_owner(owner)
            .await
            .with_context(|| format!("Failed to list photos of {owner}"))
    })
    .await?;

    if json {
        let values: Vec<_> = photos.iter().map(handle_json).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    if photos.is_empty() {
        println!("{} has no photos", owner);
        return Ok(());
    }
    println!("{} {} photo(s)", owner.to_string().bold(), photos.len());
    for handle in &photos {
        println!("   {handle}");
    }
    Ok(())
}
