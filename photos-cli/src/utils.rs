//! Common utility functions shared across CLI commands.

use std::fmt;

use anyhow::{Context, Result};
use colored::Colorize;
use photos_core::model::validate_name;
use photos_core::{PhotoService, PhotosConfig, RuntimeHandle};
use serde_json::{json, Value};
use tracing::debug;

/// Boot the index from the environment.
pub async fn connect() -> Result<PhotoService> {
    let config = PhotosConfig::from_env();
    debug!(
        image_root = %config.image_root.display(),
        identity_db = %config.identity_db_path.display(),
        "Booting photo index"
    );
    PhotoService::start(config)
        .await
        .context("Failed to start photo index")
}

/// Clap value parser for photo names.
pub fn parse_name(raw: &str) -> Result<String, String> {
    validate_name(raw).map_err(|e| e.to_string())?;
    Ok(raw.to_string())
}

/// A download that did not produce a bitmap.
#[derive(Debug)]
pub struct LoadFailed {
    pub status: &'static str,
    pub save_failure: bool,
}

impl fmt::Display for LoadFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Download failed: {}", self.status)
    }
}

impl std::error::Error for LoadFailed {}

/// Print a handle as a colored one-line summary.
pub fn print_handle(label: &str, handle: &RuntimeHandle) {
    let line = handle.to_string();
    if handle.is_ready() {
        println!("{} {}", label.green().bold(), line);
    } else {
        println!("{} {}", label.yellow().bold(), line);
    }
}

pub fn handle_json(handle: &RuntimeHandle) -> Value {
    json!({
        "photo_id": handle.record.id,
        "surface_id": handle.surface_id,
        "owner": handle.record.owner,
        "name": handle.record.name,
        "color": handle.record.color.to_string(),
        "created": handle.record.created_at.to_rfc3339(),
        "updated": handle.record.updated_at.to_rfc3339(),
        "status": handle.status.to_string(),
        "render_state": format!("{:?}", handle.render_state),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name() {
        assert_eq!(parse_name("Sunset").unwrap(), "Sunset");
        assert!(parse_name(&"x".repeat(128)).unwrap_err().contains("127"));
    }

    #[test]
    fn test_load_failed_display() {
        let failed = LoadFailed {
            status: "too large",
            save_failure: false,
        };
        assert_eq!(failed.to_string(), "Download failed: too large");
    }
}
