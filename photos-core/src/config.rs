//! Configuration module
//!
//! Loads configuration from environment variables with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Default download cap in bytes (32 KiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 32 * 1024;

/// Default side length of a normalized bitmap.
pub const DEFAULT_RESOLUTION: u32 = 128;

/// Photos configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct PhotosConfig {
    /// Authoritative Store connection string (None = in-memory store)
    pub database_url: Option<String>,
    /// Database connection pool maximum connections (default: 10)
    pub database_max_connections: u32,
    /// SQLite file holding the identity mappings
    pub identity_db_path: PathBuf,
    /// Directory holding bitmap artifacts
    pub image_root: PathBuf,
    /// Download cap in bytes unless overridden (default: 32 KiB)
    pub max_file_size: usize,
    /// Side length of normalized bitmaps (default: 128)
    pub resolution: u32,
    /// Interval between incremental sync passes (default: 30s)
    pub sync_interval: Duration,
    /// Length of one render processing cycle (default: 50ms)
    pub cycle_interval: Duration,
    /// Transport timeout for downloads (default: 10s)
    pub download_timeout: Duration,
}

impl Default for PhotosConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            identity_db_path: PathBuf::from("photos/local.db"),
            image_root: PathBuf::from("photos/images"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            resolution: DEFAULT_RESOLUTION,
            sync_interval: Duration::from_secs(30),
            cycle_interval: Duration::from_millis(50),
            download_timeout: Duration::from_secs(10),
        }
    }
}

impl PhotosConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty());

        let database_max_connections = env_parse("DATABASE_MAX_CONNECTIONS")
            .unwrap_or(defaults.database_max_connections);

        let identity_db_path = std::env::var("PHOTOS_IDENTITY_DB")
            .map(PathBuf::from)
            .unwrap_or(defaults.identity_db_path);

        let image_root = std::env::var("PHOTOS_IMAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.image_root);

        let max_file_size = env_parse("PHOTOS_MAX_FILE_SIZE").unwrap_or(defaults.max_file_size);

        let resolution = env_parse("PHOTOS_RESOLUTION")
            .filter(|r: &u32| *r > 0)
            .unwrap_or(defaults.resolution);

        let sync_interval = env_parse("PHOTOS_SYNC_INTERVAL_SECS")
            .filter(|s: &u64| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.sync_interval);

        let cycle_interval = env_parse("PHOTOS_CYCLE_MILLIS")
            .filter(|ms: &u64| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.cycle_interval);

        let download_timeout = env_parse("PHOTOS_DOWNLOAD_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.download_timeout);

        Self {
            database_url,
            database_max_connections,
            identity_db_path,
            image_root,
            max_file_size,
            resolution,
            sync_interval,
            cycle_interval,
            download_timeout,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PhotosConfig::default();
        assert!(config.database_url.is_none());
        assert_eq!(config.max_file_size, 32 * 1024);
        assert_eq!(config.resolution, 128);
        assert_eq!(config.sync_interval, Duration::from_secs(30));
    }
}
