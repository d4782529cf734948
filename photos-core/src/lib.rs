//! Photos Core - downloadable, ownable photos bound to shared display surfaces
//!
//! A photo is a named, colored, optionally owned record whose picture is a
//! small square bitmap shown on a host surface that many viewers can look at.
//!
//! # Components
//!
//! - **Downloader** ([`download`]): untrusted URL to normalized bitmap, under
//!   a byte cap, with every failure classified as a [`DownloadOutcome`]
//! - **Renderer** ([`renderer`]): per-surface `Idle → Loading → Ready → Drawn`
//!   state machine behind a global single-flight load gate and a per-cycle
//!   draw gate
//! - **Identity Store** ([`identity`]): durable `photo ↔ surface` bijection
//! - **Authoritative Store** ([`records`]): canonical records shared by nodes
//! - **Index** ([`index`], [`service`]): in-memory view reconciled with the
//!   stores by an idempotent, watermark-driven sync
//!
//! # Example
//!
//! ```no_run
//! use photos_core::{PhotoService, PhotosConfig, Rgb};
//!
//! # async fn example() -> photos_core::Result<()> {
//! let service = PhotoService::start(PhotosConfig::from_env()).await?;
//!
//! let photo = service.create(None, "Sunset", "orange".parse::<Rgb>()?).await?;
//! let outcome = service
//!     .load_from_url(photo.id(), "https://example.com/sunset.png", false)
//!     .await?;
//! println!("{}: {}", photo, outcome.status());
//! # Ok(())
//! # }
//! ```

pub mod bitmap;
pub mod config;
pub mod download;
pub mod error;
pub mod identity;
pub mod index;
pub mod model;
pub mod records;
pub mod renderer;
pub mod service;
pub mod surface;

// Re-export main types for convenience
pub use bitmap::{default_placeholder, Bitmap, BitmapStore};
pub use config::PhotosConfig;
pub use download::{parse_url, DownloadOutcome, Downloader};
pub use error::{PhotoError, Result, StoreError};
pub use identity::{IdentityMapping, IdentityStore, MemoryIdentityStore, SqliteIdentityStore};
pub use index::{PruneReport, RuntimeHandle, RuntimeStatus, SyncReport};
pub use model::{
    OwnerId, PhotoColor, PhotoId, PhotoRecord, Rgb, SurfaceId, FREE_PHOTO_NAME, MAX_NAME_LEN,
};
pub use records::{MemoryPhotoStore, PhotoStore, PostgresPhotoStore};
pub use renderer::RenderState;
pub use service::{PhotoService, Stores};
pub use surface::{LocalSurfaces, SurfaceHost};
