//! File store for normalized bitmap artifacts.
//!
//! Artifacts live under the image root as `%05d.png`, keyed by photo id. An
//! absent artifact is not an error: readers substitute
//! [`default_placeholder`].

use std::path::PathBuf;
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};
use tracing::debug;

use crate::download::normalize;
use crate::error::StoreError;
use crate::model::{hsb_to_rgb, PhotoId};

/// A normalized square RGBA bitmap.
pub type Bitmap = RgbaImage;

/// Artifact file name for a photo.
pub fn bitmap_file_name(photo_id: PhotoId) -> String {
    format!("{:05}.png", photo_id.0)
}

/// Placeholder shown for photos without an artifact.
///
/// Pixel (x, y) is HSB(x / (n-1), y / (n-1), y / (n-1)), a hue sweep that
/// fades to black at the top.
pub fn default_placeholder(resolution: u32) -> Bitmap {
    let span = resolution.saturating_sub(1).max(1) as f32;
    RgbaImage::from_fn(resolution, resolution, |x, y| {
        let fy = y as f32 / span;
        let (r, g, b) = hsb_to_rgb(x as f32 / span, fy, fy).components();
        image::Rgba([r, g, b, 0xFF])
    })
}

/// Directory-backed bitmap store. All file I/O runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct BitmapStore {
    root: PathBuf,
    resolution: u32,
}

impl BitmapStore {
    pub fn new(root: impl Into<PathBuf>, resolution: u32) -> Self {
        Self {
            root: root.into(),
            resolution,
        }
    }

    pub fn path_for(&self, photo_id: PhotoId) -> PathBuf {
        self.root.join(bitmap_file_name(photo_id))
    }

    /// Create the image root if missing.
    pub async fn ensure_root(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub async fn exists(&self, photo_id: PhotoId) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.path_for(photo_id)).await?)
    }

    /// Read an artifact. `Ok(None)` when it does not exist.
    pub async fn load(&self, photo_id: PhotoId) -> Result<Option<Bitmap>, StoreError> {
        let path = self.path_for(photo_id);
        let resolution = self.resolution;
        tokio::task::spawn_blocking(move || -> Result<Option<Bitmap>, StoreError> {
            if !path.is_file() {
                return Ok(None);
            }
            let image = image::open(&path)
                .map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))?;
            let bitmap = if image.dimensions() == (resolution, resolution) {
                image.to_rgba8()
            } else {
                normalize(image, resolution)
            };
            Ok(Some(bitmap))
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }

    /// Write an artifact as PNG, replacing any previous one atomically.
    pub async fn save(&self, photo_id: PhotoId, bitmap: Arc<Bitmap>) -> Result<(), StoreError> {
        let path = self.path_for(photo_id);
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            std::fs::create_dir_all(&root)?;
            let tmp = path.with_extension("png.tmp");
            DynamicImage::ImageRgba8((*bitmap).clone())
                .save_with_format(&tmp, ImageFormat::Png)
                .map_err(|e| StoreError::Io(format!("{}: {e}", tmp.display())))?;
            std::fs::rename(&tmp, &path)?;
            debug!(path = %path.display(), "Saved bitmap");
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
    }
}
