//! Image acquisition pipeline.
//!
//! Turns an untrusted URL into a normalized square bitmap. Every failure is
//! classified into a [`DownloadOutcome`]; nothing in here returns an error or
//! panics on bad input, and nothing touches the file store.
//!
//! # Pipeline
//!
//! 1. Declared `Content-Length` is checked against the size limit before any
//!    body byte is read. A missing length counts as exactly the limit.
//! 2. The body is read into a buffer bounded by the effective limit. A stream
//!    that ends before the declared length is treated as `NotFound`.
//! 3. The buffer is decoded; decode failure is `NotImage`.
//! 4. The image is center-cropped to a square and resized to the target
//!    resolution with a Lanczos filter.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader, Limits};
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::bitmap::Bitmap;
use crate::error::{PhotoError, Result};

/// Largest source dimension accepted by the decoder.
const MAX_SOURCE_DIMENSION: u32 = 8192;

/// Result of a download attempt.
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    /// Normalized bitmap at the target resolution.
    Success(Arc<Bitmap>),
    /// Unreachable host, non-success status, or a truncated body.
    NotFound,
    /// Declared or actual size exceeds the limit.
    TooLarge,
    /// The payload does not decode as a supported raster image.
    NotImage,
    /// Downloaded fine, but writing the artifact failed.
    SaveFailure(String),
    /// Anything else.
    Unknown(String),
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Short machine-readable status name.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::NotFound => "not_found",
            Self::TooLarge => "too_large",
            Self::NotImage => "not_image",
            Self::SaveFailure(_) => "save_failure",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Human-readable description for the requesting user.
    pub fn describe(&self, url: &Url) -> String {
        match self {
            Self::Success(_) => {
                "Image successfully downloaded. Please wait for the photo to update.".to_string()
            }
            Self::NotFound => format!("File not found: {url}"),
            Self::TooLarge => format!("File too large: {url}"),
            Self::NotImage => format!("Not an image: {url}"),
            Self::SaveFailure(_) => "Could not save image. Please contact an administrator.".into(),
            Self::Unknown(cause) => format!("An unknown error occurred: {cause}"),
        }
    }
}

/// Parse and validate a user-supplied download URL.
pub fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|_| PhotoError::validation(format!("Invalid URL: {raw}.")))?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(url),
        _ => Err(PhotoError::validation(format!("Invalid URL: {raw}."))),
    }
}

/// A streamed response body with an optional declared length.
#[async_trait]
pub trait BodySource: Send {
    fn declared_length(&self) -> Option<u64>;

    /// Next chunk of the body, `None` at end of stream.
    async fn next_chunk(&mut self) -> std::result::Result<Option<Vec<u8>>, String>;
}

struct ResponseBody(reqwest::Response);

#[async_trait]
impl BodySource for ResponseBody {
    fn declared_length(&self) -> Option<u64> {
        self.0.content_length()
    }

    async fn next_chunk(&mut self) -> std::result::Result<Option<Vec<u8>>, String> {
        self.0
            .chunk()
            .await
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .map_err(|e| e.to_string())
    }
}

/// Read a body into a buffer bounded by the effective limit.
///
/// Returns the classified failure on the error side.
pub async fn read_bounded<B: BodySource + ?Sized>(
    body: &mut B,
    size_limit: usize,
    override_limit: bool,
) -> std::result::Result<Vec<u8>, DownloadOutcome> {
    let declared = body.declared_length();
    let effective = match declared {
        Some(len) => usize::try_from(len).unwrap_or(usize::MAX),
        None => size_limit,
    };

    if !override_limit && effective > size_limit {
        debug!(declared = ?declared, size_limit, "Declared length exceeds limit");
        return Err(DownloadOutcome::TooLarge);
    }

    let mut buf = Vec::with_capacity(effective.min(size_limit));
    loop {
        match body.next_chunk().await {
            Ok(Some(chunk)) => {
                if buf.len() + chunk.len() > effective {
                    debug!(effective, "Body exceeds effective limit");
                    return Err(DownloadOutcome::TooLarge);
                }
                buf.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, read = buf.len(), "Body read terminated early");
                return Err(DownloadOutcome::NotFound);
            }
        }
    }

    if declared.is_some() && buf.len() < effective {
        debug!(read = buf.len(), expected = effective, "Short body");
        return Err(DownloadOutcome::NotFound);
    }

    Ok(buf)
}

/// Decode raw bytes and normalize them into a square bitmap.
pub fn decode_bitmap(bytes: &[u8], resolution: u32) -> DownloadOutcome {
    match decode(bytes) {
        Some(image) => DownloadOutcome::Success(Arc::new(normalize(image, resolution))),
        None => DownloadOutcome::NotImage,
    }
}

fn decode(bytes: &[u8]) -> Option<DynamicImage> {
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_SOURCE_DIMENSION);
    limits.max_image_height = Some(MAX_SOURCE_DIMENSION);
    reader.limits(limits);
    let image = reader.decode().ok()?;
    let (width, height) = image.dimensions();
    (width > 0 && height > 0).then_some(image)
}

/// Center-crop to a square, then resize to `resolution` if needed.
pub fn normalize(image: DynamicImage, resolution: u32) -> Bitmap {
    let (width, height) = image.dimensions();
    let square = if width > height {
        image.crop_imm((width - height) / 2, 0, height, height)
    } else if height > width {
        image.crop_imm(0, (height - width) / 2, width, width)
    } else {
        image
    };
    let sized = if square.width() != resolution || square.height() != resolution {
        square.resize_exact(resolution, resolution, FilterType::Lanczos3)
    } else {
        square
    };
    sized.to_rgba8()
}

/// HTTP(S) image fetcher.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
    resolution: u32,
}

impl Downloader {
    /// Create a downloader producing bitmaps of `resolution` × `resolution`.
    pub fn new(resolution: u32, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PhotoError::Bootstrap(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, resolution })
    }

    /// Fetch `url` and normalize it. Never fails; see [`DownloadOutcome`].
    pub async fn fetch(&self, url: &Url, size_limit: usize, override_limit: bool) -> DownloadOutcome {
        let response = match self.client.get(url.as_str()).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() => {
                warn!(%url, error = %e, "Download unreachable");
                return DownloadOutcome::NotFound;
            }
            Err(e) => {
                warn!(%url, error = %e, "Download request failed");
                return DownloadOutcome::Unknown(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(%url, %status, "Download returned non-success status");
            return DownloadOutcome::NotFound;
        }

        let mut body = ResponseBody(response);
        let bytes = match read_bounded(&mut body, size_limit, override_limit).await {
            Ok(bytes) => bytes,
            Err(outcome) => return outcome,
        };

        let resolution = self.resolution;
        // Decoding and resampling are CPU bound
        match tokio::task::spawn_blocking(move || decode_bitmap(&bytes, resolution)).await {
            Ok(outcome) => {
                debug!(%url, status = outcome.status(), "Download finished");
                outcome
            }
            Err(e) => DownloadOutcome::Unknown(e.to_string()),
        }
    }
}
