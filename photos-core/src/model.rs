//! Shared data model: identifiers, colors and the canonical photo record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PhotoError, Result};

/// Maximum photo name length, in characters.
pub const MAX_NAME_LEN: usize = 127;

/// Name given to photos handed out by administrators.
pub const FREE_PHOTO_NAME: &str = "Free Photo";

/// Canonical photo id, assigned by the Authoritative Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoId(pub i64);

/// Id of a renderable surface allocated by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(pub i64);

/// Id of a user who may own photos.
pub type OwnerId = Uuid;

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PhotoId {
    type Err = PhotoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().parse::<i64>() {
            Ok(id) if id > 0 => Ok(Self(id)),
            _ => Err(PhotoError::validation(format!("Invalid photo id: {s}"))),
        }
    }
}

/// Current time truncated to microseconds.
///
/// PostgreSQL stores timestamps with microsecond precision; truncating here
/// keeps locally applied records structurally equal to what a later sync
/// reads back.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// A 24-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rgb(u32);

impl Rgb {
    pub const fn new(hex: u32) -> Self {
        Self(hex & 0xFF_FFFF)
    }

    pub const fn from_components(r: u8, g: u8, b: u8) -> Self {
        Self(((r as u32) << 16) | ((g as u32) << 8) | b as u32)
    }

    pub const fn hex(self) -> u32 {
        self.0
    }

    pub const fn components(self) -> (u8, u8, u8) {
        ((self.0 >> 16) as u8, (self.0 >> 8) as u8, self.0 as u8)
    }

    /// Random saturated color: random hue, saturation 0.66, full brightness.
    pub fn random() -> Self {
        let hue: f32 = rand::thread_rng().gen();
        hsb_to_rgb(hue, 0.66, 1.0)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06x}", self.0)
    }
}

impl FromStr for Rgb {
    type Err = PhotoError;

    /// Accepts a palette name, `#RRGGBB`, `0xRRGGBB` or `r,g,b`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(named) = s.parse::<PhotoColor>() {
            return Ok(named.rgb());
        }
        if let Some(hex) = s.strip_prefix('#').or_else(|| s.strip_prefix("0x")) {
            if hex.len() == 6 {
                if let Ok(value) = u32::from_str_radix(hex, 16) {
                    return Ok(Self::new(value));
                }
            }
            return Err(PhotoError::validation(format!("Invalid hex color: {s}")));
        }
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() == 3 {
            let mut c = [0u8; 3];
            for (slot, part) in c.iter_mut().zip(&parts) {
                *slot = part.parse().map_err(|_| {
                    PhotoError::validation("Color component must be between 0 and 255.")
                })?;
            }
            return Ok(Self::from_components(c[0], c[1], c[2]));
        }
        Err(PhotoError::validation(format!("Unknown color: {s}.")))
    }
}

/// Convert hue/saturation/brightness (each in `0.0..=1.0`) to RGB.
pub fn hsb_to_rgb(hue: f32, saturation: f32, brightness: f32) -> Rgb {
    let scale = |v: f32| (v * 255.0 + 0.5) as u8;
    if saturation == 0.0 {
        let v = scale(brightness);
        return Rgb::from_components(v, v, v);
    }
    let h = (hue - hue.floor()) * 6.0;
    let f = h - h.floor();
    let p = brightness * (1.0 - saturation);
    let q = brightness * (1.0 - saturation * f);
    let t = brightness * (1.0 - saturation * (1.0 - f));
    let (r, g, b) = match h as u32 {
        0 => (brightness, t, p),
        1 => (q, brightness, p),
        2 => (p, brightness, t),
        3 => (p, q, brightness),
        4 => (t, p, brightness),
        _ => (brightness, p, q),
    };
    Rgb::from_components(scale(r), scale(g), scale(b))
}

/// Named palette accepted wherever a color is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoColor {
    Aqua,
    Black,
    Blue,
    Fuchsia,
    Gray,
    Green,
    Lime,
    Maroon,
    Navy,
    Olive,
    Orange,
    Purple,
    Red,
    Silver,
    Teal,
    White,
    Yellow,
}

impl PhotoColor {
    pub const ALL: [PhotoColor; 17] = [
        Self::Aqua,
        Self::Black,
        Self::Blue,
        Self::Fuchsia,
        Self::Gray,
        Self::Green,
        Self::Lime,
        Self::Maroon,
        Self::Navy,
        Self::Olive,
        Self::Orange,
        Self::Purple,
        Self::Red,
        Self::Silver,
        Self::Teal,
        Self::White,
        Self::Yellow,
    ];

    pub fn rgb(self) -> Rgb {
        Rgb::new(match self {
            Self::Aqua => 0x00FFFF,
            Self::Black => 0x000000,
            Self::Blue => 0x0000FF,
            Self::Fuchsia => 0xFF00FF,
            Self::Gray => 0x808080,
            Self::Green => 0x008000,
            Self::Lime => 0x00FF00,
            Self::Maroon => 0x800000,
            Self::Navy => 0x000080,
            Self::Olive => 0x808000,
            Self::Orange => 0xFFA500,
            Self::Purple => 0x800080,
            Self::Red => 0xFF0000,
            Self::Silver => 0xC0C0C0,
            Self::Teal => 0x008080,
            Self::White => 0xFFFFFF,
            Self::Yellow => 0xFFFF00,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Aqua => "aqua",
            Self::Black => "black",
            Self::Blue => "blue",
            Self::Fuchsia => "fuchsia",
            Self::Gray => "gray",
            Self::Green => "green",
            Self::Lime => "lime",
            Self::Maroon => "maroon",
            Self::Navy => "navy",
            Self::Olive => "olive",
            Self::Orange => "orange",
            Self::Purple => "purple",
            Self::Red => "red",
            Self::Silver => "silver",
            Self::Teal => "teal",
            Self::White => "white",
            Self::Yellow => "yellow",
        }
    }
}

impl FromStr for PhotoColor {
    type Err = PhotoError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.name() == lower)
            .ok_or_else(|| PhotoError::validation(format!("Unknown color: {s}.")))
    }
}

/// Validate a photo name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.chars().count() > MAX_NAME_LEN {
        return Err(PhotoError::validation(format!(
            "Name cannot be longer than {MAX_NAME_LEN} characters."
        )));
    }
    Ok(())
}

/// Input for inserting a new record into the Authoritative Store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPhoto {
    pub owner: Option<OwnerId>,
    pub name: String,
    pub color: Rgb,
    pub created_at: DateTime<Utc>,
}

impl NewPhoto {
    pub fn new(owner: Option<OwnerId>, name: impl Into<String>, color: Rgb) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            owner,
            name,
            color,
            created_at: now(),
        })
    }
}

/// Canonical photo record as held by the Authoritative Store.
///
/// `updated_at` never decreases; every mutation goes through a setter that
/// bumps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: PhotoId,
    pub owner: Option<OwnerId>,
    pub name: String,
    pub color: Rgb,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhotoRecord {
    /// Build the stored record for a freshly inserted row.
    pub fn from_new(id: PhotoId, input: NewPhoto) -> Self {
        Self {
            id,
            owner: input.owner,
            name: input.name,
            color: input.color,
            created_at: input.created_at,
            updated_at: input.created_at,
        }
    }

    /// Bump `updated_at` to now, never moving it backwards.
    pub fn touch(&mut self) {
        let now = now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn rename(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        validate_name(&name)?;
        self.name = name;
        self.touch();
        Ok(())
    }

    pub fn recolor(&mut self, color: Rgb) {
        self.color = color;
        self.touch();
    }

    pub fn set_owner(&mut self, owner: Option<OwnerId>) {
        self.owner = owner;
        self.touch();
    }

    /// Creation date formatted as `yy/MM/dd`.
    pub fn created_date(&self) -> String {
        self.created_at.format("%y/%m/%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_length_limit() {
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN)).is_ok());
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
        // Counted in characters, not bytes
        assert!(validate_name(&"é".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_parse_colors() {
        assert_eq!("fuchsia".parse::<Rgb>().unwrap(), Rgb::new(0xFF00FF));
        assert_eq!("ORANGE".parse::<Rgb>().unwrap(), Rgb::new(0xFFA500));
        assert_eq!("#ff00ff".parse::<Rgb>().unwrap(), Rgb::new(0xFF00FF));
        assert_eq!("0x00ff00".parse::<Rgb>().unwrap(), Rgb::new(0x00FF00));
        assert_eq!("255, 0, 128".parse::<Rgb>().unwrap(), Rgb::new(0xFF0080));
        assert!("256,0,0".parse::<Rgb>().is_err());
        assert!("#fff".parse::<Rgb>().is_err());
        assert!("chartreuse".parse::<Rgb>().is_err());
    }

    #[test]
    fn test_rgb_masks_to_24_bits() {
        assert_eq!(Rgb::new(0xFFFF_FFFF).hex(), 0xFF_FFFF);
        assert_eq!(Rgb::new(0x12_3456).components(), (0x12, 0x34, 0x56));
        assert_eq!(Rgb::new(0xFF00FF).to_string(), "#ff00ff");
    }

    #[test]
    fn test_hsb_primaries() {
        assert_eq!(hsb_to_rgb(0.0, 1.0, 1.0), Rgb::new(0xFF0000));
        assert_eq!(hsb_to_rgb(1.0 / 3.0, 1.0, 1.0), Rgb::new(0x00FF00));
        assert_eq!(hsb_to_rgb(0.5, 0.0, 0.0), Rgb::new(0x000000));
        assert_eq!(hsb_to_rgb(0.5, 0.0, 1.0), Rgb::new(0xFFFFFF));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let input = NewPhoto::new(None, "Test", Rgb::new(0)).unwrap();
        let mut record = PhotoRecord::from_new(PhotoId(1), input);
        let future = record.updated_at + chrono::Duration::days(1);
        record.updated_at = future;
        record.recolor(Rgb::new(0xFF));
        assert_eq!(record.updated_at, future);
    }

    #[test]
    fn test_photo_id_parse() {
        assert_eq!("42".parse::<PhotoId>().unwrap(), PhotoId(42));
        assert!("0".parse::<PhotoId>().is_err());
        assert!("abc".parse::<PhotoId>().is_err());
    }
}
