//! Core value types shared across the MailProof domain model

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest edge accepted for a viewport, in CSS pixels
pub const MAX_VIEWPORT_EDGE: u32 = 7680;

/// Largest device pixel ratio accepted for a viewport
pub const MAX_DEVICE_PIXEL_RATIO: f64 = 4.0;

/// A width x height x device-pixel-ratio combination a client is tested at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_dpr")]
    pub device_pixel_ratio: f64,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

fn default_dpr() -> f64 {
    1.0
}

impl Viewport {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            device_pixel_ratio: 1.0,
            name: name.into(),
            is_default: false,
        }
    }

    pub fn with_dpr(mut self, device_pixel_ratio: f64) -> Self {
        self.device_pixel_ratio = device_pixel_ratio;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Desktop preview pane, 600x800 at 1x
    pub fn desktop() -> Self {
        Self::new("desktop", 600, 800).as_default()
    }

    /// Phone-sized viewport, 375x667 at 2x
    pub fn mobile() -> Self {
        Self::new("mobile", 375, 667).with_dpr(2.0)
    }

    /// Viewports used when a job does not name its own
    pub fn defaults() -> Vec<Viewport> {
        vec![Self::desktop(), Self::mobile()]
    }

    /// Physical pixel size after applying the device pixel ratio
    pub fn physical_size(&self) -> (u32, u32) {
        (
            (self.width as f64 * self.device_pixel_ratio).round() as u32,
            (self.height as f64 * self.device_pixel_ratio).round() as u32,
        )
    }

    pub fn validate(&self, entity: &'static str) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation(entity, "viewport name must not be empty"));
        }
        if self.width == 0 || self.width > MAX_VIEWPORT_EDGE {
            return Err(Error::validation(
                entity,
                format!(
                    "viewport '{}' width {} out of range 1..={}",
                    self.name, self.width, MAX_VIEWPORT_EDGE
                ),
            ));
        }
        if self.height == 0 || self.height > MAX_VIEWPORT_EDGE {
            return Err(Error::validation(
                entity,
                format!(
                    "viewport '{}' height {} out of range 1..={}",
                    self.name, self.height, MAX_VIEWPORT_EDGE
                ),
            ));
        }
        if !(self.device_pixel_ratio > 0.0 && self.device_pixel_ratio <= MAX_DEVICE_PIXEL_RATIO) {
            return Err(Error::validation(
                entity,
                format!(
                    "viewport '{}' device pixel ratio {} out of range (0, {}]",
                    self.name, self.device_pixel_ratio, MAX_DEVICE_PIXEL_RATIO
                ),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for Viewport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}x{}@{}x",
            self.name, self.width, self.height, self.device_pixel_ratio
        )
    }
}

/// Validate a viewport list: non-empty, each valid, names unique
pub fn validate_viewports(entity: &'static str, viewports: &[Viewport]) -> Result<()> {
    if viewports.is_empty() {
        return Err(Error::validation(entity, "at least one viewport is required"));
    }
    for (i, viewport) in viewports.iter().enumerate() {
        viewport.validate(entity)?;
        if viewports[..i].iter().any(|v| v.name == viewport.name) {
            return Err(Error::validation(
                entity,
                format!("duplicate viewport name '{}'", viewport.name),
            ));
        }
    }
    Ok(())
}

/// Color scheme a screenshot is captured in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    Dark,
}

impl Theme {
    pub fn from_dark_mode(dark_mode: bool) -> Self {
        if dark_mode {
            Theme::Dark
        } else {
            Theme::Light
        }
    }

    pub fn is_dark(self) -> bool {
        matches!(self, Theme::Dark)
    }
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Theme::Light => write!(f, "light"),
            Theme::Dark => write!(f, "dark"),
        }
    }
}

/// Encoded image format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    Gif,
    Svg,
}

impl Default for ImageFormat {
    fn default() -> Self {
        Self::Png
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageFormat::Png => write!(f, "png"),
            ImageFormat::Jpeg => write!(f, "jpeg"),
            ImageFormat::Webp => write!(f, "webp"),
            ImageFormat::Gif => write!(f, "gif"),
            ImageFormat::Svg => write!(f, "svg"),
        }
    }
}

impl std::str::FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            "gif" => Ok(ImageFormat::Gif),
            "svg" => Ok(ImageFormat::Svg),
            other => Err(Error::validation("image format", format!("unknown format '{}'", other))),
        }
    }
}

/// Round to two decimal places
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Check that a 0-100 score is finite and in range
pub(crate) fn check_percent(entity: &'static str, field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::validation(
            entity,
            format!("{} must be within [0, 100], got {}", field, value),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_viewports() {
        let viewports = Viewport::defaults();
        assert_eq!(viewports.len(), 2);
        assert_eq!((viewports[0].width, viewports[0].height), (600, 800));
        assert!(viewports[0].is_default);
        assert_eq!((viewports[1].width, viewports[1].height), (375, 667));
        assert_eq!(viewports[1].physical_size(), (750, 1334));
        assert!(validate_viewports("test", &viewports).is_ok());
    }

    #[test]
    fn test_viewport_validation() {
        assert!(validate_viewports("test", &[]).is_err());
        assert!(Viewport::new("", 100, 100).validate("test").is_err());
        assert!(Viewport::new("wide", 0, 100).validate("test").is_err());
        assert!(Viewport::new("retina", 100, 100).with_dpr(0.0).validate("test").is_err());

        let dup = vec![Viewport::desktop(), Viewport::new("desktop", 800, 600)];
        let err = validate_viewports("test", &dup).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_image_format_parse() {
        assert_eq!("JPG".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert!("bmp".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn test_check_percent() {
        assert!(check_percent("test", "score", 0.0).is_ok());
        assert!(check_percent("test", "score", 100.0).is_ok());
        assert!(check_percent("test", "score", 100.5).is_err());
        assert!(check_percent("test", "score", f64::NAN).is_err());
    }
}
