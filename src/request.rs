//! Capture request parsing and validation
//!
//! [`CaptureParams`] is the loosely-typed wire shape accepted by the HTTP
//! layer. [`CaptureRequest::from_params`] turns it into a validated value, or
//! an [`CaptureError::InvalidRequest`] before any engine resource is touched.

use crate::{validate_url, CaptureDefaults, CaptureError, ImageFormat, LimitConfig, Viewport};
use serde::{Deserialize, Serialize};
use url::Url;

/// Raw capture parameters as submitted by a client
///
/// Numeric fields are signed so that out-of-range values reach validation and
/// are reported as invalid requests rather than decoding errors.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureParams {
    pub url: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub format: Option<String>,
    pub full_page: Option<bool>,
    pub quality: Option<i64>,
}

impl CaptureParams {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

/// A validated, immutable capture request
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub url: Url,
    pub viewport: Viewport,
    pub format: ImageFormat,
    pub full_page: bool,
    /// Set only for lossy formats
    pub quality: Option<u8>,
}

impl CaptureRequest {
    pub fn from_params(
        params: &CaptureParams,
        defaults: &CaptureDefaults,
        limits: &LimitConfig,
    ) -> Result<Self, CaptureError> {
        let raw_url = params
            .url
            .as_deref()
            .ok_or_else(|| CaptureError::InvalidRequest("url is required".to_string()))?;
        let url = validate_url(raw_url).map_err(CaptureError::InvalidRequest)?;

        let width = dimension("width", params.width, defaults.viewport.width, limits.max_dimension)?;
        let height = dimension("height", params.height, defaults.viewport.height, limits.max_dimension)?;

        let format = match params.format.as_deref() {
            None => defaults.format,
            Some(name) => ImageFormat::parse(name).ok_or_else(|| {
                CaptureError::InvalidRequest(format!(
                    "unsupported format '{name}', expected png (raster-lossless) or jpeg (raster-lossy)"
                ))
            })?,
        };

        let quality = match (params.quality, format.is_lossy()) {
            (Some(q), true) if (1..=100).contains(&q) => Some(q as u8),
            (Some(q), true) => {
                return Err(CaptureError::InvalidRequest(format!(
                    "quality must be between 1 and 100, got {q}"
                )))
            }
            (Some(_), false) => {
                return Err(CaptureError::InvalidRequest(format!(
                    "quality only applies to lossy formats, not {}",
                    format.as_str()
                )))
            }
            (None, true) => Some(defaults.jpeg_quality),
            (None, false) => None,
        };

        Ok(Self {
            url,
            viewport: Viewport { width, height },
            format,
            full_page: params.full_page.unwrap_or(defaults.full_page),
            quality,
        })
    }
}

fn dimension(name: &str, value: Option<i64>, default: u32, max: u32) -> Result<u32, CaptureError> {
    match value {
        None => Ok(default),
        Some(v) if v >= 1 && v <= i64::from(max) => Ok(v as u32),
        Some(v) => Err(CaptureError::InvalidRequest(format!(
            "{name} must be between 1 and {max}, got {v}"
        ))),
    }
}
