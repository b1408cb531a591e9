//! Configuration management with serde serialization/deserialization
//!
//! This module provides the explicit configuration structure handed to the
//! capture pipeline, concurrency governor and HTTP server at construction,
//! including capture defaults, timeouts, admission bounds and Chrome settings.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the capture service
///
/// Every field has a default, so a configuration file only needs to name the
/// values it overrides. Durations are written in humantime form (`"30s"`,
/// `"500ms"`).
///
/// # Examples
///
/// ```rust
/// use capture_service::Config;
///
/// let config = Config::default();
/// assert!(config.validate().is_ok());
///
/// let config: Config = serde_json::from_str(r#"{"governor": {"max_concurrent_captures": 2}}"#).unwrap();
/// assert_eq!(config.governor.max_concurrent_captures, 2);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings
    pub server: ServerConfig,

    /// Admission control for concurrent captures
    pub governor: GovernorConfig,

    /// Per-step and overall capture timeouts
    pub timeouts: TimeoutConfig,

    /// Values used when a capture request leaves a parameter out
    pub defaults: CaptureDefaults,

    /// Upper bounds on request parameters and history pages
    pub limits: LimitConfig,

    /// Render-readiness heuristic applied after navigation
    pub wait_policy: WaitPolicy,

    /// Chrome/Chromium launch settings
    pub chrome: ChromeSettings,

    /// Expose Prometheus metrics at `/metrics` (default: true)
    pub metrics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            governor: GovernorConfig::default(),
            timeouts: TimeoutConfig::default(),
            defaults: CaptureDefaults::default(),
            limits: LimitConfig::default(),
            wait_policy: WaitPolicy::default(),
            chrome: ChromeSettings::default(),
            metrics_enabled: true,
        }
    }
}

impl Config {
    /// Load a configuration file (JSON). Missing fields fall back to defaults.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.governor.max_concurrent_captures == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_captures must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("launch", self.timeouts.launch),
            ("navigation", self.timeouts.navigation),
            ("capture", self.timeouts.capture),
            ("overall", self.timeouts.overall),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{name} timeout must be greater than 0"
                )));
            }
        }

        if self.limits.max_dimension == 0 {
            return Err(ConfigError::Invalid(
                "max_dimension must be greater than 0".to_string(),
            ));
        }

        let viewport = &self.defaults.viewport;
        if viewport.width == 0
            || viewport.height == 0
            || viewport.width > self.limits.max_dimension
            || viewport.height > self.limits.max_dimension
        {
            return Err(ConfigError::Invalid(format!(
                "default viewport {}x{} must be within 1..={}",
                viewport.width, viewport.height, self.limits.max_dimension
            )));
        }

        if !(1..=100).contains(&self.defaults.jpeg_quality) {
            return Err(ConfigError::Invalid(
                "jpeg_quality must be between 1 and 100".to_string(),
            ));
        }

        if self.limits.max_page_size == 0
            || self.limits.default_page_size == 0
            || self.limits.default_page_size > self.limits.max_page_size
        {
            return Err(ConfigError::Invalid(
                "history page sizes must satisfy 0 < default_page_size <= max_page_size"
                    .to_string(),
            ));
        }

        if self.wait_policy.quiet_window.is_zero() {
            return Err(ConfigError::Invalid(
                "wait_policy.quiet_window must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1)
    pub host: String,

    /// Port to listen on (default: 3020)
    pub port: u16,

    /// Allow cross-origin requests from any origin (default: true)
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3020,
            cors_permissive: true,
        }
    }
}

/// Admission bounds for the concurrency governor
///
/// Each admitted capture owns one Chrome process, so `max_concurrent_captures`
/// is effectively the ceiling on live browser processes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Captures allowed to run at once (default: number of CPUs)
    pub max_concurrent_captures: usize,

    /// Captures allowed to wait for a slot (default: 16)
    ///
    /// Zero disables queueing: requests beyond the bound fail immediately.
    pub max_queued_captures: usize,

    /// How long a queued capture may wait before being rejected (default: 10s)
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_captures: num_cpus::get().max(1),
            max_queued_captures: 16,
            queue_timeout: Duration::from_secs(10),
        }
    }
}

/// Timeouts for the three suspension points of a capture, plus the overall deadline
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Engine process start-up (default: 15s)
    #[serde(with = "humantime_serde")]
    pub launch: Duration,

    /// Navigation plus network-idle wait (default: 30s)
    #[serde(with = "humantime_serde")]
    pub navigation: Duration,

    /// Image extraction (default: 20s)
    #[serde(with = "humantime_serde")]
    pub capture: Duration,

    /// Render and capture together (default: 30s)
    #[serde(with = "humantime_serde")]
    pub overall: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            launch: Duration::from_secs(15),
            navigation: Duration::from_secs(30),
            capture: Duration::from_secs(20),
            overall: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureDefaults {
    /// Viewport used when width/height are omitted (default: 1920x1080)
    pub viewport: Viewport,

    /// Output format when none is requested (default: PNG)
    pub format: ImageFormat,

    /// Capture the whole scrollable page (default: true)
    pub full_page: bool,

    /// JPEG quality when the request does not set one (default: 90)
    pub jpeg_quality: u8,
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            format: ImageFormat::Png,
            full_page: true,
            jpeg_quality: 90,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Largest accepted viewport width or height in pixels (default: 4096)
    pub max_dimension: u32,

    /// History page size when `limit` is omitted (default: 10)
    pub default_page_size: usize,

    /// Largest history page served (default: 100)
    pub max_page_size: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_dimension: 4096,
            default_page_size: 10,
            max_page_size: 100,
        }
    }
}

/// Browser viewport in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Network-idle heuristic used to decide a page has finished rendering
///
/// The page counts as settled once no more than `max_inflight` requests have
/// been outstanding for a continuous `quiet_window`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WaitPolicy {
    /// Requests allowed in flight while still counting as idle (default: 2)
    pub max_inflight: usize,

    /// Quiescence window (default: 500ms)
    #[serde(with = "humantime_serde")]
    pub quiet_window: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            max_inflight: 2,
            quiet_window: Duration::from_millis(500),
        }
    }
}

/// Supported output image formats
///
/// - PNG: raster-lossless
/// - JPEG: raster-lossy, honours a quality setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    /// Parse a client-supplied format name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "png" | "raster-lossless" => Some(ImageFormat::Png),
            "jpeg" | "jpg" | "raster-lossy" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }

    pub fn is_lossy(&self) -> bool {
        matches!(self, ImageFormat::Jpeg)
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }
}

/// Chrome/Chromium launch settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChromeSettings {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub executable: Option<String>,

    /// Custom User-Agent string (default: Chrome default)
    pub user_agent: Option<String>,

    /// Extra command-line flags appended after the built-in ones
    pub extra_args: Vec<String>,
}

/// Generate Chrome command-line arguments for one throw-away capture browser
///
/// Headless mode, window size and the per-launch profile directory are set
/// through the browser builder, so they are not part of this list.
///
/// # Examples
///
/// ```rust
/// use capture_service::{get_chrome_args, ChromeSettings};
///
/// let args = get_chrome_args(&ChromeSettings::default());
/// assert!(args.contains(&"--no-sandbox".to_string()));
/// ```
pub fn get_chrome_args(settings: &ChromeSettings) -> Vec<String> {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
    ];

    if let Some(user_agent) = &settings.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args.extend(settings.extra_args.iter().cloned());
    args
}
