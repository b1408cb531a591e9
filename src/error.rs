use std::time::Duration;
use thiserror::Error;

/// Classified failure of a single capture request.
///
/// Every render engine failure is converted into one of these kinds inside the
/// pipeline, after the engine lease has been released.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Render engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Ledger write failed: {0}")]
    LedgerWriteFailed(String),
}

/// Stable, client-facing classification of a [`CaptureError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    EngineUnavailable,
    NavigationTimeout,
    InvalidTarget,
    CaptureFailed,
    CapacityExceeded,
    LedgerWriteFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::EngineUnavailable => "engine_unavailable",
            ErrorKind::NavigationTimeout => "navigation_timeout",
            ErrorKind::InvalidTarget => "invalid_target",
            ErrorKind::CaptureFailed => "capture_failed",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::LedgerWriteFailed => "ledger_write_failed",
        }
    }

    /// Human-readable message returned to clients in place of internal detail.
    pub fn public_message(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "Invalid capture request",
            ErrorKind::EngineUnavailable => "Render engine unavailable",
            ErrorKind::NavigationTimeout => "Timed out loading the target page",
            ErrorKind::InvalidTarget => "Target URL could not be loaded",
            ErrorKind::CaptureFailed => "Failed to capture the rendered page",
            ErrorKind::CapacityExceeded => "Too many captures in progress, retry later",
            ErrorKind::LedgerWriteFailed => "Failed to record the capture",
        }
    }
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            CaptureError::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            CaptureError::NavigationTimeout(_) => ErrorKind::NavigationTimeout,
            CaptureError::InvalidTarget(_) => ErrorKind::InvalidTarget,
            CaptureError::CaptureFailed(_) => ErrorKind::CaptureFailed,
            CaptureError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            CaptureError::LedgerWriteFailed(_) => ErrorKind::LedgerWriteFailed,
        }
    }

    /// Only admission failures are worth retrying; the caller is expected to back off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaptureError::CapacityExceeded(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CaptureError::InvalidRequest(_) => ErrorSeverity::Low,
            CaptureError::InvalidTarget(_) => ErrorSeverity::Low,
            CaptureError::CapacityExceeded(_) => ErrorSeverity::Low,
            CaptureError::EngineUnavailable(_) => ErrorSeverity::High,
            CaptureError::LedgerWriteFailed(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Failures of the capture ledger's backing store.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("Record {0} already exists")]
    DuplicateRecord(uuid::Uuid),

    #[error("Ledger backend error: {0}")]
    Backend(String),
}

impl From<LedgerError> for CaptureError {
    fn from(err: LedgerError) -> Self {
        CaptureError::LedgerWriteFailed(err.to_string())
    }
}

/// Failures at the identity boundary.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Access token required")]
    MissingCredentials,

    #[error("Malformed Authorization header")]
    MalformedHeader,

    #[error("Invalid or expired token: {0}")]
    InvalidToken(String),
}

/// Startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),
}
