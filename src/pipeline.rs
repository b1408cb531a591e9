//! Capture orchestration
//!
//! One call to [`CapturePipeline::capture`] validates the request, waits for
//! admission, launches a dedicated engine, renders and captures under the
//! configured timeouts, releases the engine, and records the result. Engines
//! are never reused between captures.

use crate::{
    format_bytes, format_duration, log_target, metrics, CaptureError, CaptureLedger, CaptureParams,
    CaptureRecord, CaptureRequest, ConcurrencyGovernor, Config, EngineLease, EngineTracker, ErrorSeverity,
    Identity, ImageFormat, RenderEngine,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of a successful capture
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub record: CaptureRecord,
    pub image: Vec<u8>,
    /// The owner's capture count including this capture
    pub capture_count: u64,
}

/// Per-request capture coordinator shared by all HTTP handlers
///
/// # Examples
///
/// ```rust,no_run
/// use capture_service::{CaptureLedger, CaptureParams, CapturePipeline, ChromeEngine, Config, Identity};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let engine = ChromeEngine::new(config.chrome.clone(), config.defaults.viewport, &config.timeouts);
///     let pipeline = CapturePipeline::new(config, Arc::new(engine), CaptureLedger::in_memory());
///
///     let outcome = pipeline
///         .capture(&CaptureParams::for_url("https://example.com"), &Identity::new("user-1"))
///         .await?;
///     println!("Captured {} bytes", outcome.image.len());
///     Ok(())
/// }
/// ```
pub struct CapturePipeline {
    config: Config,
    engine: Arc<dyn RenderEngine>,
    governor: ConcurrencyGovernor,
    ledger: CaptureLedger,
    tracker: EngineTracker,
}

impl CapturePipeline {
    pub fn new(config: Config, engine: Arc<dyn RenderEngine>, ledger: CaptureLedger) -> Self {
        let governor = ConcurrencyGovernor::new(&config.governor);
        Self {
            config,
            engine,
            governor,
            ledger,
            tracker: EngineTracker::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &CaptureLedger {
        &self.ledger
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    pub fn tracker(&self) -> &EngineTracker {
        &self.tracker
    }

    pub async fn capture(&self, params: &CaptureParams, identity: &Identity) -> Result<CaptureOutcome, CaptureError> {
        let start = Instant::now();
        let result = self.run(params, identity).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(outcome) => {
                metrics::record_capture("success", elapsed);
                info!(
                    "Captured {} for {} ({}, {}) in {}",
                    outcome.record.url,
                    identity.id,
                    outcome.record.format.as_str(),
                    format_bytes(outcome.record.size),
                    format_duration(elapsed)
                );
            }
            Err(e) => {
                metrics::record_capture(e.kind().as_str(), elapsed);
                match e.severity() {
                    ErrorSeverity::Low => debug!("Capture for {} rejected: {}", identity.id, e),
                    ErrorSeverity::Medium => warn!("Capture for {} failed: {}", identity.id, e),
                    ErrorSeverity::High | ErrorSeverity::Critical => {
                        error!("Capture for {} failed: {}", identity.id, e)
                    }
                }
            }
        }

        result
    }

    async fn run(&self, params: &CaptureParams, identity: &Identity) -> Result<CaptureOutcome, CaptureError> {
        let request = CaptureRequest::from_params(params, &self.config.defaults, &self.config.limits)?;

        let _admission = self.governor.admit().await?;
        debug!("Admitted capture of {} for {}", log_target(&request.url), identity.id);

        let mut lease =
            EngineLease::acquire(self.engine.as_ref(), &self.tracker, self.config.timeouts.launch).await?;

        let overall = self.config.timeouts.overall;
        let driven = tokio::time::timeout(overall, self.drive(&mut lease, &request)).await;
        lease.release().await;

        let image = match driven {
            Ok(result) => result?,
            Err(_) => return Err(CaptureError::NavigationTimeout(overall)),
        };

        verify_image(&image, request.format)?;

        let record = CaptureRecord::new(&identity.id, &request, image.len());
        let capture_count = self.ledger.append(record.clone()).await?;

        Ok(CaptureOutcome {
            record,
            image,
            capture_count,
        })
    }

    async fn drive(&self, lease: &mut EngineLease, request: &CaptureRequest) -> Result<Vec<u8>, CaptureError> {
        let timeouts = &self.config.timeouts;

        lease
            .render(&request.url, request.viewport, &self.config.wait_policy, timeouts.navigation)
            .await?;
        debug!("Rendered {}", log_target(&request.url));

        lease
            .capture(request.format, request.full_page, request.quality, timeouts.capture)
            .await
    }
}

/// Check that the engine produced an image in the requested encoding.
fn verify_image(bytes: &[u8], expected: ImageFormat) -> Result<(), CaptureError> {
    let wanted = match expected {
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
    };

    match image::guess_format(bytes) {
        Ok(found) if found == wanted => Ok(()),
        Ok(found) => Err(CaptureError::CaptureFailed(format!(
            "engine returned {found:?} data, expected {}",
            expected.as_str()
        ))),
        Err(_) => Err(CaptureError::CaptureFailed(format!(
            "engine returned {} of unrecognised image data",
            format_bytes(bytes.len())
        ))),
    }
}
