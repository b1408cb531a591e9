//! Render engine abstraction and scoped engine ownership
//!
//! A [`RenderEngine`] launches one fresh [`EngineSession`] per capture. The
//! pipeline never holds a session directly: it holds an [`EngineLease`], which
//! applies the per-step timeouts and makes sure the session is released exactly
//! once, including when the owning task is cancelled or panics.

use crate::{format_duration, metrics, CaptureError, ImageFormat, Viewport, WaitPolicy};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// Upper bound on a single teardown before the session is abandoned
const RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Factory for engine sessions. One launch per capture; sessions are never reused.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn EngineSession>, CaptureError>;

    fn name(&self) -> &'static str;
}

/// One live engine process with a single page.
#[async_trait]
pub trait EngineSession: Send {
    /// Apply the viewport, navigate to `url` and wait until `wait` holds.
    async fn render(&mut self, url: &Url, viewport: Viewport, wait: &WaitPolicy) -> Result<(), CaptureError>;

    /// Extract the rendered page as encoded image bytes.
    async fn capture(
        &mut self,
        format: ImageFormat,
        full_page: bool,
        quality: Option<u8>,
    ) -> Result<Vec<u8>, CaptureError>;

    /// Terminate the engine and remove everything it left on disk.
    ///
    /// Must be idempotent and safe to call after any partial failure.
    async fn release(&mut self);
}

/// Launch/release accounting shared by every lease.
#[derive(Debug, Clone, Default)]
pub struct EngineTracker {
    inner: Arc<TrackerCounts>,
}

#[derive(Debug, Default)]
struct TrackerCounts {
    launched: AtomicU64,
    released: AtomicU64,
}

impl EngineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched(&self) -> u64 {
        self.inner.launched.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Engines launched but not yet released
    pub fn live(&self) -> u64 {
        self.launched().saturating_sub(self.released())
    }

    fn record_launch(&self) {
        self.inner.launched.fetch_add(1, Ordering::SeqCst);
        metrics::record_engine_launch();
    }

    fn record_release(&self) {
        self.inner.released.fetch_add(1, Ordering::SeqCst);
        metrics::record_engine_release();
    }
}

/// Exclusive ownership of one engine session for the duration of a capture.
pub struct EngineLease {
    session: Option<Box<dyn EngineSession>>,
    tracker: EngineTracker,
}

impl EngineLease {
    /// Launch a fresh session, failing with `EngineUnavailable` if it does not
    /// come up within `timeout`.
    pub async fn acquire(
        engine: &dyn RenderEngine,
        tracker: &EngineTracker,
        timeout: Duration,
    ) -> Result<Self, CaptureError> {
        let session = match tokio::time::timeout(timeout, engine.launch()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CaptureError::EngineUnavailable(format!(
                    "{} engine did not start within {}",
                    engine.name(),
                    format_duration(timeout)
                )))
            }
        };

        tracker.record_launch();
        debug!("Launched {} engine ({} live)", engine.name(), tracker.live());

        Ok(Self {
            session: Some(session),
            tracker: tracker.clone(),
        })
    }

    pub async fn render(
        &mut self,
        url: &Url,
        viewport: Viewport,
        wait: &WaitPolicy,
        timeout: Duration,
    ) -> Result<(), CaptureError> {
        let session = self.session_mut()?;
        match tokio::time::timeout(timeout, session.render(url, viewport, wait)).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::NavigationTimeout(timeout)),
        }
    }

    pub async fn capture(
        &mut self,
        format: ImageFormat,
        full_page: bool,
        quality: Option<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, CaptureError> {
        let session = self.session_mut()?;
        match tokio::time::timeout(timeout, session.capture(format, full_page, quality)).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::CaptureFailed(format!(
                "image extraction did not finish within {}",
                format_duration(timeout)
            ))),
        }
    }

    /// Tear the session down now. Consumes the lease so it cannot be used again.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            release_session(session, self.tracker.clone()).await;
        }
    }

    fn session_mut(&mut self) -> Result<&mut Box<dyn EngineSession>, CaptureError> {
        self.session
            .as_mut()
            .ok_or_else(|| CaptureError::EngineUnavailable("engine session already released".to_string()))
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let tracker = self.tracker.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    debug!("Engine lease dropped without release, scheduling teardown");
                    handle.spawn(release_session(session, tracker));
                }
                Err(_) => {
                    warn!("Engine lease dropped outside a runtime, engine process may leak");
                }
            }
        }
    }
}

async fn release_session(mut session: Box<dyn EngineSession>, tracker: EngineTracker) {
    if tokio::time::timeout(RELEASE_TIMEOUT, session.release()).await.is_err() {
        warn!(
            "Engine teardown exceeded {}, abandoning session",
            format_duration(RELEASE_TIMEOUT)
        );
    }
    drop(session);
    tracker.record_release();
}

/// Network request lifecycle event observed while a page loads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkActivity {
    Started(String),
    Finished(String),
}

/// Wait until at most `policy.max_inflight` requests have been outstanding for
/// a continuous `policy.quiet_window`.
///
/// The window starts when the in-flight count drops to the limit and restarts
/// only after the count goes above it; traffic that stays within the limit
/// does not delay settling. Returns early when the event stream ends. Callers
/// bound the wait with their own timeout.
pub async fn wait_for_quiescence<S>(events: S, policy: &WaitPolicy)
where
    S: Stream<Item = NetworkActivity> + Unpin,
{
    let mut events = events;
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut quiet_since = Some(Instant::now());

    loop {
        let event = match quiet_since {
            Some(since) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(since + policy.quiet_window) => return,
                    event = events.next() => event,
                }
            }
            None => events.next().await,
        };

        match event {
            Some(NetworkActivity::Started(id)) => {
                in_flight.insert(id);
            }
            Some(NetworkActivity::Finished(id)) => {
                in_flight.remove(&id);
            }
            None => return,
        }

        if in_flight.len() > policy.max_inflight {
            quiet_since = None;
        } else if quiet_since.is_none() {
            quiet_since = Some(Instant::now());
        }
    }
}
