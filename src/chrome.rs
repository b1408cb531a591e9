//! Chromium render engine driven over the DevTools protocol
//!
//! Every launch starts a dedicated headless Chrome process with its own
//! throw-away profile directory. The session owns the browser, its single
//! page and the task that pumps DevTools messages; `release` tears all three
//! down and removes the profile.

use crate::{
    get_chrome_args, wait_for_quiescence, CaptureError, ChromeSettings, EngineSession, ImageFormat,
    NetworkActivity, RenderEngine, TimeoutConfig, Viewport, WaitPolicy,
};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// How long to wait for Chrome to exit after a close request before killing it
const EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ChromeEngine {
    settings: ChromeSettings,
    window: Viewport,
    request_timeout: Duration,
    profile_root: PathBuf,
}

impl ChromeEngine {
    pub fn new(settings: ChromeSettings, window: Viewport, timeouts: &TimeoutConfig) -> Self {
        Self {
            settings,
            window,
            request_timeout: timeouts.navigation,
            profile_root: std::env::temp_dir(),
        }
    }

    /// Put per-launch profile directories under `root` instead of the system temp dir.
    pub fn with_profile_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.profile_root = root.into();
        self
    }

    fn browser_config(&self, profile: &Path) -> Result<BrowserConfig, CaptureError> {
        let mut builder = BrowserConfig::builder()
            .window_size(self.window.width, self.window.height)
            .user_data_dir(profile)
            .request_timeout(self.request_timeout)
            .args(get_chrome_args(&self.settings));

        if let Some(chrome_path) = &self.settings.executable {
            builder = builder.chrome_executable(chrome_path);
        }

        builder
            .build()
            .map_err(|e| CaptureError::EngineUnavailable(format!("invalid browser configuration: {e}")))
    }
}

#[async_trait]
impl RenderEngine for ChromeEngine {
    async fn launch(&self) -> Result<Box<dyn EngineSession>, CaptureError> {
        let profile = ProfileDir::create(&self.profile_root)?;
        let config = self.browser_config(profile.path())?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CaptureError::EngineUnavailable(format!("failed to launch Chrome: {e}")))?;

        // The handler is a Stream and has to be polled for the browser to make progress
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("DevTools handler error: {}", e);
                }
            }
            debug!("DevTools handler stream ended");
        });

        // From here on the session owns the process, so a cancelled launch still tears it down
        let mut session = ChromeSession {
            browser: Some(browser),
            page: None,
            handler: Some(handler_task),
            profile: Some(profile),
            request_timeout: self.request_timeout,
        };

        let opened = session.browser()?.new_page("about:blank").await;
        match opened {
            Ok(page) => {
                session.page = Some(page);
                Ok(Box::new(session))
            }
            Err(e) => {
                session.release().await;
                Err(CaptureError::EngineUnavailable(format!("failed to open page: {e}")))
            }
        }
    }

    fn name(&self) -> &'static str {
        "chrome"
    }
}

pub struct ChromeSession {
    browser: Option<Browser>,
    page: Option<Page>,
    handler: Option<JoinHandle<()>>,
    profile: Option<ProfileDir>,
    request_timeout: Duration,
}

impl ChromeSession {
    fn browser(&self) -> Result<&Browser, CaptureError> {
        self.browser
            .as_ref()
            .ok_or_else(|| CaptureError::EngineUnavailable("browser already closed".to_string()))
    }

    fn page(&self) -> Result<&Page, CaptureError> {
        self.page
            .as_ref()
            .ok_or_else(|| CaptureError::EngineUnavailable("page already closed".to_string()))
    }
}

/// Map a DevTools failure during navigation onto a capture error kind.
pub fn classify_navigation_error(err: CdpError, request_timeout: Duration) -> CaptureError {
    if matches!(err, CdpError::Timeout) {
        return CaptureError::NavigationTimeout(request_timeout);
    }

    let message = err.to_string();
    if message.contains("net::ERR_") {
        CaptureError::InvalidTarget(message)
    } else {
        CaptureError::EngineUnavailable(message)
    }
}

#[async_trait]
impl EngineSession for ChromeSession {
    async fn render(&mut self, url: &Url, viewport: Viewport, wait: &WaitPolicy) -> Result<(), CaptureError> {
        let timeout = self.request_timeout;
        let page = self.page()?;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(viewport.width))
            .height(i64::from(viewport.height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(CaptureError::EngineUnavailable)?;
        page.execute(metrics).await.map_err(|e| classify_navigation_error(e, timeout))?;

        page.execute(EnableParams::default()).await.map_err(|e| classify_navigation_error(e, timeout))?;

        let started = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|e| classify_navigation_error(e, timeout))?
            .map(|event| NetworkActivity::Started(event.request_id.inner().clone()));
        let finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(|e| classify_navigation_error(e, timeout))?
            .map(|event| NetworkActivity::Finished(event.request_id.inner().clone()));
        let failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(|e| classify_navigation_error(e, timeout))?
            .map(|event| NetworkActivity::Finished(event.request_id.inner().clone()));
        let activity = futures::stream::select_all(vec![started.boxed(), finished.boxed(), failed.boxed()]);

        page.goto(url.as_str()).await.map_err(|e| classify_navigation_error(e, timeout))?;

        wait_for_quiescence(activity, wait).await;
        Ok(())
    }

    async fn capture(
        &mut self,
        format: ImageFormat,
        full_page: bool,
        quality: Option<u8>,
    ) -> Result<Vec<u8>, CaptureError> {
        let page = self.page()?;

        let mut params = ScreenshotParams::builder().full_page(full_page);
        params = match format {
            ImageFormat::Png => params.format(CaptureScreenshotFormat::Png),
            ImageFormat::Jpeg => {
                let params = params.format(CaptureScreenshotFormat::Jpeg);
                match quality {
                    Some(q) => params.quality(i64::from(q)),
                    None => params,
                }
            }
        };

        page.screenshot(params.build())
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))
    }

    async fn release(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("Failed to close page: {}", e);
            }
        }

        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                debug!("Failed to close browser cleanly: {}", e);
            }
            let exited = matches!(tokio::time::timeout(EXIT_GRACE, browser.wait()).await, Ok(Ok(_)));
            if !exited {
                if let Some(Err(e)) = browser.kill().await {
                    warn!("Failed to kill Chrome process: {}", e);
                }
            }
        }

        if let Some(handler) = self.handler.take() {
            handler.abort();
        }

        self.profile.take();
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if self.browser.is_some() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                debug!("Chrome session dropped while running, scheduling teardown");
                let mut orphan = ChromeSession {
                    browser: self.browser.take(),
                    page: self.page.take(),
                    handler: self.handler.take(),
                    profile: self.profile.take(),
                    request_timeout: self.request_timeout,
                };
                runtime.spawn(async move { orphan.release().await });
                return;
            }
        }

        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

/// Per-launch Chrome profile directory, removed when dropped.
#[derive(Debug)]
struct ProfileDir {
    path: PathBuf,
}

impl ProfileDir {
    fn create(root: &Path) -> Result<Self, CaptureError> {
        let path = root.join(format!("capture-service-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).map_err(|e| {
            CaptureError::EngineUnavailable(format!("failed to create profile dir {}: {e}", path.display()))
        })?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProfileDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove profile dir {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_errors_are_classified() {
        let timeout = Duration::from_secs(30);

        let err = classify_navigation_error(CdpError::Timeout, timeout);
        assert!(matches!(err, CaptureError::NavigationTimeout(d) if d == timeout));

        let err = classify_navigation_error(CdpError::ChromeMessage("net::ERR_NAME_NOT_RESOLVED".to_string()), timeout);
        assert!(matches!(err, CaptureError::InvalidTarget(_)));

        let err = classify_navigation_error(CdpError::ChromeMessage("Target closed".to_string()), timeout);
        assert!(matches!(err, CaptureError::EngineUnavailable(_)));
    }

    #[test]
    fn test_profile_dir_is_removed_on_drop() {
        let root = std::env::temp_dir();
        let profile = ProfileDir::create(&root).unwrap();
        let path = profile.path().to_path_buf();
        assert!(path.is_dir());

        drop(profile);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dropped_session_stops_handler_and_removes_profile() {
        let profile = ProfileDir::create(&std::env::temp_dir()).unwrap();
        let path = profile.path().to_path_buf();

        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        let handler = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });

        let session = ChromeSession {
            browser: None,
            page: None,
            handler: Some(handler),
            profile: Some(profile),
            request_timeout: Duration::from_secs(30),
        };
        drop(session);

        // The sender is dropped once the aborted handler task is torn down
        assert!(alive_rx.await.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    #[ignore = "requires a local Chrome/Chromium installation"]
    async fn test_real_chrome_capture() {
        let root = std::env::temp_dir().join(format!("capture-service-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();

        let engine = ChromeEngine::new(ChromeSettings::default(), Viewport::default(), &TimeoutConfig::default())
            .with_profile_root(&root);
        let mut session = engine.launch().await.unwrap();

        let url = Url::parse("data:text/html,<h1>capture</h1>").unwrap();
        session
            .render(&url, Viewport { width: 640, height: 480 }, &WaitPolicy::default())
            .await
            .unwrap();
        let bytes = session.capture(ImageFormat::Png, false, None).await.unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Png);

        session.release().await;
        session.release().await;
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
        std::fs::remove_dir_all(&root).unwrap();
    }
}
