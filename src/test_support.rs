//! In-process engine double used by unit and scenario tests.

use crate::{CaptureError, EngineSession, ImageFormat, RenderEngine, Viewport, WaitPolicy};
use async_trait::async_trait;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Launch,
    Render,
    Capture,
}

#[derive(Debug, Clone, Default)]
struct StubBehaviour {
    failure: Option<(FailAt, CaptureError)>,
    delay: Option<(FailAt, Duration)>,
    image: Option<Vec<u8>>,
}

/// Arguments the engine last received for a render step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderCall {
    pub url: Url,
    pub viewport: Viewport,
}

/// Arguments the engine last received for a capture step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureCall {
    pub format: ImageFormat,
    pub full_page: bool,
    pub quality: Option<u8>,
}

#[derive(Debug, Default)]
struct StubCounters {
    launches: AtomicUsize,
    releases: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    last_render: Mutex<Option<RenderCall>>,
    last_capture: Mutex<Option<CaptureCall>>,
}

/// Engine that renders nothing and returns a small encoded image.
#[derive(Debug, Clone, Default)]
pub struct StubEngine {
    behaviour: StubBehaviour,
    counters: Arc<StubCounters>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(mut self, stage: FailAt, error: CaptureError) -> Self {
        self.behaviour.failure = Some((stage, error));
        self
    }

    pub fn with_delay(mut self, stage: FailAt, delay: Duration) -> Self {
        self.behaviour.delay = Some((stage, delay));
        self
    }

    /// Return these bytes from `capture` instead of a real image
    pub fn with_image(mut self, bytes: Vec<u8>) -> Self {
        self.behaviour.image = Some(bytes);
        self
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }

    /// Highest number of sessions alive at the same time
    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub fn last_render(&self) -> Option<RenderCall> {
        self.counters.last_render.lock().unwrap().clone()
    }

    pub fn last_capture(&self) -> Option<CaptureCall> {
        *self.counters.last_capture.lock().unwrap()
    }
}

async fn step(behaviour: &StubBehaviour, stage: FailAt) -> Result<(), CaptureError> {
    if let Some((delayed, delay)) = behaviour.delay {
        if delayed == stage {
            tokio::time::sleep(delay).await;
        }
    }
    match &behaviour.failure {
        Some((failing, error)) if *failing == stage => Err(error.clone()),
        _ => Ok(()),
    }
}

#[async_trait]
impl RenderEngine for StubEngine {
    async fn launch(&self) -> Result<Box<dyn EngineSession>, CaptureError> {
        step(&self.behaviour, FailAt::Launch).await?;

        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(StubSession {
            behaviour: self.behaviour.clone(),
            counters: self.counters.clone(),
            rendered: false,
            released: false,
        }))
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

struct StubSession {
    behaviour: StubBehaviour,
    counters: Arc<StubCounters>,
    rendered: bool,
    released: bool,
}

#[async_trait]
impl EngineSession for StubSession {
    async fn render(&mut self, url: &Url, viewport: Viewport, _wait: &WaitPolicy) -> Result<(), CaptureError> {
        *self.counters.last_render.lock().unwrap() = Some(RenderCall {
            url: url.clone(),
            viewport,
        });
        step(&self.behaviour, FailAt::Render).await?;
        self.rendered = true;
        Ok(())
    }

    async fn capture(
        &mut self,
        format: ImageFormat,
        full_page: bool,
        quality: Option<u8>,
    ) -> Result<Vec<u8>, CaptureError> {
        *self.counters.last_capture.lock().unwrap() = Some(CaptureCall {
            format,
            full_page,
            quality,
        });
        step(&self.behaviour, FailAt::Capture).await?;
        if !self.rendered {
            return Err(CaptureError::CaptureFailed("nothing rendered".to_string()));
        }
        Ok(match &self.behaviour.image {
            Some(bytes) => bytes.clone(),
            None => encode_image(format, quality),
        })
    }

    async fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A tiny solid-colour image in the requested format.
pub fn encode_image(format: ImageFormat, quality: Option<u8>) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(8, 8, image::Rgb([200, 80, 40])));
    let output = match format {
        ImageFormat::Png => image::ImageOutputFormat::Png,
        ImageFormat::Jpeg => image::ImageOutputFormat::Jpeg(quality.unwrap_or(90)),
    };
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, output).expect("encode test image");
    buffer.into_inner()
}
