//! # Capture Service
//!
//! A multi-tenant web page capture service. Authenticated callers submit a URL
//! with viewport, format and full-page options and receive a rendered PNG or
//! JPEG. Every successful capture is recorded in a per-identity history with
//! a capture counter.
//!
//! ## Architecture
//!
//! | Component | Module | Responsibility |
//! |-----------|--------|----------------|
//! | **Render engine** | [`engine`], [`chrome`] | Launch, render, capture and tear down one headless Chrome per capture |
//! | **Capture pipeline** | [`pipeline`] | Validate, admit, drive the engine under timeouts, always release, record |
//! | **Concurrency governor** | [`governor`] | Bound concurrent captures, bounded FIFO wait queue |
//! | **Capture ledger** | [`ledger`] | Append-only history with atomic per-identity counters |
//! | **Identity boundary** | [`identity`] | Bearer token verification (HS256 JWT by default) |
//! | **HTTP surface** | [`server`] | Axum routes, status mapping, health and metrics |
//!
//! ## Capture Lifecycle
//!
//! 1. The request is validated; invalid input never reaches an engine.
//! 2. The governor admits it, queues it, or rejects it with `CapacityExceeded`.
//! 3. A fresh engine is launched under the launch timeout.
//! 4. Render (network-idle wait) and capture run under their own timeouts and
//!    an overall deadline.
//! 5. The engine is released on every path, including cancellation.
//! 6. The image is checked against the requested format and the record is
//!    appended to the ledger together with the counter increment.
//!
//! ## Error Mapping
//!
//! | Kind | HTTP status |
//! |------|-------------|
//! | `invalid_request`, `invalid_target` | 400 |
//! | `capacity_exceeded` | 429 (with `Retry-After`) |
//! | `engine_unavailable`, `navigation_timeout`, `capture_failed`, `ledger_write_failed` | 500 |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_service::{CaptureLedger, CaptureParams, CapturePipeline, ChromeEngine, Config, Identity};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let engine = ChromeEngine::new(config.chrome.clone(), config.defaults.viewport, &config.timeouts);
//!     let pipeline = CapturePipeline::new(config, Arc::new(engine), CaptureLedger::in_memory());
//!
//!     let mut params = CaptureParams::for_url("https://example.com");
//!     params.format = Some("jpeg".to_string());
//!     let outcome = pipeline.capture(&params, &Identity::new("user-1")).await?;
//!     println!("Capture {} has {} bytes", outcome.record.id, outcome.image.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! export CAPTURE_JWT_SECRET="a-long-random-secret-of-32-chars-or-more"
//! capture-service serve --config capture.json --port 3020
//! capture-service validate --config capture.json
//! ```

/// Configuration and settings for the capture service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Capture request parsing and validation
pub mod request;

/// Render engine traits, engine leases and the network-idle wait
pub mod engine;

/// Headless Chrome render engine
pub mod chrome;

/// Admission control for concurrent captures
pub mod governor;

/// Capture history and per-identity counters
pub mod ledger;

/// Bearer token verification
pub mod identity;

/// Capture orchestration
pub mod pipeline;

/// HTTP routes and error mapping
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Metrics emitted through the `metrics` facade
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod tests;

pub use crate::metrics::install_prometheus;
pub use chrome::*;
pub use cli::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use governor::*;
pub use identity::*;
pub use ledger::*;
pub use pipeline::*;
pub use request::*;
pub use server::*;
pub use utils::*;

/// Package name and version, e.g. `capture-service v0.1.0`
pub fn build_info() -> String {
    format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
