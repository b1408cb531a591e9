use crate::{
    build_info, install_prometheus, run_server, AppState, CaptureLedger, CapturePipeline, ChromeEngine, Config,
    ConfigError, JwtIdentityVerifier,
};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "capture-service")]
#[command(about = "Multi-tenant web page capture service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP capture service
    Serve(ServeArgs),

    /// Check a configuration file and print the effective settings
    Validate {
        #[arg(short, long, help = "Configuration file path")]
        config: PathBuf,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    #[arg(long, env = "CAPTURE_CONFIG", help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "CAPTURE_HOST", help = "Address to bind to")]
    pub host: Option<String>,

    #[arg(long, env = "CAPTURE_PORT", help = "Port to listen on")]
    pub port: Option<u16>,

    #[arg(long, help = "Maximum concurrent captures")]
    pub max_concurrent: Option<usize>,

    #[arg(long, env = "CAPTURE_CHROME_PATH", help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Disable the /metrics endpoint")]
    pub no_metrics: bool,
}

/// Load the configuration file (if any), apply command-line overrides and validate.
pub async fn load_config(args: &ServeArgs) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }

    if let Some(port) = args.port {
        config.server.port = port;
    }

    if let Some(max_concurrent) = args.max_concurrent {
        config.governor.max_concurrent_captures = max_concurrent;
    }

    if let Some(chrome_path) = &args.chrome_path {
        config.chrome.executable = Some(chrome_path.clone());
    }

    if args.no_metrics {
        config.metrics_enabled = false;
    }

    config.validate()?;
    Ok(config)
}

pub struct CliRunner;

impl CliRunner {
    pub async fn run(
        command: Commands,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        match command {
            Commands::Serve(args) => Self::serve(args, shutdown).await,
            Commands::Validate { config } => Self::validate_config(&config).await,
        }
    }

    pub async fn serve(args: ServeArgs, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let config = load_config(&args).await.context("failed to load configuration")?;
        let verifier = JwtIdentityVerifier::from_env().context("failed to configure token verification")?;

        info!("Configuration loaded successfully");
        info!("Max concurrent captures: {}", config.governor.max_concurrent_captures);
        info!("Max queued captures: {}", config.governor.max_queued_captures);
        info!("Overall capture timeout: {:?}", config.timeouts.overall);

        let engine = ChromeEngine::new(config.chrome.clone(), config.defaults.viewport, &config.timeouts);
        let server_config = config.server.clone();
        let metrics_enabled = config.metrics_enabled;

        let pipeline = Arc::new(CapturePipeline::new(config, Arc::new(engine), CaptureLedger::in_memory()));
        let mut state = AppState::new(pipeline.clone(), Arc::new(verifier));

        if metrics_enabled {
            match install_prometheus() {
                Ok(handle) => state = state.with_prometheus(handle),
                Err(e) => warn!("Metrics disabled, failed to install recorder: {}", e),
            }
        }

        run_server(state, &server_config, shutdown).await?;

        let tracker = pipeline.tracker();
        info!(
            "Engines launched: {}, released: {}",
            tracker.launched(),
            tracker.released()
        );
        Ok(())
    }

    pub async fn validate_config(path: &Path) -> anyhow::Result<()> {
        println!("Validating configuration: {}", path.display());

        let config = Config::from_file(path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Listen: {}:{}", config.server.host, config.server.port);
        println!("  Max concurrent: {}", config.governor.max_concurrent_captures);
        println!(
            "  Queue: {} (timeout {:?})",
            config.governor.max_queued_captures, config.governor.queue_timeout
        );
        println!(
            "  Timeouts: launch {:?}, navigation {:?}, capture {:?}, overall {:?}",
            config.timeouts.launch, config.timeouts.navigation, config.timeouts.capture, config.timeouts.overall
        );
        println!(
            "  Default viewport: {}x{} ({})",
            config.defaults.viewport.width,
            config.defaults.viewport.height,
            config.defaults.format.as_str()
        );
        println!("  Build: {}", build_info());

        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;

    Ok(())
}
