//! Driftline server entry point.
//!
//! Loads `driftline-config.yaml`, initializes logging, builds the stepping
//! engine around the built-in stub model, and serves the HTTP and
//! `WebSocket` routes until `Ctrl-C`.

use std::path::Path;
use std::sync::Arc;

use driftline_core::Engine;
use driftline_core::config::{ConfigError, DriftlineConfig, LoggingConfig};
use driftline_core::stub::{StubModelProvider, StubOutputterFactory, StubUncertaintySource};
use driftline_server::{AppState, start_server};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Configuration file looked up in the working directory.
const CONFIG_PATH: &str = "driftline-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration cannot be loaded, the session root
/// cannot be created, or the server fails to bind.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config = load_config()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging);
    info!("driftline-server starting");
    if !Path::new(CONFIG_PATH).exists() {
        info!("Config file not found, using defaults");
    }
    info!(
        session_root = %config.storage.session_root.display(),
        start_timeout_ms = config.engine.start_timeout_ms,
        step_timeout_ms = config.engine.step_timeout_ms,
        develop_mode = config.engine.develop_mode,
        "Configuration loaded"
    );

    // 3. Prepare the session root.
    std::fs::create_dir_all(&config.storage.session_root)?;

    // 4. Build the engine.
    let mut engine = Engine::new(
        &config,
        Arc::new(StubModelProvider::new(config.stub_model.clone())),
        Arc::new(StubOutputterFactory),
    );
    if config.stub_model.uncertainty_workers > 0 {
        engine = engine.with_uncertainty(Arc::new(StubUncertaintySource::new(
            config.stub_model.clone(),
        )));
        info!(
            workers = config.stub_model.uncertainty_workers,
            "Uncertainty workers enabled"
        );
    }

    // 5. Serve.
    let state = Arc::new(AppState::new(engine));
    start_server(&config.server, state).await?;

    Ok(())
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Load configuration from `driftline-config.yaml`, falling back to
/// defaults when the file is absent.
fn load_config() -> Result<DriftlineConfig, ConfigError> {
    let config_path = Path::new(CONFIG_PATH);
    if config_path.exists() {
        DriftlineConfig::from_file(config_path)
    } else {
        let mut config = DriftlineConfig::default();
        config.apply_env_overrides();
        Ok(config)
    }
}
