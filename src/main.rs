//! Remo Temperature Logger - records one room temperature reading per run
//!
//! This binary is meant to be started by an external scheduler. Each run
//! fetches the current temperature from the Nature Remo API, validates it,
//! and appends it to the store, then exits.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `NATURE_REMO_TOKEN`: API access token (required)
//! - `NATURE_REMO_API_URL`: API base URL (default: https://api.nature.global)
//! - `OUTPUT_DIR`: Store directory (default: data)
//! - `OUTPUT_FORMAT`: `csv` or `json` (default: csv)
//! - `API_TIMEOUT`: Per-attempt HTTP timeout in seconds (default: 30)
//! - `MAX_RETRIES`: Retries after the first attempt (default: 3)
//! - `LOG_LEVEL`: ERROR, WARNING, INFO or DEBUG (default: INFO)
//! - `STORE_LOCK`: Lock the store while appending (default: true)
//! - `RUST_LOG`: Overrides `LOG_LEVEL` with a full filter directive
//!
//! ## Exit status
//!
//! `0` when the reading was recorded or was already present, `1` otherwise.

use std::process::ExitCode;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use remo_temperature_logger::client::{NatureRemoClient, RetryPolicy, RetryingFetcher};
use remo_temperature_logger::clock::SystemClock;
use remo_temperature_logger::config::Config;
use remo_temperature_logger::pipeline::{Pipeline, RunOutcome};
use remo_temperature_logger::redact::RedactingMakeWriter;
use remo_temperature_logger::store::AppendStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = Config::from_env();

    // The subscriber needs the credential, so it is installed after loading
    match &config {
        Ok(config) => init_tracing(&config.log_level, config.credential.expose()),
        Err(_) => init_tracing("info", ""),
    }

    info!("Starting temperature logger");

    let config = match config {
        Ok(config) => {
            info!(
                devices_url = %config.devices_url,
                store = %config.store_path().display(),
                format = %config.format,
                timeout_secs = config.request_timeout.as_secs(),
                max_retries = config.max_retries,
                "Configuration loaded"
            );
            debug!(token = %config.credential.masked(), "API token loaded");
            config
        }
        Err(e) => {
            error!(kind = "ConfigurationError", error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let client = match NatureRemoClient::new(&config) {
        Ok(client) => client,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "Failed to create HTTP client");
            return ExitCode::FAILURE;
        }
    };

    let fetcher = RetryingFetcher::new(client, RetryPolicy::new(config.max_retries));
    let store = AppendStore::new(config.store_path(), config.format).with_lock(config.store_lock);
    let mut pipeline = Pipeline::new(fetcher, store, SystemClock);

    match pipeline.run().await {
        Ok(RunOutcome::Recorded(_)) | Ok(RunOutcome::AlreadyPresent(_)) => ExitCode::SUCCESS,
        // Already logged by the pipeline
        Err(_) => ExitCode::FAILURE,
    }
}

/// Initialize the tracing subscriber with redaction at the output.
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_tracing(level: &str, secret: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingMakeWriter::new(std::io::stderr, secret))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
