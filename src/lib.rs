//! Remo Temperature Logger Library
//!
//! This library provides the components of a scheduled temperature logger
//! that reads a room sensor through the Nature Remo cloud API and appends
//! the reading to a durable, append-only store:
//!
//! - **config**: Environment-based configuration and credential handling
//! - **client**: HTTP client with failure classification and retry/backoff
//! - **validator**: Temperature and timestamp checks and formatting
//! - **store**: Crash-safe, duplicate-rejecting CSV/JSON record store
//! - **pipeline**: Fetch → validate → persist state machine
//! - **redact**: Credential redaction at the log sink
//!
//! # Example
//!
//! ```no_run
//! use remo_temperature_logger::client::{NatureRemoClient, RetryPolicy, RetryingFetcher};
//! use remo_temperature_logger::clock::SystemClock;
//! use remo_temperature_logger::config::Config;
//! use remo_temperature_logger::pipeline::Pipeline;
//! use remo_temperature_logger::store::AppendStore;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     let client = NatureRemoClient::new(&config).expect("Failed to create client");
//!     let fetcher = RetryingFetcher::new(client, RetryPolicy::new(config.max_retries));
//!     let store = AppendStore::new(config.store_path(), config.format);
//!
//!     let mut pipeline = Pipeline::new(fetcher, store, SystemClock);
//!     pipeline.run().await.ok();
//! }
//! ```

// Module declarations
pub mod client;
pub mod clock;
pub mod config;
pub mod pipeline;
pub mod redact;
pub mod store;
pub mod validator;

// Re-export commonly used types at crate root for convenience
pub use client::{Attempt, FetchError, NatureRemoClient, RawReading, ReadingSource, RetryPolicy, RetryingFetcher};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{Config, ConfigError, Credential};
pub use pipeline::{Pipeline, PipelineError, PipelineState, RunOutcome};
pub use redact::RedactingMakeWriter;
pub use store::{AppendStore, StoreError, StoreFormat, TemperatureRecord};
pub use validator::{format_temperature, format_timestamp, validate_temperature, validate_timestamp, Verdict};
