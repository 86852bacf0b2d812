//! Fetch, validate and persist one temperature reading.
//!
//! The pipeline is the only place that turns a failure into an ERROR log
//! line; the components below it return errors and log at WARN or lower.

use std::fmt;

use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::client::{FetchError, RawReading, ReadingSource, RetryingFetcher};
use crate::clock::Clock;
use crate::store::{AppendStore, StoreError, TemperatureRecord};
use crate::validator::{format_timestamp, validate_temperature, validate_timestamp, Verdict};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Fetching,
    Validating,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Fetching => "fetching",
            PipelineState::Validating => "validating",
            PipelineState::Persisting => "persisting",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Successful end of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The record was appended
    Recorded(TemperatureRecord),

    /// A record with the same timestamp was already stored
    AlreadyPresent(TemperatureRecord),
}

impl RunOutcome {
    pub fn record(&self) -> &TemperatureRecord {
        match self {
            RunOutcome::Recorded(record) | RunOutcome::AlreadyPresent(record) => record,
        }
    }
}

/// Any failure that ends a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Invalid temperature: {0}")]
    InvalidTemperature(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl PipelineError {
    /// Name of the failure class, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Fetch(e) => e.kind(),
            PipelineError::InvalidTemperature(_) => "InvalidTemperature",
            PipelineError::InvalidTimestamp(_) => "InvalidTimestamp",
            PipelineError::Storage(e) => e.kind(),
        }
    }
}

/// One fetch → validate → persist run.
pub struct Pipeline<S, C> {
    fetcher: RetryingFetcher<S>,
    store: AppendStore,
    clock: C,
    state: PipelineState,
    span: Span,
}

impl<S: ReadingSource, C: Clock> Pipeline<S, C> {
    pub fn new(fetcher: RetryingFetcher<S>, store: AppendStore, clock: C) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            fetcher,
            store,
            clock,
            state: PipelineState::Idle,
            span: info_span!("pipeline", component = "pipeline", run_id = %run_id),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn store(&self) -> &AppendStore {
        &self.store
    }

    /// Run to completion.
    ///
    /// A duplicate timestamp ends the run successfully as
    /// [`RunOutcome::AlreadyPresent`]. Any error is logged once at ERROR
    /// with its kind before being returned.
    pub async fn run(&mut self) -> Result<RunOutcome, PipelineError> {
        let span = self.span.clone();
        let result = self.execute().instrument(span.clone()).await;

        let _entered = span.enter();
        match &result {
            Ok(outcome) => {
                self.transition(PipelineState::Done);
                info!(
                    timestamp = %outcome.record().timestamp,
                    "Temperature logging completed successfully"
                );
            }
            Err(e) => {
                self.transition(PipelineState::Failed);
                error!(
                    kind = e.kind(),
                    at = %format_timestamp(self.clock.now()),
                    error = %e,
                    "Temperature logging failed"
                );
            }
        }
        result
    }

    async fn execute(&mut self) -> Result<RunOutcome, PipelineError> {
        self.transition(PipelineState::Fetching);
        info!("Fetching temperature data");
        let reading = self.fetcher.fetch().await?;
        info!(temperature = reading.value, "Temperature retrieved");

        self.transition(PipelineState::Validating);
        let record = self.validate(reading)?;

        self.transition(PipelineState::Persisting);
        match self.store.append(&record) {
            Ok(()) => Ok(RunOutcome::Recorded(record)),
            Err(StoreError::DuplicateTimestamp(timestamp)) => {
                info!(timestamp = %timestamp, "Record already present, nothing to do");
                Ok(RunOutcome::AlreadyPresent(record))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stamp the reading and build the record to persist.
    fn validate(&self, reading: RawReading) -> Result<TemperatureRecord, PipelineError> {
        let timestamp = match reading.observed_at {
            Some(observed_at) => observed_at,
            None => format_timestamp(self.clock.now()),
        };
        debug!(timestamp = %timestamp, "Stamped reading");

        match validate_temperature(reading.value) {
            Verdict::Invalid(message) => return Err(PipelineError::InvalidTemperature(message)),
            Verdict::Warning(message) => warn!("{}", message),
            Verdict::Valid => {}
        }

        if let Verdict::Invalid(message) = validate_timestamp(&timestamp) {
            return Err(PipelineError::InvalidTimestamp(message));
        }

        debug!("Data validation passed");
        Ok(TemperatureRecord::new(timestamp, reading.value))
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
    }
}
