//! Validation of temperature values and timestamps.
//!
//! All functions here are pure. An out-of-range temperature is still valid;
//! the verdict carries a warning for the caller to log.

use chrono::{DateTime, FixedOffset, SecondsFormat};

/// Lower bound of the normal indoor range in °C
pub const MIN_NORMAL_TEMPERATURE: f64 = -50.0;

/// Upper bound of the normal indoor range in °C
pub const MAX_NORMAL_TEMPERATURE: f64 = 50.0;

/// Outcome of a validation check.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Accepted without remarks
    Valid,

    /// Accepted, but the message should be logged as a warning
    Warning(String),

    /// Rejected
    Invalid(String),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Verdict::Invalid(_))
    }

    /// Warning or error text; empty for [`Verdict::Valid`].
    pub fn message(&self) -> &str {
        match self {
            Verdict::Valid => "",
            Verdict::Warning(message) | Verdict::Invalid(message) => message,
        }
    }
}

/// Check a temperature reading.
///
/// NaN and infinities are the only non-numeric inputs an `f64` can carry and
/// are rejected. Finite values outside [-50, 50] are accepted with a warning.
pub fn validate_temperature(value: f64) -> Verdict {
    if value.is_nan() {
        return Verdict::Invalid("Temperature cannot be NaN".to_string());
    }
    if value.is_infinite() {
        return Verdict::Invalid("Temperature cannot be infinity".to_string());
    }

    if !(MIN_NORMAL_TEMPERATURE..=MAX_NORMAL_TEMPERATURE).contains(&value) {
        return Verdict::Warning(format!(
            "Temperature {}°C is out of normal range ({}°C to {}°C)",
            value,
            MIN_NORMAL_TEMPERATURE,
            MAX_NORMAL_TEMPERATURE
        ));
    }

    Verdict::Valid
}

/// Check that a timestamp is RFC 3339 / ISO 8601 with an explicit offset or `Z`.
pub fn validate_timestamp(value: &str) -> Verdict {
    match parse_timestamp(value) {
        Ok(_) => Verdict::Valid,
        Err(e) => Verdict::Invalid(format!("Invalid timestamp format '{}': {}", value, e)),
    }
}

/// Parse a timestamp that carries an explicit offset.
pub fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value.trim())
}

/// Format a temperature with exactly one decimal digit.
///
/// Rounding is half-to-even on the exact binary value, as done by `{:.1}`.
/// A negative zero result is written as `0.0`.
pub fn format_temperature(value: f64) -> String {
    let formatted = format!("{:.1}", value);
    if formatted == "-0.0" {
        "0.0".to_string()
    } else {
        formatted
    }
}

/// Round a temperature to the value [`format_temperature`] would print.
pub fn round_temperature(value: f64) -> f64 {
    format_temperature(value).parse().unwrap_or(value)
}

/// Format an instant as RFC 3339 with second precision and a numeric offset.
pub fn format_timestamp(instant: DateTime<FixedOffset>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, false)
}
