//! Configuration module for the temperature logger.
//!
//! This module provides environment-based configuration, including the API
//! credential, the API base URL, the output location and retry settings.
//! Configuration is read once at process entry and handed to each component.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreFormat;

/// Environment variable holding the Nature Remo access token
pub const TOKEN_VAR: &str = "NATURE_REMO_TOKEN";

/// Default API URL for the Nature Remo cloud API
const DEFAULT_API_URL: &str = "https://api.nature.global";

/// Default output directory for the store file
const DEFAULT_OUTPUT_DIR: &str = "data";

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of retries after the first attempt
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Bounds for the request timeout
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 300;

/// Upper bound on retries so a misconfiguration cannot stall a scheduled run
const MAX_ALLOWED_RETRIES: u32 = 10;

/// Placeholder printed in place of secrets
pub const REDACTED: &str = "[REDACTED]";

/// API access token.
///
/// Neither `Debug` nor `Display` reveals the value; use [`Credential::expose`]
/// at the single place the token is put on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a token, rejecting empty or whitespace-only values.
    pub fn new(token: impl Into<String>) -> Result<Self, ConfigError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(ConfigError::Missing {
                var: TOKEN_VAR.to_string(),
            });
        }
        Ok(Self(token))
    }

    /// The raw token value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The token masked for display, see [`mask_token`].
    pub fn masked(&self) -> String {
        mask_token(&self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&REDACTED).finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Mask a token for display, keeping only the first and last four characters.
///
/// Tokens of eight characters or fewer are fully masked.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}

/// Configuration for the temperature logger.
///
/// All settings can be configured via environment variables:
/// - `NATURE_REMO_TOKEN`: API access token (required)
/// - `NATURE_REMO_API_URL`: API base URL (default: https://api.nature.global)
/// - `OUTPUT_DIR`: Directory holding the store file (default: data)
/// - `OUTPUT_FORMAT`: `csv` or `json` (default: csv)
/// - `API_TIMEOUT`: Per-attempt request timeout in seconds (default: 30)
/// - `MAX_RETRIES`: Retries after the first attempt (default: 3)
/// - `LOG_LEVEL`: ERROR, WARNING, INFO or DEBUG (default: INFO)
/// - `STORE_LOCK`: Hold an advisory lock while appending (default: true)
#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token for the API
    pub credential: Credential,

    /// Base URL for the Nature Remo API
    pub api_url: String,

    /// Full URL for the devices endpoint
    pub devices_url: String,

    /// Directory that holds the store file
    pub output_dir: PathBuf,

    /// On-disk format of the store
    pub format: StoreFormat,

    /// HTTP request timeout per attempt
    pub request_timeout: Duration,

    /// Maximum number of retry attempts after the first request
    pub max_retries: u32,

    /// Log level filter directive
    pub log_level: String,

    /// Whether appends take an advisory lock on the store
    pub store_lock: bool,
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {var} environment variable not set")]
    Missing { var: String },

    #[error("Configuration error for {var}: {message}")]
    Invalid { var: String, message: String },
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the token is missing or a numeric, format or
    /// level setting cannot be parsed or is out of bounds.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup(TOKEN_VAR).unwrap_or_default();
        let credential = Credential::new(token)?;

        let api_url = lookup("NATURE_REMO_API_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_url = api_url.trim().trim_end_matches('/').to_string();
        let devices_url = devices_url(&api_url);

        let output_dir = PathBuf::from(
            lookup("OUTPUT_DIR")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string()),
        );

        let format = match lookup("OUTPUT_FORMAT") {
            Some(value) => value.parse().map_err(|message| ConfigError::Invalid {
                var: "OUTPUT_FORMAT".to_string(),
                message,
            })?,
            None => StoreFormat::Csv,
        };

        let timeout_secs = parse_bounded(
            &lookup,
            "API_TIMEOUT",
            DEFAULT_TIMEOUT_SECS,
            MIN_TIMEOUT_SECS,
            MAX_TIMEOUT_SECS,
        )?;

        let max_retries = parse_bounded(
            &lookup,
            "MAX_RETRIES",
            u64::from(DEFAULT_MAX_RETRIES),
            0,
            u64::from(MAX_ALLOWED_RETRIES),
        )? as u32;

        let log_level = match lookup("LOG_LEVEL") {
            Some(value) => parse_log_level(&value)?,
            None => "info".to_string(),
        };

        let store_lock = match lookup("STORE_LOCK") {
            Some(value) => parse_bool("STORE_LOCK", &value)?,
            None => true,
        };

        Ok(Self {
            credential,
            api_url,
            devices_url,
            output_dir,
            format,
            request_timeout: Duration::from_secs(timeout_secs),
            max_retries,
            log_level,
            store_lock,
        })
    }

    /// Create a configuration with default values for the given credential.
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential,
            api_url: DEFAULT_API_URL.to_string(),
            devices_url: devices_url(DEFAULT_API_URL),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            format: StoreFormat::Csv,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            log_level: "info".to_string(),
            store_lock: true,
        }
    }

    /// Path of the store file inside the output directory.
    pub fn store_path(&self) -> PathBuf {
        self.output_dir.join(self.format.file_name())
    }
}

fn devices_url(api_url: &str) -> String {
    format!("{}/1/devices", api_url)
}

/// Parse an integer setting with validation against inclusive bounds.
fn parse_bounded<F>(lookup: &F, var: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = match lookup(var) {
        Some(value) => value,
        None => return Ok(default),
    };

    let parsed: u64 = value.trim().parse().map_err(|_| ConfigError::Invalid {
        var: var.to_string(),
        message: format!("'{}' is not a valid number", value),
    })?;

    if parsed < min {
        return Err(ConfigError::Invalid {
            var: var.to_string(),
            message: format!("{} is below minimum ({})", parsed, min),
        });
    }

    if parsed > max {
        return Err(ConfigError::Invalid {
            var: var.to_string(),
            message: format!("{} exceeds maximum ({})", parsed, max),
        });
    }

    Ok(parsed)
}

/// Map a level name to an `EnvFilter` directive.
fn parse_log_level(value: &str) -> Result<String, ConfigError> {
    let level = match value.trim().to_ascii_uppercase().as_str() {
        "ERROR" => "error",
        "WARNING" | "WARN" => "warn",
        "INFO" => "info",
        "DEBUG" => "debug",
        "TRACE" => "trace",
        _ => {
            return Err(ConfigError::Invalid {
                var: "LOG_LEVEL".to_string(),
                message: format!("'{}' is not a known level", value),
            })
        }
    };
    Ok(level.to_string())
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var: var.to_string(),
            message: format!("'{}' is not a boolean", value),
        }),
    }
}
