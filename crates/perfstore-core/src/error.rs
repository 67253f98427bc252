//! Error types for perfstore-core

use std::fmt::Write;
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<(String, String)>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a labelled command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push((label.into(), command.into()));
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for (label, command) in &self.commands {
                let _ = writeln!(output, "    - {label}: {command}");
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for perfstore-core
#[derive(Error, Debug)]
pub enum Error {
    /// A forwarded device call failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Request rejected before reaching storage or a device
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Transport(err) => Some(err.remediation()),
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::InvalidRequest(_) => None,
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => None,
        }
    }
}

/// Failures of a forwarded call to a device agent.
///
/// A device that is simply not connected is never reported through this type;
/// services answer with a default response instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("device agent unavailable: {0}")]
    Unavailable(String),

    #[error("device call failed with status {code}: {message}")]
    Status { code: i32, message: String },

    #[error("device call timed out after {0} ms")]
    Timeout(u64),

    #[error("device call cancelled")]
    Cancelled,
}

impl TransportError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Unavailable(_) | Self::Cancelled => {
                Remediation::new("The device agent went away. Reconnect the device and retry.")
            }
            Self::Status { .. } => Remediation::new(
                "The device agent rejected the call. Check the agent logs on the device.",
            ),
            Self::Timeout(_) => Remediation::new("The device agent did not answer in time.")
                .alternative("Retry when the device is less loaded."),
        }
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Table {0} used before storage was attached")]
    NotInitialized(&'static str),

    #[error("Row payload codec error: {0}")]
    Codec(String),

    #[error("Database corruption detected: {details}")]
    Corruption { details: String },
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check data directory permissions and retry.",
            )
            .command("Re-create schema", "perfstore init")
            .alternative("Ensure the data directory is writable."),
            Self::NotInitialized(_) => Remediation::new(
                "Storage was not attached before use. Build the store through DataStore::new.",
            ),
            Self::Codec(_) => Remediation::new(
                "A stored row could not be decoded. It was probably written by another version.",
            ),
            Self::Corruption { .. } => Remediation::new(
                "Database corruption detected. Automatic recovery is not possible.",
            )
            .alternative("Delete the database files and restart with fresh data."),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, message)
                if code.code == rusqlite::ErrorCode::DatabaseCorrupt
                    || code.code == rusqlite::ErrorCode::NotADatabase =>
            {
                Self::Corruption {
                    details: message.unwrap_or_else(|| code.to_string()),
                }
            }
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            )),
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Remove the file to fall back to built-in defaults."),
            Self::ValidationError(_) => {
                Remediation::new("Adjust the offending value; intervals and capacities must be > 0.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rusqlite_errors_map_to_database() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StorageError::Database(_)));
    }

    #[test]
    fn json_errors_map_to_codec() {
        let parse = serde_json::from_str::<i64>("not json").unwrap_err();
        let err: StorageError = parse.into();
        assert!(matches!(err, StorageError::Codec(_)));
    }

    #[test]
    fn transport_error_wraps_into_crate_error() {
        let err: Error = TransportError::Timeout(250).into();
        assert_eq!(
            err.to_string(),
            "Transport error: device call timed out after 250 ms"
        );
        assert!(err.remediation().is_some());
    }

    #[test]
    fn remediation_renders_commands_and_alternatives() {
        let text = StorageError::Database("disk I/O error".into())
            .remediation()
            .render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("perfstore init"));
        assert!(text.contains("Alternatives:"));
    }
}
