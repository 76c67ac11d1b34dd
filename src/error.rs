//! Error kinds surfaced by the detection core.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A reading failed structural validation and never reaches the baseline.
    #[error("malformed input: field `{field}` {reason}")]
    MalformedInput { field: &'static str, reason: String },

    /// The baseline is still warming up; no judgment is possible yet.
    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientData { needed: u64, have: u64 },

    /// The storage collaborator kept failing after bounded retries.
    #[error("storage unavailable during {operation} after {attempts} attempt(s): {reason}")]
    StorageUnavailable {
        operation: &'static str,
        attempts: u32,
        reason: String,
    },

    /// Another batch committed since this one loaded its state.
    #[error("batch superseded: {0}")]
    Superseded(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A blocking worker panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Error::MalformedInput {
            field,
            reason: reason.into(),
        }
    }

    /// Whether a failed storage call may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            Error::Pool(_) | Error::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_data_message() {
        let e = Error::InsufficientData { needed: 14, have: 3 };
        assert_eq!(
            e.to_string(),
            "insufficient baseline data: need 14 samples, have 3"
        );
    }

    #[test]
    fn test_malformed_input_is_not_transient() {
        assert!(!Error::malformed("value", "is not numeric").is_transient());
    }
}
