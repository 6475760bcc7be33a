//! Error taxonomy for roster synchronisation.
//!
//! Remote failures arrive from a [`crate::contract::ClassroomApi`] implementor as an
//! [`ApiError`]; [`SyncError::from_api`] folds them into the taxonomy used for logging
//! and reporting. Local failures (files, CSV rows, credentials) are raised directly.

use std::path::PathBuf;
use thiserror::Error;

/// Raw failure of a single remote call, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The remote answered with a non-success HTTP status.
    #[error("remote returned {code}: {message}")]
    Status { code: u16, message: String },

    /// The request never produced a response (DNS, TLS, connection reset, bad body).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The call did not complete within the configured per-call timeout.
    #[error("remote call timed out")]
    Timeout,
}

impl ApiError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        ApiError::Status {
            code,
            message: message.into(),
        }
    }

    /// HTTP status code, if the remote answered at all.
    pub fn code(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Rate limiting and server-side faults are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), Some(429) | Some(500..=599))
    }
}

/// Top-level error type for every classroom-sync core operation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{subject}: already exists remotely")]
    RemoteConflict { subject: String },

    #[error("{subject}: not found remotely")]
    RemoteNotFound { subject: String },

    #[error("{subject}: permission denied ({message})")]
    RemotePermissionDenied { subject: String, message: String },

    #[error("{subject}: rate limited ({message})")]
    RemoteRateLimited { subject: String, message: String },

    #[error("{subject}: remote internal error {code} ({message})")]
    RemoteInternal {
        subject: String,
        code: u16,
        message: String,
    },

    #[error("{subject}: request rejected with {code} ({message})")]
    RemoteRejected {
        subject: String,
        code: u16,
        message: String,
    },

    #[error("{subject}: remote call timed out")]
    RemoteTimeout { subject: String },

    #[error("{subject}: transport failure ({message})")]
    RemoteTransport { subject: String, message: String },

    #[error("{}:{line}: {message}", path.display())]
    LocalParse {
        path: PathBuf,
        line: u64,
        message: String,
    },

    #[error("user {user_id} is not in the user directory")]
    UnknownUser { user_id: String },

    #[error("authentication error: {0}")]
    LocalAuth(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SyncError {
    /// Map a raw remote failure onto the taxonomy, tagging it with the identifier
    /// (course id, user id, class code) the call was made for.
    pub fn from_api(subject: impl Into<String>, err: ApiError) -> Self {
        let subject = subject.into();
        match err {
            ApiError::Status { code: 409, .. } => SyncError::RemoteConflict { subject },
            ApiError::Status { code: 404, .. } => SyncError::RemoteNotFound { subject },
            ApiError::Status { code: 403, message } | ApiError::Status { code: 401, message } => {
                SyncError::RemotePermissionDenied { subject, message }
            }
            ApiError::Status { code: 429, message } => {
                SyncError::RemoteRateLimited { subject, message }
            }
            ApiError::Status { code, message } if code >= 500 => SyncError::RemoteInternal {
                subject,
                code,
                message,
            },
            ApiError::Status { code, message } => SyncError::RemoteRejected {
                subject,
                code,
                message,
            },
            ApiError::Timeout => SyncError::RemoteTimeout { subject },
            ApiError::Transport(message) => SyncError::RemoteTransport { subject, message },
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-friendly tag used in report rows and log fields.
    pub fn tag(&self) -> &'static str {
        match self {
            SyncError::RemoteConflict { .. } => "RemoteConflict",
            SyncError::RemoteNotFound { .. } => "RemoteNotFound",
            SyncError::RemotePermissionDenied { .. } => "RemotePermissionDenied",
            SyncError::RemoteRateLimited { .. } => "RemoteRateLimited",
            SyncError::RemoteInternal { .. } => "RemoteInternal",
            SyncError::RemoteRejected { .. } => "RemoteRejected",
            SyncError::RemoteTimeout { .. } => "RemoteTimeout",
            SyncError::RemoteTransport { .. } => "RemoteTransport",
            SyncError::LocalParse { .. } => "LocalParseError",
            SyncError::UnknownUser { .. } => "UnknownUser",
            SyncError::LocalAuth(_) => "LocalAuthError",
            SyncError::Config(_) => "ConfigError",
            SyncError::Io { .. } => "IoError",
            SyncError::Csv(_) => "CsvError",
        }
    }
}

/// A convenience Result alias that defaults to [`SyncError`].
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_not_found_map_to_benign_variants() {
        let err = SyncError::from_api("course 987", ApiError::status(409, "ALREADY_EXISTS"));
        assert!(matches!(err, SyncError::RemoteConflict { .. }));

        let err = SyncError::from_api("course 987", ApiError::status(404, "NOT_FOUND"));
        assert!(matches!(err, SyncError::RemoteNotFound { .. }));
        assert_eq!(err.to_string(), "course 987: not found remotely");
    }

    #[test]
    fn server_faults_and_rate_limits_are_retryable() {
        assert!(ApiError::status(429, "slow down").is_retryable());
        assert!(ApiError::status(503, "unavailable").is_retryable());
        assert!(!ApiError::status(403, "denied").is_retryable());
        assert!(!ApiError::Timeout.is_retryable());
    }

    #[test]
    fn remaining_statuses_keep_their_code() {
        let err = SyncError::from_api("user u1", ApiError::status(400, "bad request"));
        match err {
            SyncError::RemoteRejected { code, .. } => assert_eq!(code, 400),
            other => panic!("unexpected variant {other:?}"),
        }
        let err = SyncError::from_api("user u1", ApiError::status(502, "bad gateway"));
        assert_eq!(err.tag(), "RemoteInternal");
    }

    #[test]
    fn parse_error_names_file_and_line() {
        let err = SyncError::LocalParse {
            path: PathBuf::from("classes.csv"),
            line: 7,
            message: "expected 4 columns, found 3".into(),
        };
        assert_eq!(err.to_string(), "classes.csv:7: expected 4 columns, found 3");
    }
}
