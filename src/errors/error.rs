use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authz,
    NotFound,
    Timeout,
    Canceled,
    NotImplemented,
    Internal,
}

impl ErrorKind {
    /// Lowercase code used in JSON error payloads and record metadata.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authz => "authz",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Authz => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout => 408,
            ErrorKind::Canceled => 409,
            ErrorKind::NotImplemented => 501,
            ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Export engine errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExportError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authz(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Canceled(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error("{0}")]
    Internal(String),
}

impl ExportError {
    pub fn validation(message: impl Into<String>) -> Self {
        ExportError::Validation(message.into())
    }

    pub fn authz(message: impl Into<String>) -> Self {
        ExportError::Authz(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ExportError::NotFound(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        ExportError::Timeout(message.into())
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        ExportError::NotImplemented(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ExportError::Internal(message.into())
    }

    /// Error returned once a context has been canceled.
    pub fn canceled() -> Self {
        ExportError::Canceled("context canceled".to_string())
    }

    /// Error returned once a context deadline has passed.
    pub fn deadline_exceeded() -> Self {
        ExportError::Timeout("deadline exceeded".to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExportError::Validation(_) => ErrorKind::Validation,
            ExportError::Authz(_) => ErrorKind::Authz,
            ExportError::NotFound(_) => ErrorKind::NotFound,
            ExportError::Timeout(_) => ErrorKind::Timeout,
            ExportError::Canceled(_) => ErrorKind::Canceled,
            ExportError::NotImplemented(_) => ErrorKind::NotImplemented,
            ExportError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ExportError::Validation(m)
            | ExportError::Authz(m)
            | ExportError::NotFound(m)
            | ExportError::Timeout(m)
            | ExportError::Canceled(m)
            | ExportError::NotImplemented(m)
            | ExportError::Internal(m) => m,
        }
    }

    /// Same kind, message prefixed with `context: `.
    pub fn context(self, context: impl fmt::Display) -> Self {
        let message = format!("{}: {}", context, self.message());
        Self::with_kind(self.kind(), message)
    }

    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Validation => ExportError::Validation(message),
            ErrorKind::Authz => ExportError::Authz(message),
            ErrorKind::NotFound => ExportError::NotFound(message),
            ErrorKind::Timeout => ExportError::Timeout(message),
            ErrorKind::Canceled => ExportError::Canceled(message),
            ErrorKind::NotImplemented => ExportError::NotImplemented(message),
            ErrorKind::Internal => ExportError::Internal(message),
        }
    }

    /// Wraps the error so it can travel through `AsyncWrite`/`AsyncRead`.
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }
}

impl Serialize for ExportError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ExportError", 2)?;
        state.serialize_field("message", self.message())?;
        state.serialize_field("code", self.kind().code())?;
        state.end()
    }
}

impl From<io::Error> for ExportError {
    fn from(err: io::Error) -> Self {
        if err
            .get_ref()
            .map(|inner| inner.is::<ExportError>())
            .unwrap_or(false)
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(export_err) = inner.downcast::<ExportError>() {
                    return *export_err;
                }
            }
            return ExportError::internal("i/o error");
        }
        match err.kind() {
            io::ErrorKind::NotFound => ExportError::NotFound(err.to_string()),
            io::ErrorKind::TimedOut => ExportError::Timeout(err.to_string()),
            _ => ExportError::Internal(format!("i/o error: {}", err)),
        }
    }
}

impl From<sqlx::Error> for ExportError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ExportError::NotFound("row not found".to_string()),
            other => ExportError::Internal(format!("database error: {}", other)),
        }
    }
}

impl From<csv::Error> for ExportError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            if let csv::ErrorKind::Io(io_err) = err.into_kind() {
                return io_err.into();
            }
            return ExportError::internal("csv i/o error");
        }
        ExportError::Internal(format!("csv error: {}", err))
    }
}

impl From<zip::result::ZipError> for ExportError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io_err) => io_err.into(),
            other => ExportError::Internal(format!("zip error: {}", other)),
        }
    }
}

impl From<tokio::task::JoinError> for ExportError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            ExportError::canceled()
        } else {
            ExportError::Internal(format!("task failed: {}", err))
        }
    }
}
