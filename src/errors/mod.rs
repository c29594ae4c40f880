mod error;

pub use error::{ErrorKind, ExportError};

/// Result type for export engine operations
pub type ExportResult<T> = Result<T, ExportError>;
