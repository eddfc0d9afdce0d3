//! Error types for sheetstream

use thiserror::Error;

/// Result type alias for sheetstream operations
pub type Result<T> = std::result::Result<T, ExportError>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for export and job operations
#[derive(Error, Debug)]
pub enum ExportError {
    /// Cooperative cancellation was observed
    #[error("Export cancelled")]
    Cancelled,

    /// Backend access failure while opening or reading a data source
    #[error("DataSource{} error: {message}", fmt_tag(.source_name))]
    DataSource {
        source_name: Option<String>,
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    /// Failure while consuming an already opened stream
    #[error("Stream processing failed after {processed} items: {message}")]
    StreamProcessing { processed: u64, message: String },

    /// Schema or column mapping is misconfigured
    #[error("Schema error{}: {message}", fmt_tag(.entity_type))]
    Schema {
        entity_type: Option<String>,
        message: String,
    },

    /// Invalid configuration value
    #[error("Configuration error{}: {message}", fmt_tag(.property))]
    Configuration {
        property: Option<String>,
        message: String,
    },

    /// Untrusted input rejected before reaching a backend
    #[error("Validation failed{}: {message}{}", fmt_field(.field), fmt_value(.value))]
    Validation {
        field: Option<String>,
        message: String,
        value: Option<String>,
    },

    /// A value could not be serialized into a cell
    #[error("Cell error at row {row}, column {column}: {message}")]
    CellValue {
        row: u32,
        column: usize,
        message: String,
    },

    /// Best-effort release of a resource failed
    #[error("Failed to cleanup resource [{resource}]: {message}")]
    ResourceCleanup { resource: String, message: String },

    /// File storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error occurred while writing the workbook container
    #[error("Failed to write Excel file: {0}")]
    Write(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_tag(tag: &Option<String>) -> String {
    tag.as_ref().map(|t| format!(" [{t}]")).unwrap_or_default()
}

fn fmt_field(field: &Option<String>) -> String {
    field
        .as_ref()
        .map(|f| format!(" for field [{f}]"))
        .unwrap_or_default()
}

fn fmt_value(value: &Option<String>) -> String {
    value
        .as_ref()
        .map(|v| format!(" (value: {v})"))
        .unwrap_or_default()
}

impl ExportError {
    /// Data source failure without an underlying cause
    pub fn data_source(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        ExportError::DataSource {
            source_name: Some(source_name.into()),
            message: message.into(),
            cause: None,
        }
    }

    /// Data source failure wrapping the backend error
    pub fn data_source_caused_by<E>(
        source_name: impl Into<String>,
        message: impl Into<String>,
        cause: E,
    ) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ExportError::DataSource {
            source_name: Some(source_name.into()),
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        ExportError::Schema {
            entity_type: None,
            message: message.into(),
        }
    }

    pub fn configuration(property: impl Into<String>, message: impl Into<String>) -> Self {
        ExportError::Configuration {
            property: Some(property.into()),
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ExportError::Validation {
            field: Some(field.into()),
            message: message.into(),
            value: None,
        }
    }

    /// Validation failure that also reports the rejected value
    pub fn invalid_value(
        field: impl Into<String>,
        message: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        ExportError::Validation {
            field: Some(field.into()),
            message: message.into(),
            value: Some(value.into()),
        }
    }

    /// Whether retrying the operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExportError::DataSource { .. }
                | ExportError::StreamProcessing { .. }
                | ExportError::Storage(_)
        )
    }

    /// Whether this is the cooperative cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExportError::Cancelled)
    }
}

impl From<zip::result::ZipError> for ExportError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => ExportError::Io(io),
            other => ExportError::Write(other.to_string()),
        }
    }
}

impl From<regex::Error> for ExportError {
    fn from(err: regex::Error) -> Self {
        ExportError::validation("filter.value", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_include_context() {
        let err = ExportError::data_source("memory:users", "cursor closed");
        assert_eq!(err.to_string(), "DataSource [memory:users] error: cursor closed");

        let err = ExportError::invalid_value("filter.key", "bad key", "a$b");
        assert_eq!(
            err.to_string(),
            "Validation failed for field [filter.key]: bad key (value: a$b)"
        );

        let err = ExportError::Schema {
            entity_type: None,
            message: "row has 3 values".to_string(),
        };
        assert_eq!(err.to_string(), "Schema error: row has 3 values");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ExportError::data_source("db", "timeout").is_retryable());
        assert!(ExportError::Storage("503".to_string()).is_retryable());
        assert!(!ExportError::Cancelled.is_retryable());
        assert!(!ExportError::schema("mismatch").is_retryable());
        assert!(ExportError::Cancelled.is_cancelled());
    }
}
