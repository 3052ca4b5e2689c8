use std::io;
use std::path::Path;
use thiserror::Error;

/// Error type shared by the data layer
#[derive(Debug, Error)]
pub enum OcsightError {
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A JSON document could not be parsed
    #[error("JSON parse error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    /// The data root does not exist
    #[error("Data directory not found: {path}")]
    DataDirNotFound { path: String },
    /// The data root exists but is a file
    #[error("Data directory is not a directory: {path}")]
    NotADirectory { path: String },
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
    /// Invalid user input
    #[error("Validation error in field '{field}': {message}")]
    Validation { field: String, message: String },
    /// Pricing catalog could not be fetched or decoded
    #[error("Pricing catalog error: {message}")]
    Pricing { message: String },
    /// Persisted cache could not be read or written
    #[error("Cache error: {message}")]
    Cache { message: String },
    #[error("Error: {message}")]
    Other { message: String },
}

impl From<serde_yaml::Error> for OcsightError {
    fn from(err: serde_yaml::Error) -> Self {
        OcsightError::Config {
            message: err.to_string(),
        }
    }
}

impl From<csv::Error> for OcsightError {
    fn from(err: csv::Error) -> Self {
        OcsightError::Other {
            message: format!("CSV error: {}", err),
        }
    }
}

impl From<reqwest::Error> for OcsightError {
    fn from(err: reqwest::Error) -> Self {
        OcsightError::Pricing {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OcsightError>;

impl OcsightError {
    pub fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn data_dir_not_found(path: &Path) -> Self {
        Self::DataDirNotFound {
            path: path.display().to_string(),
        }
    }

    pub fn not_a_directory(path: &Path) -> Self {
        Self::NotADirectory {
            path: path.display().to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn pricing(message: impl Into<String>) -> Self {
        Self::Pricing {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Whether the command must stop instead of degrading to empty output
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OcsightError::DataDirNotFound { .. } | OcsightError::NotADirectory { .. }
        )
    }

    pub fn detailed_message(&self) -> String {
        match self {
            OcsightError::Json { path, source } => format!(
                "Failed to parse JSON in file '{}'\nError: {}\nThis usually indicates a partially written or corrupted record.",
                path, source
            ),
            OcsightError::DataDirNotFound { path } => format!(
                "OpenCode data directory not found at '{}'\nUse --path or set OCSIGHT_DATA_DIR if OpenCode stores its data elsewhere.",
                path
            ),
            OcsightError::NotADirectory { path } => format!(
                "'{}' exists but is not a directory\nPoint --path at the OpenCode data root (the directory containing storage/).",
                path
            ),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OcsightError::validation("refresh", "must be between 1 and 60");
        assert!(err.to_string().contains("refresh"));
        assert!(err.to_string().contains("between 1 and 60"));
    }

    #[test]
    fn test_fatal_classification() {
        let missing = OcsightError::data_dir_not_found(Path::new("/nope"));
        assert!(missing.is_fatal());
        assert!(missing.detailed_message().contains("--path"));
        assert!(!OcsightError::pricing("offline").is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let err: OcsightError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, OcsightError::Io(_)));
    }
}
