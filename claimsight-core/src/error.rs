//! Error types for the Claimsight pipeline.
//!
//! Uses `thiserror` for the public error enum. Variants separate caller
//! mistakes (`Validation`), failures of the external services the pipeline
//! calls (`Upstream`, `Timeout`), and model output that could not be decoded
//! (`Parse`).

/// Top-level error type for pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("Invalid input: {message}")]
    Validation { message: String },

    #[error("Upstream failure in {operation} (scope {scope}): {message}")]
    Upstream {
        operation: String,
        scope: String,
        message: String,
    },

    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("Model output parse error: {message}")]
    Parse { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Convenience type alias for pipeline results.
pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn upstream(
        operation: impl Into<String>,
        scope: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Upstream {
            operation: operation.into(),
            scope: scope.into(),
            message: msg.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Re-label a service failure with the calling operation and scope id.
    ///
    /// Caller errors (`Validation`) and decode errors (`Parse`) pass through
    /// unchanged. An `Upstream` error keeps its inner operation as a message
    /// prefix; everything else becomes `Upstream` carrying its message.
    pub fn in_scope(self, operation: &str, scope: &str) -> Self {
        match self {
            Self::Validation { .. } | Self::Parse { .. } | Self::Config(_) => self,
            Self::Upstream {
                operation: inner,
                message,
                ..
            } => Self::Upstream {
                operation: operation.to_string(),
                scope: scope.to_string(),
                message: if inner == operation {
                    message
                } else {
                    format!("{inner}: {message}")
                },
            },
            other => Self::Upstream {
                operation: operation.to_string(),
                scope: scope.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Whether this failure came from an external service rather than the caller.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. } | Self::Timeout { .. } | Self::Sqlite(_) | Self::Io(_)
        )
    }
}

impl From<figment::Error> for RagError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        let operation = if err.is_timeout() {
            "http_timeout"
        } else if err.is_connect() {
            "http_connect"
        } else {
            "http_request"
        };
        let scope = err
            .url()
            .map(|u| u.host_str().unwrap_or_default().to_string())
            .unwrap_or_default();
        Self::upstream(operation, scope, err.to_string())
    }
}
