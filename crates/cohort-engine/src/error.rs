use crate::labels::BitField;
use std::fmt;

pub type CohortResult<T> = Result<T, CohortError>;

#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),

    #[error("unknown {field} label: {label}")]
    UnknownLabel { field: BitField, label: String },

    #[error("invalid label catalog: {0}")]
    InvalidCatalog(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("query cancelled")]
    Cancelled,

    #[error("record store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CohortError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CohortError::InvalidCriteria(message.into())
    }

    /// Wrap a backend failure, keeping the original error as the source.
    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CohortError::StoreUnavailable {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CohortError::InvalidCriteria(_) => ErrorCategory::InvalidCriteria,
            CohortError::UnknownLabel { .. } => ErrorCategory::UnknownLabel,
            CohortError::InvalidCatalog(_) => ErrorCategory::InvalidCatalog,
            CohortError::Unauthorized => ErrorCategory::Unauthorized,
            CohortError::Cancelled => ErrorCategory::Cancelled,
            CohortError::StoreUnavailable { .. } => ErrorCategory::StoreUnavailable,
        }
    }
}

/// Stable error classes for callers that need to map failures onto a transport.
///
/// The string forms are part of the public contract and never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    InvalidCriteria,
    UnknownLabel,
    InvalidCatalog,
    Unauthorized,
    Cancelled,
    StoreUnavailable,
}

impl ErrorCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::InvalidCriteria => "invalid_criteria",
            ErrorCategory::UnknownLabel => "unknown_label",
            ErrorCategory::InvalidCatalog => "invalid_catalog",
            ErrorCategory::Unauthorized => "unauthorized",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::StoreUnavailable => "store_unavailable",
        }
    }

    /// Whether the caller can fix the failure by changing the request.
    pub const fn is_client_error(self) -> bool {
        matches!(
            self,
            ErrorCategory::InvalidCriteria | ErrorCategory::UnknownLabel | ErrorCategory::Unauthorized
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
