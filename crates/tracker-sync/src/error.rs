use thiserror::Error;
use tracker_adapters::AdapterError;
use tracker_core::QuerySpecError;

/// Failures surfaced by tracker operations and the tool surface.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("{0}")]
    Validation(String),
    #[error("caller identity is missing")]
    Unauthenticated,
    #[error("access denied")]
    Forbidden,
    #[error("tracker not found: {0}")]
    NotFound(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("upstream rate limit: {0}")]
    RateLimited(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TrackingError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::UnknownTool(_) => "unknown_tool",
            Self::RateLimited(_) => "rate_limited",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for the tool transport.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthenticated => 401,
            Self::Forbidden => 403,
            Self::NotFound(_) | Self::UnknownTool(_) => 404,
            Self::RateLimited(_) => 429,
            Self::Internal(_) => 500,
        }
    }
}

impl From<QuerySpecError> for TrackingError {
    fn from(err: QuerySpecError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<AdapterError> for TrackingError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::RateLimited { .. } => Self::RateLimited(err.to_string()),
            AdapterError::QuerySpec(err) => err.into(),
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}
