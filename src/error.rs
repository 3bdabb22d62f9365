use thiserror::Error;

/// Rejections raised while building a [`crate::query::Query`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("tag text cannot be empty")]
    EmptyTag,
    #[error("query has no tags")]
    EmptyQuery,
    #[error("invalid sort specifier: {0}")]
    InvalidSort(String),
}

/// Failures talking to an upstream HTTP service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream returned HTTP {0}")]
    Status(u16),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return UpstreamError::Timeout;
        }
        if let Some(status) = err.status() {
            return UpstreamError::Status(status.as_u16());
        }
        UpstreamError::Network(err.to_string())
    }
}

/// A failed probe. No partial count is ever attached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("page size must be greater than zero")]
    InvalidPageSize,
    #[error("max pages must be below {}", u32::MAX)]
    InvalidMaxPages,
    #[error("probe was cancelled")]
    Cancelled,
}

impl ProbeError {
    /// HTTP status of the upstream response that aborted the probe, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProbeError::Upstream(UpstreamError::Status(status)) => Some(*status),
            _ => None,
        }
    }
}
