use thiserror::Error;

/// The error taxonomy shared across the daemon. Every subsystem
/// ultimately reports faults as one of these kinds so the HTTP layer and the
/// backwards-invocation dispatcher can both translate a single value.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("quota exceeded: used {used} bytes, quota {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    /// HTTP status code this kind maps to
    pub fn status_code(&self) -> u16 {
        match self {
            DaemonError::NotFound(_) => 404,
            DaemonError::BadRequest(_) => 400,
            DaemonError::PermissionDenied(_) => 403,
            DaemonError::QuotaExceeded { .. } => 413,
            DaemonError::UpstreamUnavailable(_) => 502,
            DaemonError::Timeout(_) => 502,
            DaemonError::Internal(_) => 500,
        }
    }

    /// Log level this kind should be reported at.
    pub fn log_level(&self) -> tracing::Level {
        match self {
            DaemonError::NotFound(_) | DaemonError::BadRequest(_) => tracing::Level::INFO,
            DaemonError::Internal(_) => tracing::Level::ERROR,
            _ => tracing::Level::WARN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec() {
        assert_eq!(DaemonError::NotFound("x".into()).status_code(), 404);
        assert_eq!(DaemonError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(DaemonError::PermissionDenied("x".into()).status_code(), 403);
        assert_eq!(
            DaemonError::QuotaExceeded { used: 1, quota: 0 }.status_code(),
            413
        );
        assert_eq!(
            DaemonError::UpstreamUnavailable("x".into()).status_code(),
            502
        );
        assert_eq!(DaemonError::Internal("x".into()).status_code(), 500);
    }
}
