use thiserror::Error;

/// Errors surfaced by the control plane.
///
/// Each variant carries a stable kind identifier (see [`LbError::kind`])
/// that the admin facade maps to an HTTP status.
#[derive(Error, Debug)]
pub enum LbError {
    #[error("control plane is not running")]
    NotRunning,

    #[error("no active configuration")]
    NoConfig,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),

    #[error("invalid parameter {field}: {reason}")]
    InvalidParam { field: String, reason: String },

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("cluster is not running on this node")]
    ClusterNotRunning,

    #[error("initial DNS resolution failed for {hostname}: {reason}")]
    DnsStartupFailure { hostname: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LbError {
    pub fn invalid_param(field: impl Into<String>, reason: impl Into<String>) -> Self {
        LbError::InvalidParam { field: field.into(), reason: reason.into() }
    }

    /// Stable identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LbError::NotRunning => "NOT_RUNNING",
            LbError::NoConfig => "NO_CONFIG",
            LbError::NotFound(_) => "NOT_FOUND",
            LbError::MissingParam(_) => "MISSING_PARAM",
            LbError::InvalidParam { .. } => "INVALID_PARAM",
            LbError::OperationFailed(_) => "OPERATION_FAILED",
            LbError::Internal(_) | LbError::Io(_) => "INTERNAL_ERROR",
            LbError::ClusterNotRunning => "CLUSTER_NOT_RUNNING",
            LbError::DnsStartupFailure { .. } => "DNS_STARTUP_FAILURE",
        }
    }

    /// HTTP status the admin facade reports for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            LbError::NotRunning | LbError::ClusterNotRunning => 503,
            LbError::NoConfig | LbError::NotFound(_) => 404,
            LbError::MissingParam(_)
            | LbError::InvalidParam { .. }
            | LbError::OperationFailed(_) => 400,
            LbError::Internal(_) | LbError::Io(_) | LbError::DnsStartupFailure { .. } => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, LbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(LbError::NotRunning.kind(), "NOT_RUNNING");
        assert_eq!(LbError::NotFound("p1".into()).kind(), "NOT_FOUND");
        assert_eq!(LbError::invalid_param("weight", "out of range").kind(), "INVALID_PARAM");
        assert_eq!(LbError::ClusterNotRunning.kind(), "CLUSTER_NOT_RUNNING");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(LbError::NotRunning.http_status(), 503);
        assert_eq!(LbError::NoConfig.http_status(), 404);
        assert_eq!(LbError::MissingParam("port").http_status(), 400);
        assert_eq!(LbError::Internal("boom".into()).http_status(), 500);
    }
}
