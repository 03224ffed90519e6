/// Connector errors, classified so the workflow can decide between retry,
/// degrade and fail.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Network blip or rate limit; the activity retry policy handles it.
    #[error("transient error: {0:#}")]
    Transient(#[source] anyhow::Error),

    /// Capability not implemented for this peer kind; the workflow treats
    /// the step as a no-op.
    #[error("{0} is not supported by this peer")]
    Unsupported(&'static str),

    /// Type or shape mismatch; accumulated in flow state, does not advance
    /// the checkpoint.
    #[error("data schema error: {0}")]
    DataSchema(String),

    /// Invalid configuration or missing credentials; fails the workflow.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::Transient(_) | ConnectorError::Other(_))
    }
}

/// Postgres driver errors: connection-level failures retry, everything
/// else surfaces as-is.
impl From<tokio_postgres::Error> for ConnectorError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            ConnectorError::Transient(err.into())
        } else {
            ConnectorError::Other(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_names_the_capability() {
        let err = ConnectorError::Unsupported("normalize_records");
        assert_eq!(
            err.to_string(),
            "normalize_records is not supported by this peer"
        );
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(ConnectorError::Transient(anyhow::anyhow!("rate limited")).is_retryable());
        assert!(!ConnectorError::Fatal("bad credentials".into()).is_retryable());
        assert!(!ConnectorError::Cancelled.is_retryable());
    }
}
