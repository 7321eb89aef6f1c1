use thiserror::Error;

/// Per-call errors surfaced by the resilient client and its transports.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("call timed out after {0}ms")]
    Timeout(u64),
    #[error("transport unreachable: {0}")]
    NetworkUnavailable(String),
    #[error("downstream server error: HTTP {status}")]
    Http5xx { status: u16 },
    #[error("downstream error: {0}")]
    Remote(String),
    #[error("circuit breaker open for '{service}'")]
    CircuitOpen { service: String },
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("connection pool shut down")]
    PoolShutdown,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl CallError {
    /// Whether the retry loop may attempt this call again.
    ///
    /// `CircuitOpen` and `Remote` are deliberate rejections and retrying
    /// them would only amplify load on an unhealthy or unwilling downstream.
    /// `ConnectionClosed` is not backoff-retried either: the dead connection
    /// is dropped and the next call acquires a fresh one.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::Timeout(_)
                | CallError::NetworkUnavailable(_)
                | CallError::Http5xx { .. }
        )
    }

    /// Stable kind tag used in events and step error records.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::Timeout(_) => "timeout",
            CallError::NetworkUnavailable(_) => "network_unavailable",
            CallError::Http5xx { .. } => "http_5xx",
            CallError::Remote(_) => "remote",
            CallError::CircuitOpen { .. } => "circuit_open",
            CallError::ConnectionClosed(_) => "connection_closed",
            CallError::PoolShutdown => "pool_shutdown",
            CallError::InvalidEndpoint(_) => "invalid_endpoint",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(CallError::Timeout(1000).is_retryable());
        assert!(CallError::NetworkUnavailable("refused".into()).is_retryable());
        assert!(CallError::Http5xx { status: 503 }.is_retryable());
    }

    #[test]
    fn non_retryable_kinds() {
        assert!(!CallError::Remote("bad arg".into()).is_retryable());
        assert!(!CallError::CircuitOpen { service: "a".into() }.is_retryable());
        assert!(!CallError::ConnectionClosed("eof".into()).is_retryable());
        assert!(!CallError::PoolShutdown.is_retryable());
        assert!(!CallError::InvalidEndpoint("x".into()).is_retryable());
    }
}
