use axum::http::StatusCode;

/// Closed error taxonomy for the gateway core. Mirrors the error kinds in
/// the component design: each variant maps to an HTTP status and, where the
/// call came in over JSON-RPC, a JSON-RPC error code.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Protocol(_) => StatusCode::BAD_REQUEST,
            GatewayError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// JSON-RPC 2.0 error code, per the `-32xxx` reserved ranges plus the
    /// gateway's own mapping for non-protocol errors.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            GatewayError::Validation(_) => -32602,
            GatewayError::NotFound(_) => -32601,
            GatewayError::Protocol(_) => -32600,
            GatewayError::Auth(_) => -32001,
            GatewayError::UpstreamUnavailable(_) => -32002,
            GatewayError::UpstreamProtocol(_) => -32003,
            GatewayError::Internal(_) => -32603,
            GatewayError::Cancelled => -32004,
        }
    }

    /// Whether a caller may retry this error without changing anything
    /// (only transport-level upstream failures are retryable per the
    /// recovery rules; validation/auth never are).
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::UpstreamUnavailable(_))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
