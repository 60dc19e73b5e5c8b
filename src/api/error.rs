use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

/// Request-path error taxonomy. Components return these structured values;
/// only the HTTP boundary (`IntoResponse` below) turns them into statuses.
///
/// `Clone` because in-flight coalescing shares one outcome, error included,
/// across every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("too many requests")]
    TooManyRequests,

    #[error("upstream timeout after {0} ms")]
    UpstreamTimeout(u64),

    #[error("upstream error: {0}")]
    UpstreamHttp(String),

    #[error("upstream body too large")]
    UpstreamBodyTooLarge,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            ProxyError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamTimeout(_)
            | ProxyError::UpstreamHttp(_)
            | ProxyError::UpstreamBodyTooLarge => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a client. Upstream and internal details stay in
    /// the server log; no stack traces or target URLs leave the boundary.
    fn client_message(&self) -> String {
        match self {
            ProxyError::BadRequest(msg) => msg.clone(),
            ProxyError::Unauthorized => "Unauthorized".into(),
            ProxyError::NotFound => "Not found".into(),
            ProxyError::TooManyRequests => "Too many requests".into(),
            ProxyError::UpstreamTimeout(_) => "Request timeout".into(),
            ProxyError::UpstreamHttp(_) | ProxyError::UpstreamBodyTooLarge => "Bad gateway".into(),
            ProxyError::Internal(_) => "Internal server error".into(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            ProxyError::Internal(detail) => error!(error = %detail, "Internal error"),
            ProxyError::UpstreamTimeout(ms) => warn!(timeout_ms = ms, "Upstream timeout"),
            ProxyError::UpstreamHttp(detail) => warn!(error = %detail, "Upstream error"),
            _ => {}
        }
        (
            self.status(),
            Json(serde_json::json!({ "error": self.client_message() })),
        )
            .into_response()
    }
}
