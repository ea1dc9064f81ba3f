//! Shared error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Top-level server error, used on the startup and background paths.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("backplane error: {0}")]
    Backplane(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no listener enabled: disable_unsecure_listener=true requires enable_ssl=true")]
    NoListener,
}

/// Errors surfaced over HTTP before a connection reaches the WebSocket or
/// SSE state. Rendered as a status code plus a JSON `{"error": ...}` body.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Authentication failed")]
    MissingToken,

    #[error("Authentication failed")]
    InvalidToken,

    #[error("Invalid topic requested")]
    InvalidTopic,

    #[error("Insufficient access to topic")]
    TopicForbidden,

    #[error("Not found")]
    NotFound,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match self {
            HttpError::MissingToken | HttpError::InvalidToken | HttpError::TopicForbidden => {
                StatusCode::UNAUTHORIZED
            }
            HttpError::InvalidTopic | HttpError::NotFound => StatusCode::NOT_FOUND,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_errors_map_to_expected_statuses() {
        assert_eq!(
            HttpError::MissingToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            HttpError::TopicForbidden.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            HttpError::InvalidTopic.into_response().status(),
            StatusCode::NOT_FOUND
        );
    }
}
