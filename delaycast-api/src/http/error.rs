// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Convert relay errors to HTTP errors
impl From<delaycast_relay::Error> for AppError {
    fn from(err: delaycast_relay::Error) -> Self {
        use delaycast_relay::Error;

        match err {
            e @ (Error::InvalidDelay { .. } | Error::InvalidParticipant(_)) => Self::bad_request(e.to_string()),
            e @ (Error::Credential(_) | Error::Session(_)) => {
                tracing::warn!(error = %e, "Relay start failed");
                Self::bad_gateway(e.to_string())
            }
            e @ (Error::Platform(_) | Error::Http { .. }) => {
                tracing::warn!(error = %e, "Platform request failed");
                Self::bad_gateway("Platform request failed")
            }
            e @ (Error::Publish(_) | Error::Capture(_)) => {
                tracing::error!(error = %e, "Unexpected media error");
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delaycast_relay::Error;

    #[test]
    fn test_relay_error_status_mapping() {
        let cases = [
            (Error::InvalidDelay { requested: 20_000, max: 10_000 }, StatusCode::BAD_REQUEST),
            (Error::InvalidParticipant("relay-alice".into()), StatusCode::BAD_REQUEST),
            (Error::Credential("bad secret".into()), StatusCode::BAD_GATEWAY),
            (Error::Session("refused".into()), StatusCode::BAD_GATEWAY),
            (Error::Platform("timeout".into()), StatusCode::BAD_GATEWAY),
            (Error::Publish("no encoder".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn test_invalid_delay_message_is_preserved() {
        let err = AppError::from(Error::InvalidDelay { requested: 20_000, max: 10_000 });
        assert!(err.message.contains("20000"));
    }
}
