//! API error handling.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::RecognizeError;

/// API error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub code: String,
}

/// API error type that converts to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn missing_payload() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "MISSING_PAYLOAD",
            message: "Missing \"filePath\" in request body.".to_string(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.message,
            code: self.code.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RecognizeError> for ApiError {
    /// Each failure category gets its own status:
    /// - `InvalidPayload` -> 400
    /// - `ProcessUnavailable`, `ServiceStopped` -> 503
    /// - `Busy` -> 429
    /// - `Timeout` -> 504
    /// - `ProcessLost` -> 502
    fn from(err: RecognizeError) -> Self {
        let status = match &err {
            RecognizeError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            RecognizeError::ProcessUnavailable | RecognizeError::ServiceStopped => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RecognizeError::Busy => StatusCode::TOO_MANY_REQUESTS,
            RecognizeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RecognizeError::ProcessLost(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}
