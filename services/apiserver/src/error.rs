// API error types and helpers.
//
// Centralizes HTTP error construction so every handler and filter produces
// the same error shape.
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn api_bad_request(message: &str) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        body: ErrorResponse {
            code: "bad_request".to_string(),
            message: message.to_string(),
            details: None,
        },
    }
}

pub fn api_internal(message: &str) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorResponse {
            code: "internal".to_string(),
            message: message.to_string(),
            details: None,
        },
    }
}

/// 410 Gone carrying both the offending and the minimum resource version,
/// telling the client to re-list before watching again.
pub fn api_resource_expired(requested: u64, minimum: u64) -> ApiError {
    ApiError {
        status: StatusCode::GONE,
        body: ErrorResponse {
            code: "resource_expired".to_string(),
            message: format!(
                "resource version {requested} is older than the minimum supported resource version {minimum}"
            ),
            details: Some(serde_json::json!({
                "requested_resource_version": requested.to_string(),
                "minimum_resource_version": minimum.to_string(),
            })),
        },
    }
}
