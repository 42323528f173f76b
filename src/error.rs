//! # Error Handling
//!
//! HTTP-facing error type for the gateway and its mapping to responses.
//!
//! ## Layers:
//! - **Core modules** (segmenter, session, registry, speech backends) use
//!   small `thiserror` enums that describe exactly what failed
//! - **Bootstrap and configuration** use `anyhow` for context-rich errors
//! - **HTTP handlers** return `AppError`, which actix turns into a response
//!   through the `ResponseError` trait
//!
//! ## Upgrade rejections:
//! A rejected WebSocket upgrade never reaches the WebSocket protocol, so it
//! has no close frame. `MalformedUpgrade` and `Unauthorized` answer with a
//! bare status line and force the underlying TCP connection closed.

use crate::registry::UpgradeError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Error categories for HTTP handlers.
///
/// ## Error Categories:
/// - **MalformedUpgrade**: upgrade path lacks channel/transaction ids (400, no body)
/// - **Unauthorized**: upgrade failed authentication (401, no body)
/// - **BadRequest / ValidationError**: client sent invalid data (400)
/// - **Internal / ConfigError**: server-side problems (500)
#[derive(Debug)]
pub enum AppError {
    MalformedUpgrade(String),
    Unauthorized(String),
    Internal(String),
    BadRequest(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::MalformedUpgrade(msg) => write!(f, "Malformed upgrade request: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts gateway errors into HTTP responses.
///
/// ## JSON Response Format:
/// Everything except upgrade rejections returns:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Window duration must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedUpgrade(_)
            | AppError::BadRequest(_)
            | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::MalformedUpgrade(_) | AppError::Unauthorized(_) => {
                return HttpResponse::build(self.status_code())
                    .force_close()
                    .finish();
            }
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always caused by the client, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<UpgradeError> for AppError {
    fn from(err: UpgradeError) -> Self {
        AppError::MalformedUpgrade(err.to_string())
    }
}

/// A failed WebSocket handshake (missing upgrade headers, bad version).
impl From<actix_web::Error> for AppError {
    fn from(err: actix_web::Error) -> Self {
        AppError::BadRequest(format!("WebSocket handshake failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    #[test]
    fn test_upgrade_rejections_have_no_body() {
        let malformed = AppError::MalformedUpgrade("/one".to_string()).error_response();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert!(!malformed.head().keep_alive());
        assert_eq!(malformed.into_body().size(), actix_web::body::BodySize::Sized(0));

        let unauthorized = AppError::Unauthorized("nope".to_string()).error_response();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_validation_error_maps_to_400() {
        let response = AppError::ValidationError("bad".to_string()).error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AppError::ConfigError("broken".to_string()).error_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_conversions_pick_status() {
        let internal: AppError = anyhow::anyhow!("backend exploded").into();
        assert_eq!(internal.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let malformed: AppError = UpgradeError::MalformedPath {
            path: "/one".to_string(),
        }
        .into();
        assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);
        assert!(malformed.to_string().contains("/one"));
    }
}
