// Dialect-matched error response formatting.
//
// OpenAI surface:    {"error": {"message", "type", "code"}}
// Anthropic surface: {"type": "error", "error": {"type", "message"}}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::GatewayError;

/// Which client contract the response body must follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

pub fn error_body(dialect: Dialect, error: &GatewayError) -> serde_json::Value {
    match dialect {
        Dialect::OpenAi => json!({
            "error": {
                "message": error.to_string(),
                "type": error.openai_type(),
                "code": null,
            }
        }),
        Dialect::Anthropic => json!({
            "type": "error",
            "error": {
                "type": error.anthropic_type(),
                "message": error.to_string(),
            }
        }),
    }
}

pub fn error_response(dialect: Dialect, error: &GatewayError) -> Response {
    (error.status_code(), Json(error_body(dialect, error))).into_response()
}

/// 401 for a missing or wrong gateway key.
pub fn unauthorized_response(dialect: Dialect) -> Response {
    let body = match dialect {
        Dialect::OpenAi => json!({
            "error": {
                "message": "Invalid or missing API key",
                "type": "authentication_error",
                "code": null,
            }
        }),
        Dialect::Anthropic => json!({
            "type": "error",
            "error": {
                "type": "authentication_error",
                "message": "Invalid or missing API key",
            }
        }),
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_body_shape() {
        let body = error_body(Dialect::OpenAi, &GatewayError::UnknownModel("x".to_string()));
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("x"));
    }

    #[test]
    fn anthropic_body_shape() {
        let body = error_body(Dialect::Anthropic, &GatewayError::NoCapacity);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "overloaded_error");
    }

    use proptest::prelude::*;

    proptest! {
        /// Error bodies never echo anything but the display message, and the
        /// Anthropic envelope always carries both required fields.
        #[test]
        fn prop_anthropic_envelope(message in "[a-zA-Z0-9 ]{1,60}") {
            let body = error_body(
                Dialect::Anthropic,
                &GatewayError::BadRequest(message.clone()),
            );
            prop_assert_eq!(body["type"].as_str().unwrap(), "error");
            prop_assert!(body["error"]["message"].as_str().unwrap().contains(&message));
        }
    }
}
