//! Error types for llmpool.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for llmpool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for llmpool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No available endpoint for model '{model}', please retry later")]
    NoEndpoints { model: String },

    #[error("Upstream server connection failed: {0}")]
    Gateway(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NoEndpoints { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Gateway(_) => StatusCode::BAD_GATEWAY,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_type(&self) -> (&'static str, Option<&'static str>) {
        match self {
            Error::NoEndpoints { .. } => ("service_unavailable", Some("no_available_api")),
            Error::Gateway(_) => ("bad_gateway", Some("network_error")),
            Error::BadRequest(_) => ("invalid_request_error", None),
            Error::NotFound(_) => ("not_found", None),
            Error::Internal(_) => ("api_error", Some("internal_error")),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_type, code) = self.error_type();

        // Internal details stay in the log, the client gets a generic message
        let message = match &self {
            Error::Internal(_) => {
                tracing::error!(error = %self, "Internal failure");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let mut error = serde_json::json!({
            "message": message,
            "type": error_type,
        });
        if let Some(code) = code {
            error["code"] = serde_json::Value::from(code);
        }

        (status, axum::Json(serde_json::json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(error: Error) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_no_endpoints_is_503() {
        let (status, json) = body_json(Error::NoEndpoints {
            model: "gpt-4o".to_string(),
        })
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["type"], "service_unavailable");
        assert_eq!(json["error"]["code"], "no_available_api");
        assert!(json["error"]["message"].as_str().unwrap().contains("gpt-4o"));
    }

    #[tokio::test]
    async fn test_gateway_is_502() {
        let (status, json) = body_json(Error::Gateway("connection refused".to_string())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"]["type"], "bad_gateway");
        assert_eq!(json["error"]["code"], "network_error");
    }

    #[tokio::test]
    async fn test_not_found_has_no_code() {
        let (status, json) = body_json(Error::NotFound("endpoint 'x'".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].get("code").is_none());
    }

    #[tokio::test]
    async fn test_internal_detail_is_not_sent() {
        let (status, json) =
            body_json(Error::Internal("Empty response from alpha (status 200)".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"]["message"], "Internal server error");
        assert_eq!(json["error"]["code"], "internal_error");
    }
}
