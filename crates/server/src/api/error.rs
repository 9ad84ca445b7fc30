use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

/// Stable machine-readable error codes returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoImage,
    InvalidFileType,
    MissingTaskId,
    TaskNotFound,
    MissingApiKey,
    InvalidApiKey,
    RateLimitExceeded,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoImage => "NO_IMAGE",
            ErrorCode::InvalidFileType => "INVALID_FILE_TYPE",
            ErrorCode::MissingTaskId => "MISSING_TASK_ID",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::MissingApiKey => "MISSING_API_KEY",
            ErrorCode::InvalidApiKey => "INVALID_API_KEY",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::NoImage | ErrorCode::InvalidFileType | ErrorCode::MissingTaskId => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::TaskNotFound | ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::MissingApiKey => StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidApiKey => StatusCode::FORBIDDEN,
            ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::NoImage => "No image file provided",
            ErrorCode::InvalidFileType => "Invalid file type",
            ErrorCode::MissingTaskId => "Missing taskId",
            ErrorCode::TaskNotFound => "Task not found",
            ErrorCode::MissingApiKey => "Missing API key",
            ErrorCode::InvalidApiKey => "Invalid API key",
            ErrorCode::RateLimitExceeded => "Too many requests, please try again later",
            ErrorCode::NotFound => "Not found",
            ErrorCode::InternalError => "Internal server error",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub retry_after: Option<u64>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            retry_after: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self {
            code: ErrorCode::RateLimitExceeded,
            message: message.into(),
            retry_after: Some(retry_after_secs),
        }
    }

    /// Log the cause and return a generic 500.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        error!(error = %cause, "request failed");
        Self::new(ErrorCode::InternalError)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code.as_str(),
            retry_after: self.retry_after,
        };
        (self.code.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_statuses() {
        assert_eq!(ErrorCode::MissingApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::InvalidApiKey.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::RateLimitExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::TaskNotFound.as_str(), "TASK_NOT_FOUND");
    }

    #[test]
    fn internal_errors_hide_detail() {
        let err = ApiError::internal("disk on fire at /var/lib/secret");
        assert_eq!(err.code, ErrorCode::InternalError);
        assert_eq!(err.message, "Internal server error");
    }

    #[test]
    fn body_omits_retry_after_unless_rate_limited() {
        let body = ErrorBody {
            error: "Not found".into(),
            code: "NOT_FOUND",
            retry_after: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("retryAfter").is_none());

        let body = ErrorBody {
            retry_after: Some(3),
            ..body
        };
        assert_eq!(serde_json::to_value(&body).unwrap()["retryAfter"], 3);
    }
}
