//! HTTP handlers.
//!
//! Every caller-facing failure is an [`ApiError`], rendered as
//! `{"error": message, "code": CODE}`.

mod detect;
mod error;
mod health;

pub use detect::{
    missing_task_id, not_found, status, upload, StatusResponse, UploadResponse, IMAGE_FIELD,
};
pub use error::{ApiError, ApiResult, ErrorBody, ErrorCode};
pub use health::{health, HealthResponse, SERVICE_NAME};
