//! Upload and status endpoints.

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use visage_core::{millis_to_datetime, DetectionResult, DetectionTask, TaskStatus};
use visage_detect::sniff_extension;

use crate::state::AppState;

use super::error::{ApiError, ApiResult, ErrorCode};

/// Multipart field carrying the image.
pub const IMAGE_FIELD: &str = "image";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub task_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<DetectionResult>,
    pub error: Option<String>,
}

impl From<DetectionTask> for StatusResponse {
    fn from(task: DetectionTask) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            created_at: millis_to_datetime(task.created_at),
            updated_at: millis_to_datetime(task.updated_at),
            result: task.result,
            error: task.error,
        }
    }
}

struct ImageUpload {
    content_type: Option<String>,
    file_name: Option<String>,
    bytes: Bytes,
}

impl ImageUpload {
    /// Declared type must be `image/*`; without one the bytes must look like
    /// an image.
    fn validate(&self) -> ApiResult<()> {
        let ok = match self.content_type.as_deref() {
            Some(ct) => ct.starts_with("image/"),
            None => sniff_extension(&self.bytes).is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(ApiError::new(ErrorCode::InvalidFileType))
        }
    }

    fn extension(&self) -> Option<String> {
        self.file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_string())
            .or_else(|| sniff_extension(&self.bytes).map(str::to_string))
    }
}

async fn read_image_field(mut multipart: Multipart) -> ApiResult<Option<ImageUpload>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::with_message(ErrorCode::NoImage, format!("Multipart error: {e}")))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let content_type = field.content_type().map(str::to_string);
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| {
            ApiError::with_message(ErrorCode::NoImage, format!("Failed to read file: {e}"))
        })?;
        return Ok(Some(ImageUpload {
            content_type,
            file_name,
            bytes,
        }));
    }
    Ok(None)
}

/// POST /api/detect/upload: store the image and queue a detection task.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let multipart = multipart.map_err(|e| {
        debug!(error = %e, "upload without multipart body");
        ApiError::new(ErrorCode::NoImage)
    })?;

    let upload = read_image_field(multipart)
        .await?
        .filter(|u| !u.bytes.is_empty())
        .ok_or_else(|| ApiError::new(ErrorCode::NoImage))?;
    upload.validate()?;

    let extension = upload.extension();
    let size = upload.bytes.len();
    let task = state
        .service
        .submit(upload.bytes, extension.as_deref())
        .await
        .map_err(ApiError::internal)?;

    info!(task_id = %task.id, bytes = size, "image accepted");
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            task_id: task.id,
            status: task.status,
        }),
    ))
}

/// GET /api/detect/status/{task_id}
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let task_id = task_id.trim();
    if task_id.is_empty() {
        return Err(ApiError::new(ErrorCode::MissingTaskId));
    }

    let task = state
        .service
        .get_task(task_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::TaskNotFound))?;

    Ok(Json(task.into()))
}

/// GET /api/detect/status/ with no id.
pub async fn missing_task_id() -> ApiError {
    ApiError::new(ErrorCode::MissingTaskId)
}

/// Fallback for unknown routes.
pub async fn not_found() -> ApiError {
    ApiError::new(ErrorCode::NotFound)
}
