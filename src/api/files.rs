use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::warn;
use uuid::Uuid;

use super::{AppState, JobView};
use crate::auth::AuthUser;
use crate::db::FileRecord;
use crate::dispatch::{self, UploadSubmission};
use crate::domain::FileStatus;
use crate::error::ApiError;
use crate::storage::StorageError;

const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(3600);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/upload", axum::routing::post(upload))
        .route("/", get(list))
        .route("/:id", get(detail).delete(delete))
        .route("/:id/jobs", get(file_jobs))
        .route("/:id/download", get(download))
}

#[derive(Debug, Serialize)]
struct FileSummary {
    id: Uuid,
    original_name: String,
    size_bytes: i64,
    mime_type: Option<String>,
    status: FileStatus,
    created_at: DateTime<Utc>,
    download_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProcessedOutput {
    id: Uuid,
    original_name: String,
    storage_key: String,
    size_bytes: i64,
    mime_type: Option<String>,
    status: FileStatus,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct FileDetail {
    id: Uuid,
    owner_id: Uuid,
    original_name: String,
    storage_bucket: String,
    storage_key: String,
    size_bytes: i64,
    mime_type: Option<String>,
    status: FileStatus,
    created_at: DateTime<Utc>,
    is_processed_output: bool,
    parent_file_id: Option<Uuid>,
    jobs: Vec<JobView>,
    processed_outputs: Vec<ProcessedOutput>,
    ai_tags: Vec<String>,
}

async fn upload(
    State(state): State<AppState>,
    AuthUser(owner_id): AuthUser,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let spool_dir = tempfile::tempdir().map_err(|err| ApiError::Internal(err.into()))?;
    let spool_path = spool_dir.path().join("upload");

    let mut filename: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut actions_raw: Option<String> = None;
    let mut size_bytes: i64 = 0;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("invalid multipart body: {err}")))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                filename = Some(field.file_name().unwrap_or("file").to_string());
                content_type = field.content_type().map(str::to_string);

                let mut spool = tokio::fs::File::create(&spool_path)
                    .await
                    .map_err(|err| ApiError::Internal(err.into()))?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("truncated upload: {err}")))?
                {
                    size_bytes += chunk.len() as i64;
                    spool
                        .write_all(&chunk)
                        .await
                        .map_err(|err| ApiError::Internal(err.into()))?;
                }
                spool
                    .flush()
                    .await
                    .map_err(|err| ApiError::Internal(err.into()))?;
            }
            Some("pipeline_actions") => {
                actions_raw = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| ApiError::BadRequest(format!("invalid field: {err}")))?,
                );
            }
            _ => {}
        }
    }

    let filename =
        filename.ok_or_else(|| ApiError::BadRequest("missing file field".to_string()))?;
    let actions = match actions_raw.as_deref().map(str::trim) {
        None | Some("") => Vec::new(),
        Some(raw) => dispatch::parse_actions(raw).map_err(ApiError::BadRequest)?,
    };

    let file_id = dispatch::submit_upload(
        &state.db,
        &state.storage,
        &state.broker,
        UploadSubmission {
            owner_id,
            filename: &filename,
            content_type: content_type.as_deref().unwrap_or("application/octet-stream"),
            size_bytes,
            payload: &spool_path,
            actions,
        },
    )
    .await
    .map_err(ApiError::Internal)?;

    Ok(Json(json!({"status": "success", "file_id": file_id})))
}

async fn list(
    State(state): State<AppState>,
    AuthUser(owner_id): AuthUser,
) -> Result<Json<Vec<FileSummary>>, ApiError> {
    let records = state.db.list_files(owner_id).await?;
    let mut summaries = Vec::with_capacity(records.len());
    for record in records {
        summaries.push(summarize(&state, record).await);
    }
    Ok(Json(summaries))
}

/// Presign a download URL for files whose binary is in its final place.
async fn summarize(state: &AppState, record: FileRecord) -> FileSummary {
    let download_url = if matches!(record.status, FileStatus::Uploaded | FileStatus::Ready) {
        match state
            .storage
            .presign_get(&record.storage_bucket, &record.storage_key, DOWNLOAD_URL_TTL)
            .await
        {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(file_id = %record.id, error = %err, "presign failed");
                None
            }
        }
    } else {
        None
    };

    FileSummary {
        id: record.id,
        original_name: record.original_name,
        size_bytes: record.size_bytes,
        mime_type: record.mime_type,
        status: record.status,
        created_at: record.created_at,
        download_url,
    }
}

async fn detail(
    State(state): State<AppState>,
    AuthUser(owner_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<FileDetail>, ApiError> {
    let file = state
        .db
        .file_owned_by(id, owner_id)
        .await?
        .ok_or(ApiError::NotFound("file"))?;

    let jobs = state.db.jobs_for_file(id).await?;
    let outputs = state.db.processed_outputs(id).await?;
    let ai_tags = state
        .db
        .metadata_for_file(id)
        .await?
        .and_then(|meta| meta.ai_tags)
        .and_then(|value| serde_json::from_value::<Vec<String>>(value).ok())
        .unwrap_or_default();

    Ok(Json(FileDetail {
        id: file.id,
        owner_id: file.owner_id,
        original_name: file.original_name,
        storage_bucket: file.storage_bucket,
        storage_key: file.storage_key,
        size_bytes: file.size_bytes,
        mime_type: file.mime_type,
        status: file.status,
        created_at: file.created_at,
        is_processed_output: file.is_processed_output,
        parent_file_id: file.parent_file_id,
        jobs: jobs.into_iter().map(JobView::from).collect(),
        processed_outputs: outputs
            .into_iter()
            .map(|output| ProcessedOutput {
                id: output.id,
                original_name: output.original_name,
                storage_key: output.storage_key,
                size_bytes: output.size_bytes,
                mime_type: output.mime_type,
                status: output.status,
                created_at: output.created_at,
            })
            .collect(),
        ai_tags,
    }))
}

async fn file_jobs(
    State(state): State<AppState>,
    AuthUser(owner_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    state
        .db
        .file_owned_by(id, owner_id)
        .await?
        .ok_or(ApiError::NotFound("file"))?;
    let jobs = state.db.jobs_for_file(id).await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

async fn download(
    State(state): State<AppState>,
    AuthUser(owner_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let file = state
        .db
        .file_owned_by(id, owner_id)
        .await?
        .ok_or(ApiError::NotFound("file"))?;

    let stream = state
        .storage
        .open(&file.storage_bucket, &file.storage_key)
        .await
        .map_err(|err| match err {
            StorageError::NotFound { .. } => ApiError::NotFound("file"),
            other => ApiError::Internal(other.into()),
        })?;

    let body = Body::from_stream(ReaderStream::new(stream.into_async_read()));
    let response = Response::builder()
        .header(
            header::CONTENT_TYPE,
            file.mime_type
                .as_deref()
                .unwrap_or("application/octet-stream"),
        )
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.original_name),
        )
        .body(body)
        .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(response.into_response())
}

async fn delete(
    State(state): State<AppState>,
    AuthUser(owner_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let blobs = state
        .db
        .delete_file_cascade(id, owner_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or(ApiError::NotFound("file"))?;

    // Rows are gone; blob deletion is idempotent best-effort cleanup.
    for blob in &blobs {
        if let Err(err) = state
            .storage
            .delete(&blob.storage_bucket, &blob.storage_key)
            .await
        {
            warn!(
                bucket = %blob.storage_bucket,
                key = %blob.storage_key,
                error = %err,
                "blob cleanup failed"
            );
        }
    }

    Ok(Json(json!({"status": "deleted"})))
}
