use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::get;
use uuid::Uuid;

use super::{AppState, JobView};
use crate::auth::AuthUser;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/:id", get(detail))
}

async fn detail(
    State(state): State<AppState>,
    AuthUser(owner_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = state
        .db
        .job_by_id(id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;

    // Ownership is resolved through the subject file.
    let file = state
        .db
        .file_by_id(job.file_id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;
    if file.owner_id != owner_id {
        return Err(ApiError::Forbidden("not authorized to view this job"));
    }

    Ok(Json(JobView::from(job)))
}

async fn list(
    State(state): State<AppState>,
    AuthUser(owner_id): AuthUser,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let jobs = state.db.jobs_for_owner(owner_id).await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}
