//! REST surface: submission plus the read/download/delete endpoints.

pub mod files;
pub mod jobs;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::Settings;
use crate::db::{Db, JobRecord};
use crate::domain::{ActionKind, JobStatus};
use crate::storage::ObjectStore;

/// Multipart uploads may carry large binaries; axum's 2 MiB default is far
/// too small for video.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub storage: ObjectStore,
    pub broker: Arc<Broker>,
    pub settings: Arc<Settings>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/files", files::router())
        .nest("/jobs", jobs::router())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Connect every collaborator, apply migrations, declare topology, serve.
pub async fn serve(settings: Settings) -> Result<()> {
    let db = Db::connect(&settings.database_url).await?;
    db.migrate().await?;

    let storage = ObjectStore::new(&settings);
    storage
        .ensure_buckets()
        .await
        .context("ensuring object store buckets")?;

    let broker = Broker::connect(&settings.amqp_uri()).await?;

    let bind_addr = settings.bind_addr.clone();
    let state = AppState {
        db,
        storage,
        broker: Arc::new(broker),
        settings: Arc::new(settings),
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "api listening");
    axum::serve(listener, router(state))
        .await
        .context("serving api")?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

/// Job as rendered in REST responses.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub file_id: Uuid,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result_file_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub params: Value,
}

impl From<JobRecord> for JobView {
    fn from(job: JobRecord) -> Self {
        JobView {
            id: job.id,
            file_id: job.file_id,
            kind: job.kind,
            status: job.status,
            created_at: job.created_at,
            updated_at: job.updated_at,
            result_file_id: job.result_file_id,
            error_message: job.error_message,
            params: job.params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_view_uses_wire_casing() {
        let view = JobView {
            id: Uuid::nil(),
            file_id: Uuid::nil(),
            kind: ActionKind::VirusScan,
            status: JobStatus::Completed,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            result_file_id: None,
            error_message: Some("clean".to_string()),
            params: json!({}),
        };
        let value = serde_json::to_value(&view).expect("serialize");
        assert_eq!(value["type"], json!("virus_scan"));
        assert_eq!(value["status"], json!("COMPLETED"));
        assert_eq!(value["error_message"], json!("clean"));
    }
}
