//! State Store Adapter: typed CRUD over files, jobs, pipelines and metadata.
//!
//! Single-job mutations need no row locking: broker QoS guarantees one
//! unacknowledged delivery per envelope, so the executing worker is the sole
//! mutator of its job row. Multi-row mutations (submission, completion with
//! a derived artifact, delete cascade) run inside one transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use crate::domain::{ActionKind, FileStatus, JobStatus};

#[derive(Debug, Clone, FromRow)]
pub struct FileRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub original_name: String,
    pub storage_bucket: String,
    pub storage_key: String,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
    pub is_processed_output: bool,
    pub parent_file_id: Option<Uuid>,
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    pub id: Uuid,
    pub file_id: Uuid,
    pub pipeline_id: Option<Uuid>,
    #[sqlx(rename = "type")]
    pub kind: ActionKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result_file_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub params: Value,
}

#[derive(Debug, Clone, FromRow)]
pub struct FileMetadataRecord {
    pub id: Uuid,
    pub file_id: Uuid,
    pub exif_data: Option<Value>,
    pub video_info: Option<Value>,
    pub ai_tags: Option<Value>,
    pub custom_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A derived artifact row to insert alongside job completion.
#[derive(Debug, Clone)]
pub struct NewDerivedFile {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub original_name: String,
    pub storage_bucket: String,
    pub storage_key: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub parent_file_id: Uuid,
}

/// Object-store location of a blob scheduled for deletion.
#[derive(Debug, Clone, FromRow)]
pub struct BlobRef {
    pub storage_bucket: String,
    pub storage_key: String,
}

const SELECT_FILE: &str = "SELECT id, owner_id, original_name, storage_bucket, storage_key, \
     size_bytes, mime_type, status, created_at, is_processed_output, parent_file_id FROM files";

const SELECT_JOB: &str = "SELECT id, file_id, pipeline_id, \"type\", status, created_at, \
     updated_at, result_file_id, error_message, params FROM jobs";

#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to database")?;
        Ok(Db { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ----- files -------------------------------------------------------

    pub async fn file_by_id(&self, id: Uuid) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecord>(&format!("{SELECT_FILE} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn file_owned_by(&self, id: Uuid, owner_id: Uuid) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecord>(&format!(
            "{SELECT_FILE} WHERE id = $1 AND owner_id = $2"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Non-derived files for one owner, newest first.
    pub async fn list_files(&self, owner_id: Uuid) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecord>(&format!(
            "{SELECT_FILE} WHERE owner_id = $1 AND is_processed_output = FALSE \
             ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Direct derived children of a file.
    pub async fn processed_outputs(&self, parent_id: Uuid) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecord>(&format!(
            "{SELECT_FILE} WHERE parent_file_id = $1 AND is_processed_output = TRUE \
             ORDER BY created_at"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Flip a file's status. A vanished row is a silent no-op: an in-flight
    /// worker may outlive a user delete.
    pub async fn set_file_status(&self, id: Uuid, status: FileStatus) -> Result<()> {
        sqlx::query("UPDATE files SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- jobs --------------------------------------------------------

    pub async fn job_by_id(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRecord>(&format!("{SELECT_JOB} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn jobs_for_file(&self, file_id: Uuid) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRecord>(&format!(
            "{SELECT_JOB} WHERE file_id = $1 ORDER BY created_at"
        ))
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Every job whose subject file belongs to the owner, newest first.
    pub async fn jobs_for_owner(&self, owner_id: Uuid) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRecord>(
            "SELECT j.id, j.file_id, j.pipeline_id, j.\"type\", j.status, j.created_at, \
             j.updated_at, j.result_file_id, j.error_message, j.params \
             FROM jobs j JOIN files f ON f.id = j.file_id \
             WHERE f.owner_id = $1 ORDER BY j.created_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// QUEUED/RUNNING -> RUNNING. Returns false when the row is gone or
    /// already terminal; the guard makes backward transitions impossible at
    /// the statement level.
    pub async fn mark_job_running(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'RUNNING', updated_at = now() \
             WHERE id = $1 AND status IN ('QUEUED', 'RUNNING')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// RUNNING -> COMPLETED for side-effect-only actions. `note` lands in
    /// `error_message` (the virus-scan verdict channel).
    pub async fn mark_job_completed(&self, id: Uuid, note: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'COMPLETED', updated_at = now(), \
             error_message = COALESCE($2, error_message) \
             WHERE id = $1 AND status = 'RUNNING'",
        )
        .bind(id)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// QUEUED/RUNNING -> FAILED with the stringified cause.
    pub async fn mark_job_failed(&self, id: Uuid, error_message: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'FAILED', updated_at = now(), error_message = $2 \
             WHERE id = $1 AND status IN ('QUEUED', 'RUNNING')",
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically record a produced artifact: insert the derived READY file
    /// row and flip the job to COMPLETED pointing at it.
    pub async fn complete_job_with_artifact(
        &self,
        job_id: Uuid,
        derived: &NewDerivedFile,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        insert_derived_file(&mut tx, derived).await?;
        let result = sqlx::query(
            "UPDATE jobs SET status = 'COMPLETED', updated_at = now(), result_file_id = $2 \
             WHERE id = $1 AND status = 'RUNNING'",
        )
        .bind(job_id)
        .bind(derived.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            // Job vanished or was already terminal: drop the derived row too.
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    // ----- metadata ----------------------------------------------------

    pub async fn metadata_for_file(&self, file_id: Uuid) -> Result<Option<FileMetadataRecord>> {
        let row = sqlx::query_as::<_, FileMetadataRecord>(
            "SELECT id, file_id, exif_data, video_info, ai_tags, custom_metadata, \
             created_at, updated_at FROM file_metadata WHERE file_id = $1",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert_ai_tags(&self, file_id: Uuid, tags: &[String]) -> Result<()> {
        self.upsert_metadata_field(file_id, "ai_tags", &serde_json::json!(tags))
            .await
    }

    pub async fn upsert_exif_data(&self, file_id: Uuid, exif: &Value) -> Result<()> {
        self.upsert_metadata_field(file_id, "exif_data", exif).await
    }

    async fn upsert_metadata_field(&self, file_id: Uuid, column: &str, value: &Value) -> Result<()> {
        // `column` is one of two compile-time constants, never user input.
        let sql = format!(
            "INSERT INTO file_metadata (id, file_id, {column}) VALUES ($1, $2, $3) \
             ON CONFLICT (file_id) DO UPDATE SET {column} = EXCLUDED.{column}, updated_at = now()"
        );
        sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(file_id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- delete cascade ----------------------------------------------

    /// Remove a file with everything hanging off it: jobs referencing it as
    /// subject or result, metadata, pipelines, and every descendant derived
    /// file, all in one transaction. Returns the blob locations to delete
    /// from the object store, or None when the file does not exist for this
    /// owner.
    pub async fn delete_file_cascade(
        &self,
        file_id: Uuid,
        owner_id: Uuid,
    ) -> Result<Option<Vec<BlobRef>>> {
        let mut tx = self.pool.begin().await?;

        let root = sqlx::query_as::<_, BlobRef>(
            "SELECT storage_bucket, storage_key FROM files WHERE id = $1 AND owner_id = $2",
        )
        .bind(file_id)
        .bind(owner_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(root) = root else {
            return Ok(None);
        };

        #[derive(FromRow)]
        struct Descendant {
            id: Uuid,
            storage_bucket: String,
            storage_key: String,
        }
        let descendants = sqlx::query_as::<_, Descendant>(
            "WITH RECURSIVE descendants AS ( \
                 SELECT id, storage_bucket, storage_key FROM files WHERE parent_file_id = $1 \
                 UNION ALL \
                 SELECT f.id, f.storage_bucket, f.storage_key \
                 FROM files f JOIN descendants d ON f.parent_file_id = d.id \
             ) SELECT id, storage_bucket, storage_key FROM descendants",
        )
        .bind(file_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut all_ids: Vec<Uuid> = descendants.iter().map(|d| d.id).collect();
        all_ids.push(file_id);

        sqlx::query("DELETE FROM jobs WHERE file_id = ANY($1) OR result_file_id = ANY($1)")
            .bind(&all_ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_metadata WHERE file_id = ANY($1)")
            .bind(&all_ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pipelines WHERE file_id = ANY($1)")
            .bind(&all_ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ANY($1)")
            .bind(&all_ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let mut blobs: Vec<BlobRef> = descendants
            .into_iter()
            .map(|d| BlobRef {
                storage_bucket: d.storage_bucket,
                storage_key: d.storage_key,
            })
            .collect();
        blobs.push(root);
        Ok(Some(blobs))
    }
}

/// Insert a derived file row inside an open transaction.
async fn insert_derived_file(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    derived: &NewDerivedFile,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO files (id, owner_id, original_name, storage_bucket, storage_key, \
         size_bytes, mime_type, status, is_processed_output, parent_file_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, 'READY', TRUE, $8)",
    )
    .bind(derived.id)
    .bind(derived.owner_id)
    .bind(&derived.original_name)
    .bind(&derived.storage_bucket)
    .bind(&derived.storage_key)
    .bind(derived.size_bytes)
    .bind(&derived.mime_type)
    .bind(derived.parent_file_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Row-insert helpers shared with the submitter's transaction.
pub mod submit {
    use super::*;

    pub struct NewFile<'a> {
        pub id: Uuid,
        pub owner_id: Uuid,
        pub original_name: &'a str,
        pub storage_bucket: &'a str,
        pub storage_key: &'a str,
        pub size_bytes: i64,
        pub mime_type: &'a str,
    }

    pub async fn insert_file(conn: &mut PgConnection, file: &NewFile<'_>) -> Result<()> {
        sqlx::query(
            "INSERT INTO files (id, owner_id, original_name, storage_bucket, storage_key, \
             size_bytes, mime_type, status, is_processed_output) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'UPLOADED', FALSE)",
        )
        .bind(file.id)
        .bind(file.owner_id)
        .bind(file.original_name)
        .bind(file.storage_bucket)
        .bind(file.storage_key)
        .bind(file.size_bytes)
        .bind(file.mime_type)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn insert_pipeline(
        conn: &mut PgConnection,
        id: Uuid,
        file_id: Uuid,
        name: &str,
        steps: &Value,
    ) -> Result<()> {
        sqlx::query("INSERT INTO pipelines (id, file_id, name, steps) VALUES ($1, $2, $3, $4)")
            .bind(id)
            .bind(file_id)
            .bind(name)
            .bind(steps)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn insert_queued_job(
        conn: &mut PgConnection,
        id: Uuid,
        file_id: Uuid,
        pipeline_id: Uuid,
        kind: ActionKind,
        params: &Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, file_id, pipeline_id, \"type\", status, params) \
             VALUES ($1, $2, $3, $4, 'QUEUED', $5)",
        )
        .bind(id)
        .bind(file_id)
        .bind(pipeline_id)
        .bind(kind)
        .bind(params)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn set_file_processing(conn: &mut PgConnection, file_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE files SET status = 'PROCESSING' WHERE id = $1")
            .bind(file_id)
            .execute(conn)
            .await?;
        Ok(())
    }
}
