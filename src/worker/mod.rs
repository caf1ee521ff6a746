//! Worker Runtime: the consumer loop shared by every fleet.
//!
//! One envelope is in flight per process (broker prefetch = 1). Each
//! delivery is decoded, gated for idempotency, executed under a per-fleet
//! wall-clock cap, and acknowledged. Scratch space is a per-delivery
//! `TempDir` whose drop guarantees release on all exit paths.

pub mod ai;
pub mod image;
pub mod security;
pub mod video;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::Settings;
use crate::db::{Db, NewDerivedFile};
use crate::domain::{FileStatus, JobEnvelope, JobStatus, WorkQueue};
use crate::storage::ObjectStore;

/// One worker fleet. Each fleet consumes exactly one queue; horizontal
/// scaling is achieved by running more processes of the same fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Fleet {
    Image,
    Video,
    Security,
    Ai,
}

impl Fleet {
    pub fn queue(self) -> WorkQueue {
        match self {
            Fleet::Image => WorkQueue::Image,
            Fleet::Video => WorkQueue::Video,
            Fleet::Security => WorkQueue::Security,
            Fleet::Ai => WorkQueue::Ai,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Fleet::Image => "image",
            Fleet::Video => "video",
            Fleet::Security => "security",
            Fleet::Ai => "ai",
        }
    }

    /// Wall-clock cap for one handler invocation. Subprocesses are spawned
    /// kill-on-drop, so an expired timeout also terminates the child.
    pub fn handler_timeout(self) -> Duration {
        match self {
            Fleet::Image => Duration::from_secs(60),
            Fleet::Video => Duration::from_secs(600),
            Fleet::Security => Duration::from_secs(300),
            Fleet::Ai => Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct WorkerContext {
    pub db: Db,
    pub storage: ObjectStore,
    pub settings: Arc<Settings>,
}

/// A produced artifact waiting to be uploaded and recorded.
pub struct Artifact {
    pub path: PathBuf,
    pub bucket: &'static str,
    pub key: String,
    pub mime: String,
    /// `original_name` of the derived File row; may differ from the storage
    /// key (video outputs keep an id-prefixed key with a friendlier name).
    pub display_name: String,
}

/// What a handler produced.
pub enum Outcome {
    /// Upload, insert the derived READY row, complete the job, promote the
    /// parent file to READY.
    Artifact(Artifact),
    /// Side effects already written; complete the job, promote the parent.
    Done,
    /// Like `Done`, with a note carried in `error_message` (scan verdicts).
    DoneWithNote(String),
    /// Security finding: fail the job AND the parent file.
    Quarantined(String),
}

enum Disposition {
    Ack,
    /// Nack without requeue; the delivery dead-letters to `<queue>.dead`.
    Drop,
}

/// Fleet entry point: consume forever, re-establishing the channel after
/// stream failures.
pub async fn run(fleet: Fleet, ctx: WorkerContext, broker: Broker) -> Result<()> {
    let tag = format!("{}-worker", fleet.name());
    info!(fleet = fleet.name(), queue = fleet.queue().name(), "worker started");

    loop {
        let mut handle = match broker.consumer(fleet.queue(), &tag).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = format!("{err:#}"), "broker unavailable, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        while let Some(delivery) = handle.consumer.next().await {
            match delivery {
                Ok(delivery) => handle_delivery(fleet, &ctx, delivery).await,
                Err(err) => {
                    warn!(error = %err, "consumer stream failed");
                    break;
                }
            }
        }
        warn!("consumer closed, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn handle_delivery(fleet: Fleet, ctx: &WorkerContext, delivery: Delivery) {
    let envelope = match serde_json::from_slice::<JobEnvelope>(&delivery.data) {
        Ok(envelope) => envelope,
        Err(err) => {
            // Structural failure: no job to blame reliably. Drop to the DLQ
            // with no state change.
            warn!(error = %err, "malformed envelope");
            finish(delivery, Disposition::Drop).await;
            return;
        }
    };

    let span = info_span!(
        "job",
        job_id = %envelope.job_id,
        file_id = %envelope.file_id,
        action = envelope.kind.wire_name(),
    );
    let disposition = async {
        match process_envelope(fleet, ctx, &envelope).await {
            Ok(disposition) => disposition,
            Err(err) => {
                let cause = format!("{err:#}");
                error!(error = %cause, "job failed");
                if let Err(db_err) = ctx.db.mark_job_failed(envelope.job_id, &cause).await {
                    error!(error = format!("{db_err:#}"), "failed to record job failure");
                }
                Disposition::Drop
            }
        }
    }
    .instrument(span)
    .await;

    finish(delivery, disposition).await;
}

async fn finish(delivery: Delivery, disposition: Disposition) {
    let result = match disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
        Disposition::Drop => {
            delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                })
                .await
        }
    };
    if let Err(err) = result {
        // The broker will redeliver; the idempotency gate absorbs it.
        warn!(error = %err, "acknowledgement failed");
    }
}

async fn process_envelope(
    fleet: Fleet,
    ctx: &WorkerContext,
    envelope: &JobEnvelope,
) -> Result<Disposition> {
    // Idempotency gate: delivery is at-least-once, so redeliveries of
    // terminal jobs must ack without work.
    let Some(job) = ctx.db.job_by_id(envelope.job_id).await? else {
        info!("job row vanished; acknowledging without work");
        return Ok(Disposition::Ack);
    };
    if job.status.is_terminal() {
        info!(status = ?job.status, "job already terminal; acknowledging without work");
        return Ok(Disposition::Ack);
    }
    if job.status == JobStatus::Running {
        info!("job left RUNNING by a previous crash; re-executing");
    }
    if !ctx.db.mark_job_running(envelope.job_id).await? {
        return Ok(Disposition::Ack);
    }

    let Some(file) = ctx.db.file_by_id(envelope.file_id).await? else {
        info!("subject file vanished; acknowledging without work");
        return Ok(Disposition::Ack);
    };

    let workdir = tempfile::tempdir().context("creating scratch directory")?;
    let input_path = workdir.path().join(format!("input{}", file_ext(&envelope.key)));
    ctx.storage
        .get(&envelope.bucket, &envelope.key, &input_path)
        .await
        .context("downloading input object")?;

    let outcome = tokio::time::timeout(
        fleet.handler_timeout(),
        run_handler(ctx, envelope, &file, &input_path, workdir.path()),
    )
    .await
    .map_err(|_| anyhow!("timeout"))??;

    match outcome {
        Outcome::Artifact(artifact) => {
            let size_bytes = tokio::fs::metadata(&artifact.path)
                .await
                .context("sizing artifact")?
                .len() as i64;
            ctx.storage
                .put(artifact.bucket, &artifact.key, &artifact.path, &artifact.mime)
                .await
                .context("uploading artifact")?;

            let derived = NewDerivedFile {
                id: Uuid::new_v4(),
                owner_id: file.owner_id,
                original_name: artifact.display_name,
                storage_bucket: artifact.bucket.to_string(),
                storage_key: artifact.key,
                size_bytes,
                mime_type: artifact.mime,
                parent_file_id: file.id,
            };
            if ctx.db.complete_job_with_artifact(envelope.job_id, &derived).await? {
                ctx.db.set_file_status(file.id, FileStatus::Ready).await?;
                info!(result_file_id = %derived.id, "job completed");
            } else {
                info!("job vanished before completion; artifact row discarded");
            }
        }
        Outcome::Done => {
            ctx.db.mark_job_completed(envelope.job_id, None).await?;
            ctx.db.set_file_status(file.id, FileStatus::Ready).await?;
            info!("job completed");
        }
        Outcome::DoneWithNote(note) => {
            ctx.db.mark_job_completed(envelope.job_id, Some(&note)).await?;
            ctx.db.set_file_status(file.id, FileStatus::Ready).await?;
            info!(note = %note, "job completed");
        }
        Outcome::Quarantined(verdict) => {
            // A security finding is a normal handler completion that happens
            // to write FAILED; only uncaught handler errors dead-letter.
            ctx.db.mark_job_failed(envelope.job_id, &verdict).await?;
            ctx.db.set_file_status(file.id, FileStatus::Failed).await?;
            warn!(verdict = %verdict, "subject file quarantined");
        }
    }
    Ok(Disposition::Ack)
}

/// Dispatch by action kind. Routing already groups kinds per fleet, but the
/// handlers key off the envelope so a misrouted action still runs correctly.
async fn run_handler(
    ctx: &WorkerContext,
    envelope: &JobEnvelope,
    file: &crate::db::FileRecord,
    input: &Path,
    workdir: &Path,
) -> Result<Outcome> {
    use crate::domain::ActionKind::*;
    match envelope.kind {
        Thumbnail | ImageConvert | ImageCompress | Metadata => {
            image::handle(ctx, envelope, file, input, workdir).await
        }
        VideoThumbnail | VideoPreview | VideoConvert => {
            video::handle(ctx, envelope, file, input, workdir).await
        }
        Compress | Encrypt | Decrypt | VirusScan => {
            security::handle(ctx, envelope, file, input, workdir).await
        }
        AiTag => ai::handle(ctx, envelope, file, input).await,
    }
}

/// Filename stem used for derived keys; falls back to `file` like the
/// original worker naming.
pub(crate) fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

/// Extension including the leading dot, or empty when there is none.
pub(crate) fn file_ext(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleets_consume_their_queues() {
        assert_eq!(Fleet::Image.queue(), WorkQueue::Image);
        assert_eq!(Fleet::Video.queue(), WorkQueue::Video);
        assert_eq!(Fleet::Security.queue(), WorkQueue::Security);
        assert_eq!(Fleet::Ai.queue(), WorkQueue::Ai);
    }

    #[test]
    fn handler_timeouts_follow_the_recommended_caps() {
        assert_eq!(Fleet::Image.handler_timeout(), Duration::from_secs(60));
        assert_eq!(Fleet::Video.handler_timeout(), Duration::from_secs(600));
        assert_eq!(Fleet::Ai.handler_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn file_stem_and_ext_split_names() {
        assert_eq!(file_stem("cat.png"), "cat");
        assert_eq!(file_ext("cat.png"), ".png");
        assert_eq!(file_stem("archive.tar.gz"), "archive.tar");
        assert_eq!(file_ext("archive.tar.gz"), ".gz");
        assert_eq!(file_stem("noext"), "noext");
        assert_eq!(file_ext("noext"), "");
    }
}
