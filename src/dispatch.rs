//! Job Router & Submitter: turn one upload plus an ordered action list into
//! a File row, a Pipeline row and QUEUED Job rows (one transaction), then
//! publish one envelope per job to its routed queue.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::db::{Db, submit};
use crate::domain::{ActionKind, JobEnvelope, buckets};
use crate::storage::ObjectStore;

pub struct UploadSubmission<'a> {
    pub owner_id: Uuid,
    pub filename: &'a str,
    pub content_type: &'a str,
    pub size_bytes: i64,
    /// Local spool file holding the uploaded bytes.
    pub payload: &'a Path,
    pub actions: Vec<ActionStep>,
}

/// One requested pipeline step: an action plus its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionStep {
    pub kind: ActionKind,
    pub params: Value,
}

impl ActionStep {
    pub fn bare(kind: ActionKind) -> Self {
        ActionStep {
            kind,
            params: json!({}),
        }
    }
}

/// Parse the `pipeline_actions` form field: a JSON array whose entries are
/// either action strings (`"thumbnail"`) or step objects
/// (`{"type": "encrypt", "params": {"password": "..."}}`). Unknown actions
/// are rejected here so nothing unroutable is ever enqueued.
pub fn parse_actions(raw: &str) -> Result<Vec<ActionStep>, String> {
    let entries: Vec<Value> = serde_json::from_str(raw)
        .map_err(|_| "pipeline_actions must be a JSON array".to_string())?;
    entries.iter().map(parse_step).collect()
}

fn parse_step(entry: &Value) -> Result<ActionStep, String> {
    match entry {
        Value::String(name) => {
            let kind = parse_kind(name)?;
            Ok(ActionStep::bare(kind))
        }
        Value::Object(map) => {
            let name = map
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| "pipeline step object needs a \"type\" string".to_string())?;
            let kind = parse_kind(name)?;
            let params = match map.get("params") {
                None => json!({}),
                Some(params @ Value::Object(_)) => params.clone(),
                Some(_) => return Err(format!("params for {name:?} must be an object")),
            };
            Ok(ActionStep { kind, params })
        }
        _ => Err("pipeline_actions entries must be strings or objects".to_string()),
    }
}

fn parse_kind(name: &str) -> Result<ActionKind, String> {
    serde_json::from_value(Value::String(name.to_string()))
        .map_err(|_| format!("unknown action {name:?}"))
}

/// Storage key layout: `<owner_id>/<file_id>_<filename>`. The file-id prefix
/// keeps keys collision-free without sanitizing user filenames.
pub fn storage_key(owner_id: Uuid, file_id: Uuid, filename: &str) -> String {
    format!("{owner_id}/{file_id}_{filename}")
}

/// Upload the payload to `raw`, persist the rows, publish the envelopes.
/// Publishing happens strictly after commit; a publish failure leaves the
/// job orphaned in QUEUED, which the platform tolerates.
pub async fn submit_upload(
    db: &Db,
    storage: &ObjectStore,
    broker: &Broker,
    submission: UploadSubmission<'_>,
) -> Result<Uuid> {
    let file_id = Uuid::new_v4();
    let key = storage_key(submission.owner_id, file_id, submission.filename);

    storage
        .put(buckets::RAW, &key, submission.payload, submission.content_type)
        .await
        .context("uploading raw object")?;

    let mut tx = db.pool().begin().await?;
    submit::insert_file(
        &mut *tx,
        &submit::NewFile {
            id: file_id,
            owner_id: submission.owner_id,
            original_name: submission.filename,
            storage_bucket: buckets::RAW,
            storage_key: &key,
            size_bytes: submission.size_bytes,
            mime_type: submission.content_type,
        },
    )
    .await?;

    let mut envelopes: Vec<JobEnvelope> = Vec::with_capacity(submission.actions.len());
    if !submission.actions.is_empty() {
        let pipeline_id = Uuid::new_v4();
        let steps: Vec<Value> = submission
            .actions
            .iter()
            .map(|step| json!({"type": step.kind, "params": step.params}))
            .collect();
        submit::insert_pipeline(&mut *tx, pipeline_id, file_id, "Auto Pipeline", &json!(steps))
            .await?;

        for step in &submission.actions {
            let job_id = Uuid::new_v4();
            submit::insert_queued_job(
                &mut *tx,
                job_id,
                file_id,
                pipeline_id,
                step.kind,
                &step.params,
            )
            .await?;
            envelopes.push(JobEnvelope {
                job_id,
                file_id,
                bucket: buckets::RAW.to_string(),
                key: key.clone(),
                kind: step.kind,
                params: step.params.clone(),
            });
        }

        submit::set_file_processing(&mut *tx, file_id).await?;
    }
    tx.commit().await?;

    for envelope in &envelopes {
        let queue = envelope.kind.queue();
        match broker.publish(queue, envelope).await {
            Ok(()) => info!(
                job_id = %envelope.job_id,
                queue = queue.name(),
                action = envelope.kind.wire_name(),
                "published job envelope"
            ),
            Err(err) => warn!(
                job_id = %envelope.job_id,
                queue = queue.name(),
                error = format!("{err:#}"),
                "publish failed; job left QUEUED"
            ),
        }
    }

    Ok(file_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_actions_accepts_known_wire_names() {
        let actions = parse_actions(r#"["thumbnail", "ai_tag"]"#).expect("parse");
        assert_eq!(
            actions,
            vec![
                ActionStep::bare(ActionKind::Thumbnail),
                ActionStep::bare(ActionKind::AiTag),
            ]
        );
    }

    #[test]
    fn parse_actions_accepts_step_objects_with_params() {
        let actions = parse_actions(
            r#"[{"type": "encrypt", "params": {"password": "hunter2"}}, "virus_scan"]"#,
        )
        .expect("parse");
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind, ActionKind::Encrypt);
        assert_eq!(actions[0].params, json!({"password": "hunter2"}));
        assert_eq!(actions[1], ActionStep::bare(ActionKind::VirusScan));
    }

    #[test]
    fn parse_actions_rejects_unknown_names() {
        let err = parse_actions(r#"["thumbnail", "shred"]"#).unwrap_err();
        assert_eq!(err, "unknown action \"shred\"");
        let err = parse_actions(r#"[{"type": "shred"}]"#).unwrap_err();
        assert_eq!(err, "unknown action \"shred\"");
    }

    #[test]
    fn parse_actions_rejects_non_arrays_and_bad_steps() {
        assert!(parse_actions("\"thumbnail\"").is_err());
        assert!(parse_actions("{}").is_err());
        assert!(parse_actions("not json").is_err());
        assert!(parse_actions("[42]").is_err());
        assert!(parse_actions(r#"[{"params": {}}]"#).is_err());
        assert!(parse_actions(r#"[{"type": "encrypt", "params": []}]"#).is_err());
    }

    #[test]
    fn parse_actions_accepts_empty_pipelines() {
        assert_eq!(parse_actions("[]").expect("parse"), Vec::new());
    }

    #[test]
    fn storage_key_is_namespaced_by_owner_and_file_id() {
        let owner = Uuid::nil();
        let file = Uuid::nil();
        assert_eq!(
            storage_key(owner, file, "cat.png"),
            "00000000-0000-0000-0000-000000000000/00000000-0000-0000-0000-000000000000_cat.png"
        );
    }
}
