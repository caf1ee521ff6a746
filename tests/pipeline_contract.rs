//! Cross-module contract checks: the REST action strings, the queue routing
//! table, and the broker envelope must all agree, because workers decode
//! envelopes produced by the submitter of a different process.

use conveyor::dispatch::{parse_actions, storage_key};
use conveyor::domain::{ActionKind, JobEnvelope, WorkQueue, buckets};
use uuid::Uuid;

#[test]
fn submitted_actions_route_and_survive_the_wire() {
    let steps = parse_actions(r#"["thumbnail", "virus_scan", "ai_tag"]"#).expect("parse");
    let kinds: Vec<ActionKind> = steps.iter().map(|step| step.kind).collect();
    assert_eq!(
        kinds,
        [
            ActionKind::Thumbnail,
            ActionKind::VirusScan,
            ActionKind::AiTag
        ]
    );

    let owner_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    let key = storage_key(owner_id, file_id, "cat.png");

    for step in steps {
        let action = step.kind;
        let envelope = JobEnvelope {
            job_id: Uuid::new_v4(),
            file_id,
            bucket: buckets::RAW.to_string(),
            key: key.clone(),
            kind: action,
            params: step.params,
        };

        // What the submitter publishes is exactly what the worker decodes.
        let payload = serde_json::to_vec(&envelope).expect("encode");
        let decoded: JobEnvelope = serde_json::from_slice(&payload).expect("decode");
        assert_eq!(decoded.job_id, envelope.job_id);
        assert_eq!(decoded.kind, action);
        assert_eq!(decoded.bucket, "raw");
        assert_eq!(decoded.key, key);
    }

    assert_eq!(ActionKind::Thumbnail.queue(), WorkQueue::Image);
    assert_eq!(ActionKind::VirusScan.queue(), WorkQueue::Security);
    assert_eq!(ActionKind::AiTag.queue(), WorkQueue::Ai);
}

#[test]
fn unknown_actions_are_rejected_before_any_row_exists() {
    // "shred" must fail validation; nothing may reach the broker or the
    // database for a rejected submission.
    let err = parse_actions(r#"["shred"]"#).unwrap_err();
    assert!(err.contains("shred"), "error should name the action: {err}");
}

#[test]
fn raw_uploads_are_keyed_under_owner_and_file_id() {
    let owner_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    let key = storage_key(owner_id, file_id, "clip.mp4");
    assert_eq!(key, format!("{owner_id}/{file_id}_clip.mp4"));
}
