use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One processing operation kind. Closed set: submission rejects anything
/// outside it, so no "unknown action" value ever reaches a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Thumbnail,
    ImageConvert,
    ImageCompress,
    VideoThumbnail,
    VideoPreview,
    VideoConvert,
    Compress,
    Metadata,
    Encrypt,
    Decrypt,
    VirusScan,
    AiTag,
}

impl ActionKind {
    /// Static routing table: action -> worker queue.
    ///
    /// `Metadata` rides on the image fleet; there is no dedicated metadata
    /// worker even though `metadata_queue` exists in the topology.
    pub fn queue(self) -> WorkQueue {
        match self {
            ActionKind::Thumbnail
            | ActionKind::ImageConvert
            | ActionKind::ImageCompress
            | ActionKind::Metadata => WorkQueue::Image,
            ActionKind::VideoThumbnail | ActionKind::VideoPreview | ActionKind::VideoConvert => {
                WorkQueue::Video
            }
            ActionKind::Compress
            | ActionKind::Encrypt
            | ActionKind::Decrypt
            | ActionKind::VirusScan => WorkQueue::Security,
            ActionKind::AiTag => WorkQueue::Ai,
        }
    }

    /// Whether a completed job of this kind carries a `result_file_id`.
    /// Side-effect-only actions write metadata or a verdict instead.
    pub fn produces_artifact(self) -> bool {
        !matches!(
            self,
            ActionKind::Metadata | ActionKind::VirusScan | ActionKind::AiTag
        )
    }

    /// Wire name as used in REST bodies and broker envelopes.
    pub fn wire_name(self) -> &'static str {
        match self {
            ActionKind::Thumbnail => "thumbnail",
            ActionKind::ImageConvert => "image_convert",
            ActionKind::ImageCompress => "image_compress",
            ActionKind::VideoThumbnail => "video_thumbnail",
            ActionKind::VideoPreview => "video_preview",
            ActionKind::VideoConvert => "video_convert",
            ActionKind::Compress => "compress",
            ActionKind::Metadata => "metadata",
            ActionKind::Encrypt => "encrypt",
            ActionKind::Decrypt => "decrypt",
            ActionKind::VirusScan => "virus_scan",
            ActionKind::AiTag => "ai_tag",
        }
    }
}

/// The fixed broker queue set. Every queue is declared durable at startup;
/// `Metadata` and `Generic` are part of the topology but no fleet binds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkQueue {
    Image,
    Video,
    Security,
    Ai,
    Metadata,
    Generic,
}

impl WorkQueue {
    pub const ALL: [WorkQueue; 6] = [
        WorkQueue::Image,
        WorkQueue::Video,
        WorkQueue::Security,
        WorkQueue::Ai,
        WorkQueue::Metadata,
        WorkQueue::Generic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WorkQueue::Image => "image_queue",
            WorkQueue::Video => "video_queue",
            WorkQueue::Security => "security_queue",
            WorkQueue::Ai => "ai_queue",
            WorkQueue::Metadata => "metadata_queue",
            WorkQueue::Generic => "generic_queue",
        }
    }

    /// Dead-letter queue paired with this work queue.
    pub fn dead_letter_name(self) -> String {
        format!("{}.dead", self.name())
    }
}

/// Lifecycle of a stored binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Uploaded,
    Processing,
    Ready,
    Failed,
}

/// Lifecycle of a job. Transitions are strictly forward:
/// QUEUED -> RUNNING -> {COMPLETED, FAILED}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only transition check. RUNNING -> RUNNING is allowed so a
    /// redelivered envelope can re-claim a job whose worker crashed mid-run.
    pub fn allows_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Running) => true,
            (JobStatus::Queued | JobStatus::Running, JobStatus::Completed | JobStatus::Failed) => {
                true
            }
            _ => false,
        }
    }
}

/// Names of the fixed object-store bucket set.
pub mod buckets {
    pub const RAW: &str = "raw";
    pub const PROCESSED: &str = "processed";
    pub const THUMBNAILS: &str = "thumbnails";
    pub const TEMP: &str = "temp";
    pub const ENCRYPTED: &str = "encrypted";

    pub const ALL: [&str; 5] = [RAW, PROCESSED, THUMBNAILS, TEMP, ENCRYPTED];
}

/// The broker message payload conveying one job. The field names are a
/// stable wire contract shared with every worker fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: Uuid,
    pub file_id: Uuid,
    pub bucket: String,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl JobEnvelope {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(serde_json::Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(serde_json::Value::as_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_kind_uses_snake_case_wire_names() {
        for kind in [
            ActionKind::Thumbnail,
            ActionKind::ImageConvert,
            ActionKind::ImageCompress,
            ActionKind::VideoThumbnail,
            ActionKind::VideoPreview,
            ActionKind::VideoConvert,
            ActionKind::Compress,
            ActionKind::Metadata,
            ActionKind::Encrypt,
            ActionKind::Decrypt,
            ActionKind::VirusScan,
            ActionKind::AiTag,
        ] {
            let encoded = serde_json::to_value(kind).expect("serialize ActionKind");
            assert_eq!(encoded, json!(kind.wire_name()));
            let decoded: ActionKind =
                serde_json::from_value(encoded).expect("deserialize ActionKind");
            assert_eq!(decoded, kind);
        }
    }

    #[test]
    fn unknown_action_strings_fail_to_parse() {
        assert!(serde_json::from_value::<ActionKind>(json!("shred")).is_err());
        assert!(serde_json::from_value::<ActionKind>(json!("THUMBNAIL")).is_err());
    }

    #[test]
    fn routing_table_matches_fleet_assignment() {
        assert_eq!(ActionKind::Thumbnail.queue(), WorkQueue::Image);
        assert_eq!(ActionKind::ImageConvert.queue(), WorkQueue::Image);
        assert_eq!(ActionKind::ImageCompress.queue(), WorkQueue::Image);
        assert_eq!(ActionKind::Metadata.queue(), WorkQueue::Image);
        assert_eq!(ActionKind::VideoThumbnail.queue(), WorkQueue::Video);
        assert_eq!(ActionKind::VideoPreview.queue(), WorkQueue::Video);
        assert_eq!(ActionKind::VideoConvert.queue(), WorkQueue::Video);
        assert_eq!(ActionKind::Compress.queue(), WorkQueue::Security);
        assert_eq!(ActionKind::Encrypt.queue(), WorkQueue::Security);
        assert_eq!(ActionKind::Decrypt.queue(), WorkQueue::Security);
        assert_eq!(ActionKind::VirusScan.queue(), WorkQueue::Security);
        assert_eq!(ActionKind::AiTag.queue(), WorkQueue::Ai);
    }

    #[test]
    fn artifact_producing_actions_are_classified() {
        assert!(ActionKind::Thumbnail.produces_artifact());
        assert!(ActionKind::Encrypt.produces_artifact());
        assert!(ActionKind::Compress.produces_artifact());
        assert!(!ActionKind::VirusScan.produces_artifact());
        assert!(!ActionKind::AiTag.produces_artifact());
        assert!(!ActionKind::Metadata.produces_artifact());
    }

    #[test]
    fn job_status_transitions_are_forward_only() {
        use JobStatus::*;
        assert!(Queued.allows_transition_to(Running));
        assert!(Running.allows_transition_to(Completed));
        assert!(Running.allows_transition_to(Failed));
        assert!(Queued.allows_transition_to(Failed));
        // Crash redelivery may re-claim a RUNNING job.
        assert!(Running.allows_transition_to(Running));
        // Never backward out of a terminal state.
        assert!(!Completed.allows_transition_to(Running));
        assert!(!Completed.allows_transition_to(Queued));
        assert!(!Failed.allows_transition_to(Running));
        assert!(!Failed.allows_transition_to(Completed));
        assert!(!Running.allows_transition_to(Queued));
    }

    #[test]
    fn envelope_wire_shape_is_stable() {
        let envelope = JobEnvelope {
            job_id: Uuid::nil(),
            file_id: Uuid::nil(),
            bucket: "raw".to_string(),
            key: "owner/abc_cat.png".to_string(),
            kind: ActionKind::Thumbnail,
            params: json!({"size": "128x128"}),
        };

        let value = serde_json::to_value(&envelope).expect("serialize envelope");
        assert_eq!(
            value,
            json!({
                "job_id": "00000000-0000-0000-0000-000000000000",
                "file_id": "00000000-0000-0000-0000-000000000000",
                "bucket": "raw",
                "key": "owner/abc_cat.png",
                "type": "thumbnail",
                "params": {"size": "128x128"},
            })
        );
    }

    #[test]
    fn envelope_params_default_to_empty_object() {
        let decoded: JobEnvelope = serde_json::from_value(json!({
            "job_id": "00000000-0000-0000-0000-000000000000",
            "file_id": "00000000-0000-0000-0000-000000000000",
            "bucket": "raw",
            "key": "k",
            "type": "virus_scan",
        }))
        .expect("deserialize envelope without params");
        assert!(decoded.params.as_object().is_some_and(|m| m.is_empty()));
        assert_eq!(decoded.param_str("missing"), None);
    }

    #[test]
    fn queue_names_match_broker_topology() {
        let names: Vec<&str> = WorkQueue::ALL.iter().map(|q| q.name()).collect();
        assert_eq!(
            names,
            [
                "image_queue",
                "video_queue",
                "security_queue",
                "ai_queue",
                "metadata_queue",
                "generic_queue",
            ]
        );
        assert_eq!(WorkQueue::Image.dead_letter_name(), "image_queue.dead");
    }
}
