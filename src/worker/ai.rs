//! AI fleet handler: AI_TAG. Sends the image to Gemini with a fixed tagging
//! prompt and upserts the normalized tag list into file metadata. Model
//! trouble never fails the job; a fallback list is recorded instead.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{Outcome, WorkerContext};
use crate::db::FileRecord;
use crate::domain::{ActionKind, JobEnvelope};

const GEMINI_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent";

const TAG_PROMPT: &str = "Analyze this image and provide 5-10 descriptive tags as a \
     comma-separated list. Only return the tags, nothing else.";

const MAX_TAGS: usize = 10;

/// Recorded when no API key is configured.
const MISSING_KEY_TAGS: [&str; 3] = ["sample", "image", "auto-tagged"];
/// Recorded when the model call fails.
const MODEL_ERROR_TAGS: [&str; 2] = ["error", "auto-tag-failed"];

pub async fn handle(
    ctx: &WorkerContext,
    envelope: &JobEnvelope,
    file: &FileRecord,
    input: &Path,
) -> Result<Outcome> {
    if envelope.kind != ActionKind::AiTag {
        bail!("action {} is not an ai action", envelope.kind.wire_name());
    }

    let tags = match &ctx.settings.gemini_api_key {
        None => {
            warn!("GEMINI_API_KEY not set, recording fallback tags");
            to_owned_tags(&MISSING_KEY_TAGS)
        }
        Some(api_key) => {
            let mime = file.mime_type.as_deref().unwrap_or("image/jpeg");
            match request_tags(api_key, input, mime).await {
                Ok(tags) if !tags.is_empty() => tags,
                Ok(_) => {
                    warn!("model returned no usable tags");
                    to_owned_tags(&MODEL_ERROR_TAGS)
                }
                Err(err) => {
                    warn!(error = format!("{err:#}"), "tagging model call failed");
                    to_owned_tags(&MODEL_ERROR_TAGS)
                }
            }
        }
    };

    info!(tag_count = tags.len(), "storing ai tags");
    ctx.db.upsert_ai_tags(file.id, &tags).await?;
    Ok(Outcome::Done)
}

async fn request_tags(api_key: &str, input: &Path, mime: &str) -> Result<Vec<String>> {
    let bytes = tokio::fs::read(input).await.context("reading image")?;
    let body = json!({
        "contents": [{
            "parts": [
                {"text": TAG_PROMPT},
                {"inline_data": {"mime_type": mime, "data": BASE64.encode(&bytes)}},
            ],
        }],
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{GEMINI_ENDPOINT}?key={api_key}"))
        .json(&body)
        .send()
        .await
        .context("calling tagging model")?
        .error_for_status()
        .context("tagging model returned an error status")?;

    let payload: Value = response.json().await.context("decoding model response")?;
    let text = payload["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .ok_or_else(|| anyhow!("model response carried no text part"))?;
    Ok(parse_tags(text))
}

/// Normalize the model's comma-separated reply: lowercase, trimmed,
/// empties dropped, capped at `MAX_TAGS`.
pub(crate) fn parse_tags(text: &str) -> Vec<String> {
    text.split(',')
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .take(MAX_TAGS)
        .collect()
}

fn to_owned_tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_lowercased_and_trimmed() {
        assert_eq!(
            parse_tags("Cat , Whiskers,  FUR ,tabby"),
            ["cat", "whiskers", "fur", "tabby"]
        );
    }

    #[test]
    fn empty_segments_are_dropped() {
        assert_eq!(parse_tags("a,,b, ,c"), ["a", "b", "c"]);
        assert!(parse_tags("").is_empty());
        assert!(parse_tags(" , ,").is_empty());
    }

    #[test]
    fn tag_list_is_capped_at_ten() {
        let reply = (0..20).map(|i| format!("tag{i}")).collect::<Vec<_>>().join(", ");
        let tags = parse_tags(&reply);
        assert_eq!(tags.len(), MAX_TAGS);
        assert_eq!(tags[0], "tag0");
        assert_eq!(tags[9], "tag9");
    }

    #[test]
    fn fallback_lists_match_the_recorded_contract() {
        assert_eq!(MISSING_KEY_TAGS, ["sample", "image", "auto-tagged"]);
        assert_eq!(MODEL_ERROR_TAGS, ["error", "auto-tag-failed"]);
    }
}
