//! Video fleet handlers. All three actions shell out to ffmpeg; the worker
//! runtime's wall-clock cap plus `kill_on_drop` bounds the subprocess.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::process::Command;

use super::{Artifact, Outcome, WorkerContext, file_stem};
use crate::db::FileRecord;
use crate::domain::{ActionKind, JobEnvelope, buckets};

const DEFAULT_FRAME_TIME: &str = "00:00:01";
const DEFAULT_PREVIEW_SECONDS: u64 = 10;
const DEFAULT_RESOLUTION: &str = "720p";
const DEFAULT_CONTAINER: &str = "mp4";

/// Bounded stderr excerpt carried into the failure message.
const STDERR_TAIL_BYTES: usize = 2000;

pub async fn handle(
    ctx: &WorkerContext,
    envelope: &JobEnvelope,
    file: &FileRecord,
    input: &Path,
    workdir: &Path,
) -> Result<Outcome> {
    let stem = file_stem(&file.original_name);
    match envelope.kind {
        ActionKind::VideoThumbnail => {
            let time = envelope.param_str("time").unwrap_or(DEFAULT_FRAME_TIME);
            let output = workdir.join("frame.jpg");
            run_ffmpeg(&ctx.settings.ffmpeg_path, &thumbnail_args(input, time, &output)).await?;

            Ok(Outcome::Artifact(Artifact {
                path: output,
                bucket: buckets::THUMBNAILS,
                key: format!("{}_video_thumb.jpg", file.id),
                mime: "image/jpeg".to_string(),
                display_name: format!("{stem}_thumb.jpg"),
            }))
        }
        ActionKind::VideoPreview => {
            let duration = envelope
                .param_u64("duration")
                .unwrap_or(DEFAULT_PREVIEW_SECONDS);
            let output = workdir.join("preview.mp4");
            run_ffmpeg(
                &ctx.settings.ffmpeg_path,
                &preview_args(input, duration, &output),
            )
            .await?;

            Ok(Outcome::Artifact(Artifact {
                path: output,
                bucket: buckets::PROCESSED,
                key: format!("{}_preview.mp4", file.id),
                mime: "video/mp4".to_string(),
                display_name: format!("{stem}_preview.mp4"),
            }))
        }
        ActionKind::VideoConvert => {
            let resolution = envelope
                .param_str("resolution")
                .unwrap_or(DEFAULT_RESOLUTION)
                .to_string();
            let container = envelope
                .param_str("format")
                .unwrap_or(DEFAULT_CONTAINER)
                .to_string();
            let output = workdir.join(format!("converted.{container}"));
            run_ffmpeg(
                &ctx.settings.ffmpeg_path,
                &convert_args(input, &resolution, &output),
            )
            .await?;

            Ok(Outcome::Artifact(Artifact {
                path: output,
                bucket: buckets::PROCESSED,
                key: format!("{}_converted_{resolution}.{container}", file.id),
                mime: container_mime(&container).to_string(),
                display_name: format!("{stem}_converted_{resolution}.{container}"),
            }))
        }
        other => bail!("action {} is not a video action", other.wire_name()),
    }
}

fn thumbnail_args(input: &Path, time: &str, output: &Path) -> Vec<OsString> {
    vec![
        "-i".into(),
        input.as_os_str().into(),
        "-ss".into(),
        time.into(),
        "-vframes".into(),
        "1".into(),
        "-vf".into(),
        "scale=640:-1".into(),
        "-y".into(),
        output.as_os_str().into(),
    ]
}

fn preview_args(input: &Path, duration: u64, output: &Path) -> Vec<OsString> {
    vec![
        "-i".into(),
        input.as_os_str().into(),
        "-t".into(),
        duration.to_string().into(),
        "-c:v".into(),
        "libx264".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:v".into(),
        "1M".into(),
        "-b:a".into(),
        "128k".into(),
        "-y".into(),
        output.as_os_str().into(),
    ]
}

fn convert_args(input: &Path, resolution: &str, output: &Path) -> Vec<OsString> {
    let height = resolution_height(resolution);
    vec![
        "-i".into(),
        input.as_os_str().into(),
        // -2 keeps the width even, which libx264 requires.
        "-vf".into(),
        format!("scale=-2:{height}").into(),
        "-c:v".into(),
        "libx264".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:v".into(),
        "2M".into(),
        "-b:a".into(),
        "192k".into(),
        "-y".into(),
        output.as_os_str().into(),
    ]
}

fn resolution_height(resolution: &str) -> u32 {
    match resolution {
        "480p" => 480,
        "720p" => 720,
        "1080p" => 1080,
        _ => 720,
    }
}

fn container_mime(container: &str) -> &'static str {
    match container {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

async fn run_ffmpeg(ffmpeg_path: &str, args: &[OsString]) -> Result<()> {
    let output = Command::new(ffmpeg_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("spawning {ffmpeg_path}"))?;

    if !output.status.success() {
        bail!(
            "ffmpeg failed ({}): {}",
            output.status,
            stderr_tail(&output.stderr)
        );
    }
    Ok(())
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    match trimmed.char_indices().nth_back(STDERR_TAIL_BYTES) {
        Some((idx, _)) => format!("...{}", &trimmed[idx..]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn thumbnail_args_extract_one_scaled_frame() {
        let args = strings(&thumbnail_args(
            &PathBuf::from("/tmp/in.mp4"),
            "00:00:05",
            &PathBuf::from("/tmp/out.jpg"),
        ));
        assert_eq!(
            args,
            [
                "-i", "/tmp/in.mp4", "-ss", "00:00:05", "-vframes", "1", "-vf", "scale=640:-1",
                "-y", "/tmp/out.jpg",
            ]
        );
    }

    #[test]
    fn preview_args_cap_duration_and_bitrates() {
        let args = strings(&preview_args(
            &PathBuf::from("in.mp4"),
            10,
            &PathBuf::from("out.mp4"),
        ));
        assert_eq!(
            args,
            [
                "-i", "in.mp4", "-t", "10", "-c:v", "libx264", "-c:a", "aac", "-b:v", "1M",
                "-b:a", "128k", "-y", "out.mp4",
            ]
        );
    }

    #[test]
    fn convert_args_scale_to_even_width() {
        let args = strings(&convert_args(
            &PathBuf::from("in.mov"),
            "1080p",
            &PathBuf::from("out.mp4"),
        ));
        assert!(args.contains(&"scale=-2:1080".to_string()));
        assert!(args.contains(&"-b:v".to_string()));
        assert!(args.contains(&"2M".to_string()));
    }

    #[test]
    fn unknown_resolutions_fall_back_to_720() {
        assert_eq!(resolution_height("480p"), 480);
        assert_eq!(resolution_height("720p"), 720);
        assert_eq!(resolution_height("1080p"), 1080);
        assert_eq!(resolution_height("4k"), 720);
    }

    #[test]
    fn stderr_tail_bounds_long_output() {
        let long = "x".repeat(10_000);
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.len() <= STDERR_TAIL_BYTES + 4);
        assert!(tail.starts_with("..."));
        assert_eq!(stderr_tail(b"short error"), "short error");
    }
}
