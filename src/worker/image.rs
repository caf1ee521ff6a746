//! Image fleet handlers: THUMBNAIL, IMAGE_CONVERT, IMAGE_COMPRESS, and the
//! side-effect-only METADATA probe. Decode/encode is CPU-bound and runs
//! under `spawn_blocking`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::json;

use super::{Artifact, Outcome, WorkerContext, file_stem};
use crate::db::FileRecord;
use crate::domain::{ActionKind, JobEnvelope, buckets};

const DEFAULT_THUMBNAIL_SIZE: &str = "256x256";
const THUMBNAIL_JPEG_QUALITY: u8 = 85;
const DEFAULT_CONVERT_QUALITY: u8 = 85;
const DEFAULT_COMPRESS_QUALITY: u8 = 60;

pub async fn handle(
    ctx: &WorkerContext,
    envelope: &JobEnvelope,
    file: &FileRecord,
    input: &Path,
    workdir: &Path,
) -> Result<Outcome> {
    let stem = file_stem(&file.original_name);
    match envelope.kind {
        ActionKind::Thumbnail => {
            let size = envelope
                .param_str("size")
                .unwrap_or(DEFAULT_THUMBNAIL_SIZE)
                .to_string();
            let (width, height) =
                parse_size(&size).ok_or_else(|| anyhow!("invalid thumbnail size {size:?}"))?;

            let output = workdir.join("thumbnail.jpg");
            run_blocking(input, output.clone(), move |input, output| {
                make_thumbnail(input, output, width, height)
            })
            .await?;

            let key = format!("{stem}_thumb_{size}.jpg");
            Ok(Outcome::Artifact(Artifact {
                path: output,
                bucket: buckets::THUMBNAILS,
                display_name: key.clone(),
                key,
                mime: "image/jpeg".to_string(),
            }))
        }
        ActionKind::ImageConvert => {
            let target = TargetFormat::parse(envelope.param_str("target_format").unwrap_or("WEBP"))?;
            let quality = envelope
                .param_u64("quality")
                .map(|q| q.min(100) as u8)
                .unwrap_or(DEFAULT_CONVERT_QUALITY);

            let output = workdir.join(format!("converted.{}", target.extension()));
            run_blocking(input, output.clone(), move |input, output| {
                convert_image(input, output, target, quality)
            })
            .await?;

            let key = format!("{stem}_converted.{}", target.extension());
            Ok(Outcome::Artifact(Artifact {
                path: output,
                bucket: buckets::PROCESSED,
                display_name: key.clone(),
                key,
                mime: target.mime().to_string(),
            }))
        }
        ActionKind::ImageCompress => {
            let quality = envelope
                .param_u64("quality")
                .map(|q| q.min(100) as u8)
                .unwrap_or(DEFAULT_COMPRESS_QUALITY);

            let output = workdir.join("compressed.jpg");
            run_blocking(input, output.clone(), move |input, output| {
                let img = image::open(input).context("decoding image")?;
                save_jpeg(&img, output, quality)
            })
            .await?;

            let key = format!("{stem}_compressed.jpg");
            Ok(Outcome::Artifact(Artifact {
                path: output,
                bucket: buckets::PROCESSED,
                display_name: key.clone(),
                key,
                mime: "image/jpeg".to_string(),
            }))
        }
        ActionKind::Metadata => {
            let probe = {
                let input = input.to_path_buf();
                tokio::task::spawn_blocking(move || probe_image(&input))
                    .await
                    .context("metadata probe task")??
            };
            let exif = json!({
                "width": probe.width,
                "height": probe.height,
                "format": probe.format,
                "size_bytes": file.size_bytes,
            });
            ctx.db.upsert_exif_data(file.id, &exif).await?;
            Ok(Outcome::Done)
        }
        other => bail!("action {} is not an image action", other.wire_name()),
    }
}

async fn run_blocking<F>(input: &Path, output: std::path::PathBuf, f: F) -> Result<()>
where
    F: FnOnce(&Path, &Path) -> Result<()> + Send + 'static,
{
    let input = input.to_path_buf();
    tokio::task::spawn_blocking(move || f(&input, &output))
        .await
        .context("image task")?
}

/// `WxH` parser for the thumbnail `size` parameter.
pub(crate) fn parse_size(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.split_once('x')?;
    let width = w.parse().ok().filter(|v| *v > 0)?;
    let height = h.parse().ok().filter(|v| *v > 0)?;
    Some((width, height))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetFormat {
    Webp,
    Png,
    Jpeg,
}

impl TargetFormat {
    pub(crate) fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "WEBP" => Ok(TargetFormat::Webp),
            "PNG" => Ok(TargetFormat::Png),
            "JPEG" | "JPG" => Ok(TargetFormat::Jpeg),
            other => bail!("unsupported target_format {other:?}"),
        }
    }

    pub(crate) fn extension(self) -> &'static str {
        match self {
            TargetFormat::Webp => "webp",
            TargetFormat::Png => "png",
            TargetFormat::Jpeg => "jpeg",
        }
    }

    pub(crate) fn mime(self) -> &'static str {
        match self {
            TargetFormat::Webp => "image/webp",
            TargetFormat::Png => "image/png",
            TargetFormat::Jpeg => "image/jpeg",
        }
    }

}

pub(crate) fn make_thumbnail(input: &Path, output: &Path, width: u32, height: u32) -> Result<()> {
    let img = image::open(input).context("decoding image")?;
    let resized = img.resize(width, height, FilterType::Lanczos3);
    save_jpeg(&resized, output, THUMBNAIL_JPEG_QUALITY)
}

pub(crate) fn convert_image(
    input: &Path,
    output: &Path,
    target: TargetFormat,
    quality: u8,
) -> Result<()> {
    let img = image::open(input).context("decoding image")?;
    match target {
        TargetFormat::Jpeg => save_jpeg(&img, output, quality),
        TargetFormat::Png => {
            img.save_with_format(output, ImageFormat::Png)
                .context("encoding png")?;
            Ok(())
        }
        TargetFormat::Webp => {
            // The webp encoder is lossless; `quality` only applies to JPEG.
            let mut writer = BufWriter::new(File::create(output)?);
            let encoder = WebPEncoder::new_lossless(&mut writer);
            img.to_rgba8()
                .write_with_encoder(encoder)
                .context("encoding webp")?;
            writer.flush()?;
            Ok(())
        }
    }
}

/// JPEG re-encode with alpha flattened onto opaque white.
pub(crate) fn save_jpeg(img: &DynamicImage, output: &Path, quality: u8) -> Result<()> {
    let rgb = flatten_onto_white(img);
    let mut writer = BufWriter::new(File::create(output)?);
    let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
    rgb.write_with_encoder(encoder).context("encoding jpeg")?;
    writer.flush()?;
    Ok(())
}

fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (src, dst) in rgba.pixels().zip(rgb.pixels_mut()) {
        let alpha = src.0[3] as u16;
        let blend = |c: u8| (((c as u16) * alpha + 255 * (255 - alpha)) / 255) as u8;
        *dst = Rgb([blend(src.0[0]), blend(src.0[1]), blend(src.0[2])]);
    }
    rgb
}

struct ImageProbe {
    width: u32,
    height: u32,
    format: Option<&'static str>,
}

fn probe_image(input: &Path) -> Result<ImageProbe> {
    let reader = image::ImageReader::open(input)
        .context("opening image")?
        .with_guessed_format()
        .context("sniffing image format")?;
    let format = reader.format().map(|fmt| fmt.to_mime_type());
    let (width, height) = reader.into_dimensions().context("reading dimensions")?;
    Ok(ImageProbe {
        width,
        height,
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;
    use image::Rgba;

    fn sample_rgba(width: u32, height: u32) -> DynamicImage {
        let img = image::ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 200])
        });
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn parse_size_accepts_wxh() {
        assert_eq!(parse_size("256x256"), Some((256, 256)));
        assert_eq!(parse_size("640x480"), Some((640, 480)));
        assert_eq!(parse_size("0x10"), None);
        assert_eq!(parse_size("256"), None);
        assert_eq!(parse_size("axb"), None);
    }

    #[test]
    fn target_format_parsing_normalizes_jpg() {
        assert_eq!(TargetFormat::parse("webp").unwrap(), TargetFormat::Webp);
        assert_eq!(TargetFormat::parse("PNG").unwrap(), TargetFormat::Png);
        assert_eq!(TargetFormat::parse("jpg").unwrap(), TargetFormat::Jpeg);
        assert_eq!(TargetFormat::parse("JPEG").unwrap(), TargetFormat::Jpeg);
        assert_eq!(TargetFormat::Jpeg.extension(), "jpeg");
        assert!(TargetFormat::parse("gif").is_err());
    }

    #[test]
    fn thumbnails_fit_within_the_requested_box() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.png");
        sample_rgba(640, 480).save(&input).expect("write input");

        let output = dir.path().join("thumb.jpg");
        make_thumbnail(&input, &output, 256, 256).expect("thumbnail");

        let thumb = image::open(&output).expect("decode thumbnail");
        let (w, h) = thumb.dimensions();
        assert!(w <= 256 && h <= 256);
        // Aspect ratio preserved: 640x480 fit into 256x256 is 256x192.
        assert_eq!((w, h), (256, 192));
    }

    #[test]
    fn webp_then_png_round_trip_preserves_dimensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.png");
        sample_rgba(123, 77).save(&input).expect("write input");

        let webp = dir.path().join("converted.webp");
        convert_image(&input, &webp, TargetFormat::Webp, 85).expect("to webp");
        let png = dir.path().join("back.png");
        convert_image(&webp, &png, TargetFormat::Png, 85).expect("back to png");

        assert_eq!(image::open(&png).expect("decode").dimensions(), (123, 77));
    }

    #[test]
    fn jpeg_conversion_flattens_alpha() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.png");
        // Fully transparent pixel should come out white.
        let img = image::ImageBuffer::from_pixel(8, 8, Rgba([0u8, 0, 0, 0]));
        DynamicImage::ImageRgba8(img).save(&input).expect("write");

        let output = dir.path().join("flat.jpg");
        convert_image(&input, &output, TargetFormat::Jpeg, 90).expect("to jpeg");

        let decoded = image::open(&output).expect("decode").to_rgb8();
        let px = decoded.get_pixel(4, 4);
        assert!(px.0.iter().all(|&c| c > 240), "expected near-white, got {px:?}");
    }

    #[test]
    fn compressed_jpeg_is_decodable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.png");
        sample_rgba(64, 64).save(&input).expect("write input");

        let output = dir.path().join("compressed.jpg");
        let img = image::open(&input).expect("open");
        save_jpeg(&img, &output, 60).expect("compress");

        assert_eq!(
            image::open(&output).expect("decode").dimensions(),
            (64, 64)
        );
    }

    #[test]
    fn probe_reports_dimensions_and_mime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.png");
        sample_rgba(32, 16).save(&input).expect("write input");

        let probe = probe_image(&input).expect("probe");
        assert_eq!((probe.width, probe.height), (32, 16));
        assert_eq!(probe.format, Some("image/png"));
    }
}
