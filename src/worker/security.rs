//! Security fleet handlers: VIRUS_SCAN, ENCRYPT, DECRYPT, COMPRESS.
//!
//! Encryption is AES-256-GCM under an argon2id-derived key. The output
//! container is self-describing: magic, version, KDF parameters, salt and
//! nonce travel with the ciphertext, so decryption needs nothing but the
//! passphrase. No key material is ever stored.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result, anyhow, bail};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use tokio::process::Command;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::{Artifact, Outcome, WorkerContext, file_ext, file_stem};
use crate::db::FileRecord;
use crate::domain::{ActionKind, JobEnvelope, buckets};

const MAGIC: &[u8; 4] = b"CVS1";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + 1 + SALT_LEN + 12 + NONCE_LEN;

// argon2id cost defaults (memory in KiB).
const KDF_M_COST: u32 = 19_456;
const KDF_T_COST: u32 = 2;
const KDF_P_COST: u32 = 1;

pub async fn handle(
    ctx: &WorkerContext,
    envelope: &JobEnvelope,
    file: &FileRecord,
    input: &Path,
    workdir: &Path,
) -> Result<Outcome> {
    match envelope.kind {
        ActionKind::VirusScan => {
            match scan(&ctx.settings.clamdscan_path, input).await {
                ScanVerdict::Clean => Ok(Outcome::DoneWithNote("clean".to_string())),
                ScanVerdict::Unavailable(reason) => Ok(Outcome::DoneWithNote(format!(
                    "clean (scanner unavailable: {reason})"
                ))),
                ScanVerdict::Infected(signature) => Ok(Outcome::Quarantined(format!(
                    "Virus detected: {signature}"
                ))),
            }
        }
        ActionKind::Encrypt => {
            let password = required_password(envelope, "encrypt")?;
            let output = workdir.join("sealed.enc");
            run_blocking(input.to_path_buf(), output.clone(), move |input, output| {
                encrypt_file(input, output, password.as_bytes())
            })
            .await?;

            let stem = file_stem(&file.original_name);
            let ext = file_ext(&file.original_name);
            let key = format!("{stem}_encrypted{ext}.enc");
            Ok(Outcome::Artifact(Artifact {
                path: output,
                bucket: buckets::ENCRYPTED,
                display_name: key.clone(),
                key,
                mime: "application/octet-stream".to_string(),
            }))
        }
        ActionKind::Decrypt => {
            let password = required_password(envelope, "decrypt")?;
            let output = workdir.join("opened.bin");
            run_blocking(input.to_path_buf(), output.clone(), move |input, output| {
                decrypt_file(input, output, password.as_bytes())
            })
            .await?;

            // A trailing .enc on the source name hides the real extension.
            let logical_name = file
                .original_name
                .strip_suffix(".enc")
                .unwrap_or(&file.original_name);
            let stem = file_stem(logical_name);
            let ext = file_ext(logical_name);
            let key = format!("{stem}_decrypted{ext}");
            Ok(Outcome::Artifact(Artifact {
                path: output,
                bucket: buckets::PROCESSED,
                display_name: key.clone(),
                key,
                mime: "application/octet-stream".to_string(),
            }))
        }
        ActionKind::Compress => {
            let output = workdir.join("archive.zip");
            let entry_name = file.original_name.clone();
            run_blocking(input.to_path_buf(), output.clone(), move |input, output| {
                zip_single_entry(input, output, &entry_name)
            })
            .await?;

            Ok(Outcome::Artifact(Artifact {
                path: output,
                bucket: buckets::PROCESSED,
                key: format!("{}_compressed.zip", file.id),
                mime: "application/zip".to_string(),
                display_name: format!("{}_compressed.zip", file_stem(&file.original_name)),
            }))
        }
        other => bail!("action {} is not a security action", other.wire_name()),
    }
}

fn required_password(envelope: &JobEnvelope, action: &str) -> Result<String> {
    envelope
        .param_str("password")
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{action} requires params.password"))
}

async fn run_blocking<F>(input: PathBuf, output: PathBuf, f: F) -> Result<()>
where
    F: FnOnce(&Path, &Path) -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&input, &output))
        .await
        .context("security task")?
}

// ----- virus scanning --------------------------------------------------

enum ScanVerdict {
    Clean,
    Infected(String),
    Unavailable(String),
}

/// Hand the file to clamdscan. Exit 0 = clean, 1 = virus found, anything
/// else (including a missing binary) counts as unreachable and scans clean.
async fn scan(clamdscan_path: &str, path: &Path) -> ScanVerdict {
    let output = Command::new(clamdscan_path)
        .arg("--no-summary")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(err) => return ScanVerdict::Unavailable(err.to_string()),
    };

    match output.status.code() {
        Some(0) => ScanVerdict::Clean,
        Some(1) => {
            let report = String::from_utf8_lossy(&output.stdout);
            let signature = parse_scan_report(&report)
                .unwrap_or_else(|| "unknown signature".to_string());
            ScanVerdict::Infected(signature)
        }
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            ScanVerdict::Unavailable(stderr.trim().to_string())
        }
    }
}

/// Pull the signature name out of a `<path>: <Signature> FOUND` report line.
pub(crate) fn parse_scan_report(report: &str) -> Option<String> {
    report.lines().find_map(|line| {
        let rest = line.trim().strip_suffix("FOUND")?;
        let (_, signature) = rest.rsplit_once(": ")?;
        Some(signature.trim().to_string())
    })
}

// ----- authenticated encryption ----------------------------------------

/// Container layout:
/// `magic(4) | version(1) | salt(16) | m_cost(4) | t_cost(4) | p_cost(4) |
///  nonce(12) | ciphertext+tag`.
pub(crate) fn seal(plaintext: &[u8], password: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, KDF_M_COST, KDF_T_COST, KDF_P_COST)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| anyhow!("invalid key length"))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow!("encryption failed"))?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&KDF_M_COST.to_le_bytes());
    out.extend_from_slice(&KDF_T_COST.to_le_bytes());
    out.extend_from_slice(&KDF_P_COST.to_le_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub(crate) fn open_sealed(data: &[u8], password: &[u8]) -> Result<Vec<u8>> {
    if data.len() < HEADER_LEN || data[..4] != MAGIC[..] {
        bail!("not an encrypted container");
    }
    if data[4] != FORMAT_VERSION {
        bail!("unsupported container version {}", data[4]);
    }

    let salt = &data[5..5 + SALT_LEN];
    let mut offset = 5 + SALT_LEN;
    let m_cost = read_u32(data, &mut offset);
    let t_cost = read_u32(data, &mut offset);
    let p_cost = read_u32(data, &mut offset);
    let nonce = &data[offset..offset + NONCE_LEN];
    let ciphertext = &data[offset + NONCE_LEN..];

    let key = derive_key(password, salt, m_cost, t_cost, p_cost)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| anyhow!("invalid key length"))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("decryption failed (wrong password or corrupted data)"))
}

fn read_u32(data: &[u8], offset: &mut usize) -> u32 {
    let value = u32::from_le_bytes(data[*offset..*offset + 4].try_into().expect("length checked"));
    *offset += 4;
    value
}

fn derive_key(
    password: &[u8],
    salt: &[u8],
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
) -> Result<[u8; 32]> {
    let params = Params::new(m_cost, t_cost, p_cost, Some(32))
        .map_err(|err| anyhow!("invalid kdf parameters: {err}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut key)
        .map_err(|err| anyhow!("deriving key: {err}"))?;
    Ok(key)
}

fn encrypt_file(input: &Path, output: &Path, password: &[u8]) -> Result<()> {
    let plaintext = std::fs::read(input).context("reading input")?;
    let sealed = seal(&plaintext, password)?;
    std::fs::write(output, sealed).context("writing container")?;
    Ok(())
}

fn decrypt_file(input: &Path, output: &Path, password: &[u8]) -> Result<()> {
    let sealed = std::fs::read(input).context("reading container")?;
    let plaintext = open_sealed(&sealed, password)?;
    std::fs::write(output, plaintext).context("writing output")?;
    Ok(())
}

// ----- archiving -------------------------------------------------------

/// Deflate archive with a single entry named after the original file.
pub(crate) fn zip_single_entry(input: &Path, output: &Path, entry_name: &str) -> Result<()> {
    let mut writer = ZipWriter::new(File::create(output).context("creating archive")?);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    writer
        .start_file(entry_name, options)
        .context("starting archive entry")?;
    let mut reader = File::open(input).context("opening input")?;
    io::copy(&mut reader, &mut writer).context("compressing input")?;
    writer.finish().context("finalizing archive")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn seal_then_open_restores_the_plaintext() {
        let plaintext = b"the quick brown fox".to_vec();
        let sealed = seal(&plaintext, b"correct horse").expect("seal");
        assert_ne!(sealed, plaintext);
        let opened = open_sealed(&sealed, b"correct horse").expect("open");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_password_fails_to_open() {
        let sealed = seal(b"secret", b"password-a").expect("seal");
        assert!(open_sealed(&sealed, b"password-b").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let mut sealed = seal(b"secret", b"pw").expect("seal");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open_sealed(&sealed, b"pw").is_err());
    }

    #[test]
    fn container_starts_with_magic_and_version() {
        let sealed = seal(b"x", b"pw").expect("seal");
        assert_eq!(&sealed[..4], MAGIC);
        assert_eq!(sealed[4], FORMAT_VERSION);
        assert!(sealed.len() > HEADER_LEN);
    }

    #[test]
    fn truncated_or_foreign_data_is_rejected() {
        assert!(open_sealed(b"", b"pw").is_err());
        assert!(open_sealed(b"PK\x03\x04stuff-that-is-not-ours", b"pw").is_err());
    }

    #[test]
    fn encrypt_decrypt_round_trip_on_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.bin");
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        std::fs::write(&input, &payload).expect("write input");

        let sealed = dir.path().join("sealed.enc");
        encrypt_file(&input, &sealed, b"hunter2").expect("encrypt");
        let opened = dir.path().join("opened.bin");
        decrypt_file(&sealed, &opened, b"hunter2").expect("decrypt");

        assert_eq!(std::fs::read(&opened).expect("read output"), payload);
    }

    #[test]
    fn scan_report_parsing_extracts_the_signature() {
        assert_eq!(
            parse_scan_report("/tmp/virus.bin: Eicar-Test-Signature FOUND\n"),
            Some("Eicar-Test-Signature".to_string())
        );
        assert_eq!(parse_scan_report("/tmp/ok.bin: OK\n"), None);
        assert_eq!(parse_scan_report(""), None);
    }

    #[test]
    fn zip_archive_contains_one_entry_named_after_the_original() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.txt");
        std::fs::write(&input, b"compress me, repeat me, compress me").expect("write");

        let archive_path = dir.path().join("out.zip");
        zip_single_entry(&input, &archive_path, "report.txt").expect("zip");

        let mut archive =
            zip::ZipArchive::new(File::open(&archive_path).expect("open")).expect("read archive");
        assert_eq!(archive.len(), 1);
        let mut entry = archive.by_index(0).expect("entry");
        assert_eq!(entry.name(), "report.txt");
        let mut contents = String::new();
        entry.read_to_string(&mut contents).expect("read entry");
        assert_eq!(contents, "compress me, repeat me, compress me");
    }
}
