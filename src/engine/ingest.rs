use crate::engine::util::to_hex;
use crate::error::Result;
use crate::jobs::model::ImageKind;
use crate::jobs::repository::{self, IngestRecord};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const RAW_EXTENSIONS: &[&str] = &["arw"];
const JPEG_EXTENSIONS: &[&str] = &["jpg", "jpeg"];

const HASH_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub kind: ImageKind,
}

/// Recursively scan `source_root` and return all supported image files.
/// Symlinks are skipped. Permission errors are logged and collected.
/// Returns (files, error_log); files are NOT yet ordered.
pub fn scan_source(source_root: &Path) -> (Vec<DiscoveredFile>, Vec<String>) {
    let mut files = Vec::new();
    let mut errors = Vec::new();

    for entry in WalkDir::new(source_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !e.path_is_symlink())
    {
        match entry {
            Err(e) => {
                let msg = format!("ingest: scan error: {}", e);
                tracing::warn!("{}", msg);
                errors.push(msg);
            }
            Ok(entry) => {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(kind) = detect_kind(entry.path()) {
                    files.push(DiscoveredFile {
                        path: entry.path().to_path_buf(),
                        kind,
                    });
                }
            }
        }
    }

    tracing::debug!(
        "ingest: scan of {:?}: {} files, {} errors",
        source_root,
        files.len(),
        errors.len()
    );
    (files, errors)
}

/// Detect the image kind from the file extension (case-insensitive).
/// Returns None for unsupported extensions.
pub fn detect_kind(path: &Path) -> Option<ImageKind> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())?;

    if JPEG_EXTENSIONS.contains(&ext.as_str()) {
        Some(ImageKind::Jpeg)
    } else if RAW_EXTENSIONS.contains(&ext.as_str()) {
        Some(ImageKind::Raw)
    } else {
        None
    }
}

/// Streaming SHA-256 of a file, 1 MiB at a time, rendered as lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

/// Normalise a discovered path for ordering: absolute, without `.`/`..`
/// segments. Falls back to the raw path when the current dir is unavailable.
fn normalize_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Stats reported by a completed ingest.
#[derive(Debug, Default, Clone)]
pub struct IngestStats {
    pub total_files: usize,
    pub hashed: usize,
    pub errors: usize,
    /// capped at 100 entries
    pub error_log: Vec<String>,
}

fn log_error(stats: &mut IngestStats, msg: String) {
    stats.errors += 1;
    if stats.error_log.len() < 100 {
        stats.error_log.push(msg);
    }
}

/// One-shot discovery for a job: walk, sort byte-wise on the normalised
/// absolute path, assign dense ordering indices, hash, and persist the
/// inventory. Files already recorded by an interrupted prior ingest are
/// skipped at the insert layer, so replays assign identical indices.
/// Returns (total_images, stats).
pub fn ingest_inventory(
    conn: &mut Connection,
    job_id: i64,
    source_root: &Path,
) -> Result<(i64, IngestStats)> {
    let mut stats = IngestStats::default();

    tracing::info!("ingest: scanning {:?} for job {}", source_root, job_id);
    let (files, scan_errors) = scan_source(source_root);
    stats.total_files = files.len();
    for e in scan_errors {
        log_error(&mut stats, e);
    }

    // Deterministic listing: byte-wise order of the normalised absolute path.
    let mut normalized: Vec<PathBuf> = files.into_iter().map(|f| normalize_path(&f.path)).collect();
    normalized.sort_by(|a, b| a.as_os_str().as_encoded_bytes().cmp(b.as_os_str().as_encoded_bytes()));

    let mut records = Vec::with_capacity(normalized.len());
    for (idx, path) in normalized.iter().enumerate() {
        let sha256 = match sha256_file(path) {
            Ok(h) => h,
            Err(e) => {
                let msg = format!("ingest: cannot hash {:?}: {}", path, e);
                tracing::warn!("{}", msg);
                log_error(&mut stats, msg);
                // Unreadable now, unreadable later: drop it from the inventory.
                continue;
            }
        };
        stats.hashed += 1;

        let filename = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();

        records.push(IngestRecord {
            source_path: path.clone(),
            filename,
            extension,
            sha256,
            ordering_idx: idx as i64,
        });
    }

    // A hash failure above leaves a hole in the index sequence; re-densify so
    // ordering_idx stays 0-based and gap-free.
    if records.len() != normalized.len() {
        for (idx, r) in records.iter_mut().enumerate() {
            r.ordering_idx = idx as i64;
        }
    }

    let total = repository::record_inventory(conn, job_id, &records)?;
    tracing::info!(
        "ingest: complete for job {} -- {} images, {} errors",
        job_id,
        total,
        stats.errors
    );
    Ok((total, stats))
}
