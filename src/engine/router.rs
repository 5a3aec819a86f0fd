use crate::engine::ingest::sha256_file;
use crate::error::Result;
use crate::jobs::model::{CommitRow, CommitStatus};
use crate::jobs::repository as jobs;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Transient filesystem errors are retried this many times, 1 s apart.
pub const COPY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Deterministic output name: `<ordering_idx:06>_<sha256[:12]>.jpg`.
pub fn output_filename(ordering_idx: i64, sha256: &str) -> String {
    let prefix = &sha256[..sha256.len().min(12)];
    format!("{:06}_{}.jpg", ordering_idx, prefix)
}

/// What happened to a single commit-log row.
#[derive(Debug, PartialEq, Eq)]
pub enum RowOutcome {
    Verified,
    /// Retries exhausted; the row stays at its current status.
    Failed(String),
}

/// Drive one commit-log row from its current status to `verified`:
/// copy the staged artifact to the destination (atomically, never
/// overwriting differing content), fsync, mark `written`, verify on disk,
/// mark `verified`. Already-written rows skip straight to verification.
pub fn execute_row(conn: &Connection, row: &CommitRow, staged: &Path) -> Result<RowOutcome> {
    if row.status == CommitStatus::Verified {
        return Ok(RowOutcome::Verified);
    }

    if row.status == CommitStatus::Pending {
        match copy_with_retries(staged, &row.output_path) {
            Ok(()) => {}
            Err(reason) => {
                tracing::warn!("router: {}", reason);
                return Ok(RowOutcome::Failed(reason));
            }
        }
        jobs::advance_commit_row(conn, row.commit_id, CommitStatus::Written)?;
    }

    if verify_destination(&row.output_path) {
        jobs::advance_commit_row(conn, row.commit_id, CommitStatus::Verified)?;
        tracing::debug!("router: verified {:?}", row.output_path);
        Ok(RowOutcome::Verified)
    } else {
        let reason = format!("destination {:?} failed verification", row.output_path);
        tracing::warn!("router: {}", reason);
        Ok(RowOutcome::Failed(reason))
    }
}

fn copy_with_retries(staged: &Path, dest: &Path) -> std::result::Result<(), String> {
    let mut last_err = String::new();
    for attempt in 1..=COPY_ATTEMPTS {
        match copy_once(staged, dest) {
            Ok(()) => return Ok(()),
            Err(CopyError::DiffersAtDestination) => {
                // Output is append-only; differing content is never replaced
                // and retrying cannot help.
                return Err(format!(
                    "destination {:?} exists with different content",
                    dest
                ));
            }
            Err(CopyError::Io(e)) => {
                last_err = format!("copy {:?} -> {:?} attempt {}: {}", staged, dest, attempt, e);
                tracing::warn!("router: {}", last_err);
                if attempt < COPY_ATTEMPTS {
                    std::thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }
    Err(last_err)
}

enum CopyError {
    Io(std::io::Error),
    DiffersAtDestination,
}

impl From<std::io::Error> for CopyError {
    fn from(e: std::io::Error) -> Self {
        CopyError::Io(e)
    }
}

/// Copy `staged` to `dest` so the destination is only ever absent or
/// complete: write a same-directory `.partial` file, fsync it, rename into
/// place, then fsync the directory. An existing identical destination is
/// accepted as already copied.
fn copy_once(staged: &Path, dest: &Path) -> std::result::Result<(), CopyError> {
    if dest.exists() {
        if files_identical(staged, dest)? {
            tracing::debug!("router: {:?} already present, skipping copy", dest);
            return Ok(());
        }
        return Err(CopyError::DiffersAtDestination);
    }

    let parent = dest
        .parent()
        .ok_or_else(|| std::io::Error::other("destination has no parent directory"))?;
    std::fs::create_dir_all(parent)?;

    let partial = partial_path(dest);
    std::fs::copy(staged, &partial)?;
    let file = std::fs::File::open(&partial)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&partial, dest)?;
    // Make the rename durable.
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

pub fn partial_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".partial");
    dest.with_file_name(name)
}

/// Remove a stale `.partial` leftover for a row about to be retried.
/// Final output files are never touched.
pub fn clean_partial(dest: &Path) {
    let partial = partial_path(dest);
    if partial.exists() {
        if let Err(e) = std::fs::remove_file(&partial) {
            tracing::warn!("router: cannot remove stale partial {:?}: {}", partial, e);
        }
    }
}

fn files_identical(a: &Path, b: &Path) -> std::io::Result<bool> {
    let meta_a = std::fs::metadata(a)?;
    let meta_b = std::fs::metadata(b)?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    Ok(sha256_file(a)? == sha256_file(b)?)
}

/// Post-copy verification: the destination exists and is non-empty.
pub fn verify_destination(dest: &Path) -> bool {
    match std::fs::metadata(dest) {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Resume-time evidence for one row: does the destination hold a complete
/// file, and is the staged artifact still on disk?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowEvidence {
    pub destination_ok: bool,
    pub staged_present: bool,
}

pub fn gather_evidence(row: &CommitRow, staged: &Path) -> RowEvidence {
    RowEvidence {
        destination_ok: verify_destination(&row.output_path),
        staged_present: staged.is_file(),
    }
}
