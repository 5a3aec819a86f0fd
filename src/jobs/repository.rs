use crate::error::{EngineError, Result};
use crate::jobs::model::{
    Batch, BatchState, CommitRow, CommitStatus, CommitTarget, Control, ImageResult, ImageRow, Job,
    JobConfig, JobStatus, BATCH_WIDTH,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

// ── Private helpers ───────────────────────────────────────────────────────────

fn collect_rows<T, F>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    f: F,
) -> rusqlite::Result<Vec<T>>
where
    F: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, f)?;
    rows.collect()
}

fn row_to_batch(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, i64, i64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn batch_from_tuple(t: (i64, i64, i64, i64, String)) -> Result<Batch> {
    let (batch_id, job_id, start_idx, end_idx, state) = t;
    let state = BatchState::parse(&state)
        .ok_or_else(|| EngineError::Db(rusqlite::Error::InvalidQuery))?;
    Ok(Batch {
        batch_id,
        job_id,
        start_idx,
        end_idx,
        state,
    })
}

fn row_to_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, i64, Option<i64>, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn commit_from_tuple(t: (i64, i64, i64, Option<i64>, String, String, String)) -> Result<CommitRow> {
    let (commit_id, batch_id, image_id, person_id, output_filename, output_path, status) = t;
    let status = CommitStatus::parse(&status)
        .ok_or_else(|| EngineError::Db(rusqlite::Error::InvalidQuery))?;
    Ok(CommitRow {
        commit_id,
        batch_id,
        image_id,
        person_id,
        output_filename,
        output_path: PathBuf::from(output_path),
        status,
    })
}

const COMMIT_COLUMNS: &str =
    "commit_id, batch_id, image_id, person_id, output_filename, output_path, status";

// ── Job config & control ──────────────────────────────────────────────────────

/// Read the singleton job configuration. Returns None when the row is absent
/// or lacks the mandatory roots — the worker then refuses to start.
pub fn read_config(conn: &Connection) -> Result<Option<JobConfig>> {
    let row: Option<(Option<String>, Option<String>, Option<String>, i64, Option<String>)> = conn
        .query_row(
            "SELECT source_root, output_root, selected_person_ids, group_mode, group_folder_name
               FROM job_config WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .optional()?;

    let Some((source_root, output_root, selected, group_mode, group_folder_name)) = row else {
        return Ok(None);
    };
    let (Some(source_root), Some(output_root)) = (source_root, output_root) else {
        return Ok(None);
    };

    let selected_person_ids = match selected {
        Some(text) => Some(serde_json::from_str::<Vec<i64>>(&text)?),
        None => None,
    };

    Ok(Some(JobConfig {
        source_root: PathBuf::from(source_root),
        output_root: PathBuf::from(output_root),
        selected_person_ids,
        group_mode: group_mode != 0,
        group_folder_name,
    }))
}

/// Write the singleton config row. Used by tests and operator tooling; the
/// engine itself only reads it.
pub fn write_config(conn: &Connection, config: &JobConfig) -> Result<()> {
    let selected = config
        .selected_person_ids
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO job_config (id, source_root, output_root, selected_person_ids, group_mode, group_folder_name, control)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, 'run')
         ON CONFLICT(id) DO UPDATE SET
             source_root = excluded.source_root,
             output_root = excluded.output_root,
             selected_person_ids = excluded.selected_person_ids,
             group_mode = excluded.group_mode,
             group_folder_name = excluded.group_folder_name",
        params![
            config.source_root.to_string_lossy(),
            config.output_root.to_string_lossy(),
            selected,
            config.group_mode as i64,
            config.group_folder_name,
        ],
    )?;
    Ok(())
}

/// Current control flag; a missing config row reads as `run`.
pub fn read_control(conn: &Connection) -> Result<Control> {
    let control: Option<String> = conn
        .query_row("SELECT control FROM job_config WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match control {
        Some(s) => Control::parse(&s).ok_or_else(|| {
            EngineError::Config(format!("job_config.control holds unknown value {:?}", s))
        }),
        None => Ok(Control::Run),
    }
}

pub fn set_control(conn: &Connection, control: Control) -> Result<()> {
    conn.execute(
        "UPDATE job_config SET control = ?1 WHERE id = 1",
        params![control.as_str()],
    )?;
    Ok(())
}

// ── Jobs ──────────────────────────────────────────────────────────────────────

pub fn create_job(conn: &Connection, config: &JobConfig) -> Result<Job> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO jobs (source_root, output_root, status, created_at)
         VALUES (?1, ?2, 'created', ?3)",
        params![
            config.source_root.to_string_lossy(),
            config.output_root.to_string_lossy(),
            now
        ],
    )?;
    let job_id = conn.last_insert_rowid();
    tracing::info!("jobs: created job {}", job_id);
    Ok(Job {
        job_id,
        source_root: config.source_root.clone(),
        output_root: config.output_root.clone(),
        total_images: 0,
        processed_images: 0,
        status: JobStatus::Created,
    })
}

/// The most recent non-terminal job, if any. There is at most one by
/// construction: the worker refuses to create a new job while one exists.
pub fn find_resumable_job(conn: &Connection) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            "SELECT job_id, source_root, output_root, total_images, processed_images, status
               FROM jobs WHERE status IN ('created', 'running')
              ORDER BY job_id DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((job_id, source_root, output_root, total_images, processed_images, status)) => {
            let status = JobStatus::parse(&status).ok_or_else(|| {
                EngineError::Config(format!("job {} has unknown status {:?}", job_id, status))
            })?;
            Ok(Some(Job {
                job_id,
                source_root: PathBuf::from(source_root),
                output_root: PathBuf::from(output_root),
                total_images,
                processed_images,
                status,
            }))
        }
        None => Ok(None),
    }
}

/// The most recent job row regardless of status.
pub fn latest_job(conn: &Connection) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            "SELECT job_id, source_root, output_root, total_images, processed_images, status
               FROM jobs ORDER BY job_id DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((job_id, source_root, output_root, total_images, processed_images, status)) => {
            let status = JobStatus::parse(&status).ok_or_else(|| {
                EngineError::Config(format!("job {} has unknown status {:?}", job_id, status))
            })?;
            Ok(Some(Job {
                job_id,
                source_root: PathBuf::from(source_root),
                output_root: PathBuf::from(output_root),
                total_images,
                processed_images,
                status,
            }))
        }
        None => Ok(None),
    }
}

pub fn mark_job_running(conn: &Connection, job_id: i64) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE jobs SET status = 'running', started_at = COALESCE(started_at, ?1)
         WHERE job_id = ?2",
        params![now, job_id],
    )?;
    Ok(())
}

pub fn set_job_status(conn: &Connection, job_id: i64, status: JobStatus) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    if status.is_terminal() {
        conn.execute(
            "UPDATE jobs SET status = ?1, completed_at = ?2 WHERE job_id = ?3",
            params![status.as_str(), now, job_id],
        )?;
    } else {
        conn.execute(
            "UPDATE jobs SET status = ?1 WHERE job_id = ?2",
            params![status.as_str(), job_id],
        )?;
    }
    tracing::info!("jobs: job {} -> {}", job_id, status.as_str());
    Ok(())
}

pub fn job_counters(conn: &Connection, job_id: i64) -> Result<(i64, i64)> {
    let counters = conn.query_row(
        "SELECT total_images, processed_images FROM jobs WHERE job_id = ?1",
        params![job_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(counters)
}

// ── Image inventory & batches ─────────────────────────────────────────────────

/// One discovered file ready for insertion.
#[derive(Debug, Clone)]
pub struct IngestRecord {
    pub source_path: PathBuf,
    pub filename: String,
    pub extension: String,
    pub sha256: String,
    pub ordering_idx: i64,
}

/// Insert the discovered inventory and stamp `jobs.total_images`, skipping
/// `(job_id, source_path)` rows a prior interrupted ingest already wrote.
/// One transaction: a crash mid-ingest leaves either nothing or everything.
pub fn record_inventory(
    conn: &mut Connection,
    job_id: i64,
    records: &[IngestRecord],
) -> Result<i64> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO images (job_id, source_path, filename, extension, sha256, ordering_idx)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for r in records {
            stmt.execute(params![
                job_id,
                r.source_path.to_string_lossy(),
                r.filename,
                r.extension,
                r.sha256,
                r.ordering_idx,
            ])?;
        }
    }
    let total: i64 = tx.query_row(
        "SELECT COUNT(*) FROM images WHERE job_id = ?1",
        params![job_id],
        |row| row.get(0),
    )?;
    tx.execute(
        "UPDATE jobs SET total_images = ?1 WHERE job_id = ?2",
        params![total, job_id],
    )?;
    tx.commit()?;
    Ok(total)
}

/// Partition `[0, total_images)` into PENDING batches of BATCH_WIDTH.
/// No-op when the job already has batches (resume path).
pub fn create_batches(conn: &mut Connection, job_id: i64, total_images: i64) -> Result<()> {
    let existing: i64 = conn.query_row(
        "SELECT COUNT(*) FROM batches WHERE job_id = ?1",
        params![job_id],
        |row| row.get(0),
    )?;
    if existing > 0 {
        return Ok(());
    }

    let tx = conn.transaction()?;
    let now = chrono::Utc::now().to_rfc3339();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO batches (job_id, start_idx, end_idx, state, created_at)
             VALUES (?1, ?2, ?3, 'PENDING', ?4)",
        )?;
        let mut start = 0i64;
        while start < total_images {
            let end = (start + BATCH_WIDTH - 1).min(total_images - 1);
            stmt.execute(params![job_id, start, end, now])?;
            start = end + 1;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn images_for_range(
    conn: &Connection,
    job_id: i64,
    start_idx: i64,
    end_idx: i64,
) -> Result<Vec<ImageRow>> {
    let rows = collect_rows(
        conn,
        "SELECT image_id, job_id, source_path, filename, extension, sha256, ordering_idx
           FROM images
          WHERE job_id = ?1 AND ordering_idx BETWEEN ?2 AND ?3
          ORDER BY ordering_idx ASC",
        params![job_id, start_idx, end_idx],
        |row| {
            Ok(ImageRow {
                image_id: row.get(0)?,
                job_id: row.get(1)?,
                source_path: PathBuf::from(row.get::<_, String>(2)?),
                filename: row.get(3)?,
                extension: row.get(4)?,
                sha256: row.get(5)?,
                ordering_idx: row.get(6)?,
            })
        },
    )?;
    Ok(rows)
}

pub fn image_by_id(conn: &Connection, image_id: i64) -> Result<Option<ImageRow>> {
    let row = conn
        .query_row(
            "SELECT image_id, job_id, source_path, filename, extension, sha256, ordering_idx
               FROM images WHERE image_id = ?1",
            params![image_id],
            |row| {
                Ok(ImageRow {
                    image_id: row.get(0)?,
                    job_id: row.get(1)?,
                    source_path: PathBuf::from(row.get::<_, String>(2)?),
                    filename: row.get(3)?,
                    extension: row.get(4)?,
                    sha256: row.get(5)?,
                    ordering_idx: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Lease the lowest PENDING batch: one transaction flips it to PROCESSING and
/// stamps started_at. Returns None when no PENDING batch remains.
pub fn lease_next_pending(conn: &mut Connection, job_id: i64) -> Result<Option<Batch>> {
    let tx = conn.transaction()?;
    let row = tx
        .query_row(
            "SELECT batch_id, job_id, start_idx, end_idx, state
               FROM batches
              WHERE job_id = ?1 AND state = 'PENDING'
              ORDER BY batch_id ASC LIMIT 1",
            params![job_id],
            row_to_batch,
        )
        .optional()?;

    let Some(tuple) = row else {
        return Ok(None);
    };
    let mut batch = batch_from_tuple(tuple)?;

    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE batches SET state = 'PROCESSING', started_at = ?1 WHERE batch_id = ?2",
        params![now, batch.batch_id],
    )?;
    tx.commit()?;

    batch.state = BatchState::Processing;
    tracing::info!(
        "batch {}: leased ({}..={})",
        batch.batch_id,
        batch.start_idx,
        batch.end_idx
    );
    Ok(Some(batch))
}

pub fn batches_in_state(conn: &Connection, job_id: i64, state: BatchState) -> Result<Vec<Batch>> {
    let rows = collect_rows(
        conn,
        "SELECT batch_id, job_id, start_idx, end_idx, state
           FROM batches WHERE job_id = ?1 AND state = ?2
          ORDER BY batch_id ASC",
        params![job_id, state.as_str()],
        row_to_batch,
    )?;
    rows.into_iter().map(batch_from_tuple).collect()
}

pub fn count_unfinished_batches(conn: &Connection, job_id: i64) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM batches WHERE job_id = ?1 AND state != 'COMMITTED'",
        params![job_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Roll a PROCESSING batch back to PENDING and drop its image_results, so a
/// replay starts from a clean slate.
pub fn reset_batch_to_pending(conn: &mut Connection, batch_id: i64) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM image_results WHERE batch_id = ?1",
        params![batch_id],
    )?;
    tx.execute(
        "UPDATE batches SET state = 'PENDING', started_at = NULL WHERE batch_id = ?1",
        params![batch_id],
    )?;
    tx.commit()?;
    tracing::info!("batch {}: reset to PENDING", batch_id);
    Ok(())
}

/// Flip a batch to COMMITTING and insert its pending commit-log rows in the
/// same transaction. Existing rows are reused (idempotent on replay).
pub fn begin_committing(
    conn: &mut Connection,
    batch_id: i64,
    targets: &[CommitTarget],
) -> Result<()> {
    let tx = conn.transaction()?;
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE batches SET state = 'COMMITTING' WHERE batch_id = ?1",
        params![batch_id],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO commit_log
                 (batch_id, image_id, person_id, output_filename, output_path, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
        )?;
        for t in targets {
            stmt.execute(params![
                batch_id,
                t.image_id,
                t.person_id,
                t.output_filename,
                t.output_path.to_string_lossy(),
                now,
            ])?;
        }
    }
    tx.commit()?;
    tracing::info!(
        "batch {}: COMMITTING with {} commit rows",
        batch_id,
        targets.len()
    );
    Ok(())
}

/// Mark a batch COMMITTED and advance the job counter by the batch width,
/// in one transaction.
pub fn mark_batch_committed(conn: &mut Connection, batch: &Batch) -> Result<()> {
    let tx = conn.transaction()?;
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE batches SET state = 'COMMITTED', committed_at = ?1 WHERE batch_id = ?2",
        params![now, batch.batch_id],
    )?;
    tx.execute(
        "UPDATE jobs SET processed_images = processed_images + ?1 WHERE job_id = ?2",
        params![batch.width(), batch.job_id],
    )?;
    tx.commit()?;
    tracing::info!("batch {}: COMMITTED (+{} images)", batch.batch_id, batch.width());
    Ok(())
}

// ── Image results ─────────────────────────────────────────────────────────────

pub fn upsert_image_result(conn: &Connection, result: &ImageResult) -> Result<()> {
    let matched = serde_json::to_string(&result.matched_person_ids)?;
    conn.execute(
        "INSERT INTO image_results (image_id, batch_id, face_count, matched_count, unknown_count, matched_person_ids)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(image_id) DO UPDATE SET
             batch_id = excluded.batch_id,
             face_count = excluded.face_count,
             matched_count = excluded.matched_count,
             unknown_count = excluded.unknown_count,
             matched_person_ids = excluded.matched_person_ids",
        params![
            result.image_id,
            result.batch_id,
            result.face_count,
            result.matched_count,
            result.unknown_count,
            matched,
        ],
    )?;
    Ok(())
}

pub fn image_results_for_batch(conn: &Connection, batch_id: i64) -> Result<Vec<ImageResult>> {
    let rows = collect_rows(
        conn,
        "SELECT image_id, batch_id, face_count, matched_count, unknown_count, matched_person_ids
           FROM image_results WHERE batch_id = ?1 ORDER BY image_id ASC",
        params![batch_id],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        },
    )?;

    let mut out = Vec::new();
    for (image_id, batch_id, face_count, matched_count, unknown_count, matched) in rows {
        out.push(ImageResult {
            image_id,
            batch_id,
            face_count,
            matched_count,
            unknown_count,
            matched_person_ids: serde_json::from_str(&matched)?,
        });
    }
    Ok(out)
}

// ── Commit log ────────────────────────────────────────────────────────────────

pub fn rows_for_batch(conn: &Connection, batch_id: i64) -> Result<Vec<CommitRow>> {
    let rows = collect_rows(
        conn,
        &format!(
            "SELECT {} FROM commit_log WHERE batch_id = ?1 ORDER BY commit_id ASC",
            COMMIT_COLUMNS
        ),
        params![batch_id],
        row_to_commit,
    )?;
    rows.into_iter().map(commit_from_tuple).collect()
}

pub fn unverified_rows(conn: &Connection, batch_id: i64) -> Result<Vec<CommitRow>> {
    let rows = collect_rows(
        conn,
        &format!(
            "SELECT {} FROM commit_log
              WHERE batch_id = ?1 AND status != 'verified'
              ORDER BY commit_id ASC",
            COMMIT_COLUMNS
        ),
        params![batch_id],
        row_to_commit,
    )?;
    rows.into_iter().map(commit_from_tuple).collect()
}

pub fn advance_commit_row(conn: &Connection, commit_id: i64, status: CommitStatus) -> Result<()> {
    if status == CommitStatus::Verified {
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE commit_log SET status = 'verified', verified_at = ?1 WHERE commit_id = ?2",
            params![now, commit_id],
        )?;
    } else {
        conn.execute(
            "UPDATE commit_log SET status = ?1 WHERE commit_id = ?2",
            params![status.as_str(), commit_id],
        )?;
    }
    Ok(())
}

pub fn commit_rows_for_image(conn: &Connection, image_id: i64) -> Result<Vec<CommitRow>> {
    let rows = collect_rows(
        conn,
        &format!(
            "SELECT {} FROM commit_log WHERE image_id = ?1 ORDER BY commit_id ASC",
            COMMIT_COLUMNS
        ),
        params![image_id],
        row_to_commit,
    )?;
    rows.into_iter().map(commit_from_tuple).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn test_config() -> JobConfig {
        JobConfig {
            source_root: PathBuf::from("/src"),
            output_root: PathBuf::from("/out"),
            selected_person_ids: None,
            group_mode: false,
            group_folder_name: None,
        }
    }

    fn seed_inventory(conn: &mut Connection, job_id: i64, n: i64) {
        let records: Vec<IngestRecord> = (0..n)
            .map(|i| IngestRecord {
                source_path: PathBuf::from(format!("/src/{:04}.jpg", i)),
                filename: format!("{:04}.jpg", i),
                extension: ".jpg".into(),
                sha256: format!("{:064x}", i),
                ordering_idx: i,
            })
            .collect();
        record_inventory(conn, job_id, &records).unwrap();
    }

    #[test]
    fn test_config_round_trip() {
        let conn = setup();
        assert!(read_config(&conn).unwrap().is_none(), "no row yet");

        let config = JobConfig {
            selected_person_ids: Some(vec![3, 1, 2]),
            group_mode: true,
            group_folder_name: Some("TeamPhoto".into()),
            ..test_config()
        };
        write_config(&conn, &config).unwrap();

        let loaded = read_config(&conn).unwrap().expect("config must load");
        assert_eq!(loaded.source_root, PathBuf::from("/src"));
        assert_eq!(loaded.selected_person_ids, Some(vec![3, 1, 2]));
        assert!(loaded.group_mode);
        assert_eq!(loaded.group_folder_name.as_deref(), Some("TeamPhoto"));
    }

    #[test]
    fn test_control_defaults_to_run() {
        let conn = setup();
        assert_eq!(read_control(&conn).unwrap(), Control::Run);

        write_config(&conn, &test_config()).unwrap();
        set_control(&conn, Control::Stop).unwrap();
        assert_eq!(read_control(&conn).unwrap(), Control::Stop);
    }

    #[test]
    fn test_create_and_resume_job() {
        let conn = setup();
        let job = create_job(&conn, &test_config()).unwrap();
        assert_eq!(job.status, JobStatus::Created);

        let resumed = find_resumable_job(&conn).unwrap().expect("job resumable");
        assert_eq!(resumed.job_id, job.job_id);

        set_job_status(&conn, job.job_id, JobStatus::Completed).unwrap();
        assert!(find_resumable_job(&conn).unwrap().is_none());
    }

    #[test]
    fn test_record_inventory_is_idempotent() {
        let mut conn = setup();
        let job = create_job(&conn, &test_config()).unwrap();
        seed_inventory(&mut conn, job.job_id, 7);
        seed_inventory(&mut conn, job.job_id, 7);

        let (total, _) = job_counters(&conn, job.job_id).unwrap();
        assert_eq!(total, 7, "re-ingest must not duplicate images");
    }

    #[test]
    fn test_create_batches_partitions_without_gaps() {
        let mut conn = setup();
        let job = create_job(&conn, &test_config()).unwrap();
        seed_inventory(&mut conn, job.job_id, 120);
        create_batches(&mut conn, job.job_id, 120).unwrap();

        let pending = batches_in_state(&conn, job.job_id, BatchState::Pending).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!((pending[0].start_idx, pending[0].end_idx), (0, 49));
        assert_eq!((pending[1].start_idx, pending[1].end_idx), (50, 99));
        assert_eq!((pending[2].start_idx, pending[2].end_idx), (100, 119));
        assert_eq!(pending[2].width(), 20, "last batch may be shorter");

        // Second call is a no-op.
        create_batches(&mut conn, job.job_id, 120).unwrap();
        let again = batches_in_state(&conn, job.job_id, BatchState::Pending).unwrap();
        assert_eq!(again.len(), 3);
    }

    #[test]
    fn test_lease_follows_batch_order() {
        let mut conn = setup();
        let job = create_job(&conn, &test_config()).unwrap();
        seed_inventory(&mut conn, job.job_id, 100);
        create_batches(&mut conn, job.job_id, 100).unwrap();

        let first = lease_next_pending(&mut conn, job.job_id).unwrap().unwrap();
        assert_eq!(first.start_idx, 0);
        assert_eq!(first.state, BatchState::Processing);

        let second = lease_next_pending(&mut conn, job.job_id).unwrap().unwrap();
        assert_eq!(second.start_idx, 50);

        assert!(lease_next_pending(&mut conn, job.job_id).unwrap().is_none());
    }

    #[test]
    fn test_reset_batch_drops_image_results() {
        let mut conn = setup();
        let job = create_job(&conn, &test_config()).unwrap();
        seed_inventory(&mut conn, job.job_id, 10);
        create_batches(&mut conn, job.job_id, 10).unwrap();
        let batch = lease_next_pending(&mut conn, job.job_id).unwrap().unwrap();

        let image = images_for_range(&conn, job.job_id, 0, 0).unwrap().remove(0);
        upsert_image_result(
            &conn,
            &ImageResult {
                image_id: image.image_id,
                batch_id: batch.batch_id,
                face_count: 2,
                matched_count: 1,
                unknown_count: 1,
                matched_person_ids: vec![1],
            },
        )
        .unwrap();
        assert_eq!(image_results_for_batch(&conn, batch.batch_id).unwrap().len(), 1);

        reset_batch_to_pending(&mut conn, batch.batch_id).unwrap();
        assert!(image_results_for_batch(&conn, batch.batch_id).unwrap().is_empty());
        let pending = batches_in_state(&conn, job.job_id, BatchState::Pending).unwrap();
        assert_eq!(pending[0].batch_id, batch.batch_id);
    }

    #[test]
    fn test_begin_committing_reuses_existing_rows() {
        let mut conn = setup();
        let job = create_job(&conn, &test_config()).unwrap();
        seed_inventory(&mut conn, job.job_id, 1);
        create_batches(&mut conn, job.job_id, 1).unwrap();
        let batch = lease_next_pending(&mut conn, job.job_id).unwrap().unwrap();
        let image = images_for_range(&conn, job.job_id, 0, 0).unwrap().remove(0);

        conn.execute(
            "INSERT INTO persons (person_id, display_name, output_folder_rel, created_at, updated_at)
             VALUES (1, 'Alice', 'Alice', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let targets = vec![CommitTarget {
            image_id: image.image_id,
            person_id: Some(1),
            output_filename: "000000_0000000000ab.jpg".into(),
            output_path: PathBuf::from("/out/Alice/000000_0000000000ab.jpg"),
        }];

        begin_committing(&mut conn, batch.batch_id, &targets).unwrap();
        begin_committing(&mut conn, batch.batch_id, &targets).unwrap();

        let rows = rows_for_batch(&conn, batch.batch_id).unwrap();
        assert_eq!(rows.len(), 1, "replayed transition must not duplicate rows");
        assert_eq!(rows[0].status, CommitStatus::Pending);
    }

    #[test]
    fn test_advance_commit_row_stamps_verified_at() {
        let mut conn = setup();
        let job = create_job(&conn, &test_config()).unwrap();
        seed_inventory(&mut conn, job.job_id, 1);
        create_batches(&mut conn, job.job_id, 1).unwrap();
        let batch = lease_next_pending(&mut conn, job.job_id).unwrap().unwrap();
        let image = images_for_range(&conn, job.job_id, 0, 0).unwrap().remove(0);

        begin_committing(
            &mut conn,
            batch.batch_id,
            &[CommitTarget {
                image_id: image.image_id,
                person_id: None,
                output_filename: "f.jpg".into(),
                output_path: PathBuf::from("/out/G/f.jpg"),
            }],
        )
        .unwrap();

        let row = &rows_for_batch(&conn, batch.batch_id).unwrap()[0];
        advance_commit_row(&conn, row.commit_id, CommitStatus::Written).unwrap();
        advance_commit_row(&conn, row.commit_id, CommitStatus::Verified).unwrap();

        let verified_at: Option<String> = conn
            .query_row(
                "SELECT verified_at FROM commit_log WHERE commit_id = ?1",
                params![row.commit_id],
                |r| r.get(0),
            )
            .unwrap();
        assert!(verified_at.is_some());
        assert!(unverified_rows(&conn, batch.batch_id).unwrap().is_empty());
    }

    #[test]
    fn test_mark_batch_committed_bumps_counter() {
        let mut conn = setup();
        let job = create_job(&conn, &test_config()).unwrap();
        seed_inventory(&mut conn, job.job_id, 60);
        create_batches(&mut conn, job.job_id, 60).unwrap();
        let batch = lease_next_pending(&mut conn, job.job_id).unwrap().unwrap();

        mark_batch_committed(&mut conn, &batch).unwrap();
        let (_, processed) = job_counters(&conn, job.job_id).unwrap();
        assert_eq!(processed, 50);
        assert_eq!(count_unfinished_batches(&conn, job.job_id).unwrap(), 1);
    }
}
