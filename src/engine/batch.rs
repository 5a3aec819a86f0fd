use crate::engine::compress;
use crate::engine::context::EngineContext;
use crate::engine::decode::{self, DecodeOutcome, TempScope};
use crate::engine::matcher;
use crate::engine::router::{self, RowOutcome};
use crate::error::{EngineError, Result};
use crate::jobs::model::{
    Batch, BatchState, CommitRow, CommitStatus, CommitTarget, Control, ImageKind, ImageResult,
    ImageRow, Job, JobStatus,
};
use crate::jobs::repository as jobs;
use crate::registry::repository as registry;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// How the worker left the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Committed,
    HaltedByTerminate,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconciled {
    Committed,
    Continue,
    Failed,
}

/// Full worker lifecycle over an open store: resume or create the job, run
/// one-shot discovery for a fresh job, then drive the batch state machine.
/// A restart after completion is a no-op: the finished job for this
/// configuration is detected and nothing is written.
pub fn run_worker(
    conn: rusqlite::Connection,
    analyzer: Box<dyn crate::engine::analyze::FaceAnalysis>,
    paths: crate::paths::HotPaths,
    config: crate::jobs::model::JobConfig,
    status: std::sync::Arc<std::sync::Mutex<String>>,
) -> Result<EngineExit> {
    let mut conn = conn;
    let mut job = match jobs::find_resumable_job(&conn)? {
        Some(job) => {
            tracing::info!("engine: resuming job {}", job.job_id);
            job
        }
        None => match jobs::latest_job(&conn)? {
            Some(previous)
                if previous.source_root == config.source_root
                    && previous.output_root == config.output_root =>
            {
                match previous.status {
                    // Restarting a finished run writes nothing.
                    JobStatus::Completed => {
                        tracing::info!(
                            "engine: job {} already completed for this configuration, nothing to do",
                            previous.job_id
                        );
                        if let Ok(mut s) = status.lock() {
                            *s = "completed".to_string();
                        }
                        return Ok(EngineExit::Completed);
                    }
                    // A stopped or failed job reopens: continuation for the
                    // former, reconciliation for the latter.
                    JobStatus::Stopped | JobStatus::Failed => {
                        tracing::info!(
                            "engine: reopening {} job {}",
                            previous.status.as_str(),
                            previous.job_id
                        );
                        previous
                    }
                    JobStatus::Created | JobStatus::Running => previous,
                }
            }
            _ => jobs::create_job(&conn, &config)?,
        },
    };

    // One-shot discovery: only a job without inventory walks the source tree.
    if job.total_images == 0 {
        if let Ok(mut s) = status.lock() {
            *s = "ingesting".to_string();
        }
        let (total, stats) =
            crate::engine::ingest::ingest_inventory(&mut conn, job.job_id, &job.source_root)?;
        job.total_images = total;
        if stats.errors > 0 {
            tracing::warn!(
                "engine: ingest finished with {} warnings (first: {:?})",
                stats.errors,
                stats.error_log.first()
            );
        }
    }
    jobs::create_batches(&mut conn, job.job_id, job.total_images)?;
    jobs::mark_job_running(&conn, job.job_id)?;
    job.status = JobStatus::Running;

    let mut ctx = EngineContext::new(conn, analyzer, paths, config, status);
    run_job(&mut ctx, &job)
}

/// Drive a job to completion: resume-or-reconcile whatever a previous worker
/// left behind, then lease PENDING batches in order until none remain or a
/// control signal halts the run.
pub fn run_job(ctx: &mut EngineContext, job: &Job) -> Result<EngineExit> {
    ctx.set_status("resuming");
    match resume_job(ctx, job)? {
        Reconciled::Failed => {
            jobs::set_job_status(&ctx.conn, job.job_id, JobStatus::Failed)?;
            return Ok(EngineExit::Failed);
        }
        Reconciled::Committed | Reconciled::Continue => {}
    }

    loop {
        ctx.write_progress(job.job_id, None);

        // Safe point 1: between batches.
        match jobs::read_control(&ctx.conn)? {
            Control::Run => {}
            Control::Stop | Control::Terminate => {
                tracing::info!("engine: control signal between batches, halting");
                jobs::set_job_status(&ctx.conn, job.job_id, JobStatus::Stopped)?;
                ctx.set_status("stopped");
                return Ok(EngineExit::Stopped);
            }
        }

        let Some(batch) = jobs::lease_next_pending(&mut ctx.conn, job.job_id)? else {
            if jobs::count_unfinished_batches(&ctx.conn, job.job_id)? == 0 {
                jobs::set_job_status(&ctx.conn, job.job_id, JobStatus::Completed)?;
                ctx.write_progress(job.job_id, None);
                ctx.set_status("completed");
                tracing::info!("engine: job {} completed", job.job_id);
                return Ok(EngineExit::Completed);
            }
            // Single execution lane: nothing else may hold batches open.
            return Err(EngineError::Commit {
                batch_id: -1,
                reason: "non-PENDING batches remain but none are leasable".into(),
            });
        };

        match run_batch(ctx, job, &batch)? {
            BatchOutcome::Committed => {}
            BatchOutcome::HaltedByTerminate => {
                jobs::set_job_status(&ctx.conn, job.job_id, JobStatus::Stopped)?;
                ctx.set_status("stopped");
                return Ok(EngineExit::Stopped);
            }
            BatchOutcome::Failed => {
                jobs::set_job_status(&ctx.conn, job.job_id, JobStatus::Failed)?;
                ctx.set_status("failed");
                return Ok(EngineExit::Failed);
            }
        }
    }
}

/// Resume table, applied before any leasing:
///   PENDING    -> leave as-is
///   PROCESSING -> reset to PENDING, drop its image_results
///   COMMITTING -> reconcile rows against disk evidence, then finish
///   COMMITTED  -> leave as-is
fn resume_job(ctx: &mut EngineContext, job: &Job) -> Result<Reconciled> {
    for batch in jobs::batches_in_state(&ctx.conn, job.job_id, BatchState::Processing)? {
        tracing::info!("resume: batch {} was PROCESSING, resetting", batch.batch_id);
        jobs::reset_batch_to_pending(&mut ctx.conn, batch.batch_id)?;
        // A crashed run may have left RAW intermediates behind.
        let _ = std::fs::remove_dir_all(ctx.paths.temp_dir(batch.batch_id));
    }

    for batch in jobs::batches_in_state(&ctx.conn, job.job_id, BatchState::Committing)? {
        tracing::info!("resume: batch {} was COMMITTING, reconciling", batch.batch_id);
        match reconcile_batch(ctx, &batch)? {
            Reconciled::Failed => return Ok(Reconciled::Failed),
            Reconciled::Committed => {}
            Reconciled::Continue => {
                // Continue the normal COMMITTING logic for the leftover rows.
                match commit_batch(ctx, job, &batch)? {
                    BatchOutcome::Committed => {}
                    BatchOutcome::Failed | BatchOutcome::HaltedByTerminate => {
                        return Ok(Reconciled::Failed)
                    }
                }
            }
        }
    }

    Ok(Reconciled::Continue)
}

/// Classify every commit-log row of a COMMITTING batch against on-disk
/// evidence and advance it to the highest consistent status. Idempotent:
/// applying it twice changes nothing the first pass did not.
fn reconcile_batch(ctx: &mut EngineContext, batch: &Batch) -> Result<Reconciled> {
    let staging_dir = ctx.paths.staging_dir(batch.batch_id);
    let rows = jobs::rows_for_batch(&ctx.conn, batch.batch_id)?;
    let mut any_failed = false;

    for row in &rows {
        let staged = compress::staged_path(&staging_dir, row.image_id);
        let evidence = router::gather_evidence(row, &staged);
        match row.status {
            CommitStatus::Verified => {}
            CommitStatus::Written | CommitStatus::Failed => {
                if evidence.destination_ok {
                    // The copy completed before the crash; finish the row.
                    jobs::advance_commit_row(&ctx.conn, row.commit_id, CommitStatus::Verified)?;
                } else if evidence.staged_present {
                    // No destination but the artifact survives: re-copy.
                    router::clean_partial(&row.output_path);
                    jobs::advance_commit_row(&ctx.conn, row.commit_id, CommitStatus::Pending)?;
                } else {
                    // Log says written, disk shows nothing on either side.
                    tracing::warn!(
                        "reconcile: row {} claims {} but no destination and no staged file",
                        row.commit_id,
                        row.status.as_str()
                    );
                    jobs::advance_commit_row(&ctx.conn, row.commit_id, CommitStatus::Failed)?;
                    any_failed = true;
                }
            }
            CommitStatus::Pending => {
                // A crash between copy and status update leaves a complete
                // destination; the router detects the identical file and
                // skips the copy on retry. Only stale partials are removed.
                router::clean_partial(&row.output_path);
            }
        }
    }

    if any_failed {
        tracing::warn!("reconcile: batch {} has failed rows", batch.batch_id);
        return Ok(Reconciled::Failed);
    }

    if jobs::unverified_rows(&ctx.conn, batch.batch_id)?.is_empty() {
        finish_batch(ctx, batch)?;
        return Ok(Reconciled::Committed);
    }
    Ok(Reconciled::Continue)
}

/// PROCESSING + COMMITTING for one freshly leased batch.
fn run_batch(ctx: &mut EngineContext, job: &Job, batch: &Batch) -> Result<BatchOutcome> {
    ctx.set_status(format!("processing batch {}", batch.batch_id));
    let temp = TempScope::new(ctx.paths.temp_dir(batch.batch_id))?;
    let images = jobs::images_for_range(&ctx.conn, job.job_id, batch.start_idx, batch.end_idx)?;

    // ── PROCESSING: detect, embed, match. No writes under output_root. ──────
    for image in &images {
        // Safe point 2: the start of each image.
        if jobs::read_control(&ctx.conn)? == Control::Terminate {
            tracing::info!("engine: terminate during batch {}, resetting", batch.batch_id);
            jobs::reset_batch_to_pending(&mut ctx.conn, batch.batch_id)?;
            return Ok(BatchOutcome::HaltedByTerminate);
        }

        let result = process_image(ctx, batch, image, &temp);
        jobs::upsert_image_result(&ctx.conn, &result)?;
        ctx.progress.on_image_processed();
        ctx.write_progress(job.job_id, Some(batch));
    }

    // ── Transition to COMMITTING: pending rows in one transaction. ──────────
    let targets = compute_targets(ctx, batch)?;
    jobs::begin_committing(&mut ctx.conn, batch.batch_id, &targets)?;
    let mut committing = batch.clone();
    committing.state = BatchState::Committing;
    ctx.write_progress(job.job_id, Some(&committing));

    // ── COMMITTING: stage artifacts, route rows to the cold tree. ───────────
    let outcome = commit_batch(ctx, job, &committing)?;
    drop(temp);
    Ok(outcome)
}

/// Decode -> analyze -> match for one image. Decode and inference failures
/// degrade to an unmatched image with a warning; they never fail the batch.
fn process_image(
    ctx: &mut EngineContext,
    batch: &Batch,
    image: &ImageRow,
    temp: &TempScope,
) -> ImageResult {
    let empty = ImageResult {
        image_id: image.image_id,
        batch_id: batch.batch_id,
        face_count: 0,
        matched_count: 0,
        unknown_count: 0,
        matched_person_ids: Vec::new(),
    };

    let decoded = match decode::decode_for_analysis(
        &image.source_path,
        image.kind(),
        image.image_id,
        temp,
    ) {
        DecodeOutcome::Decoded(img) => img,
        DecodeOutcome::DecodeFailed { reason } => {
            tracing::warn!("engine: image {} skipped: {}", image.image_id, reason);
            return empty;
        }
    };

    let faces = match ctx.analyzer.analyze(&decoded.to_rgb8()) {
        Ok(faces) => faces,
        Err(e) => {
            tracing::warn!("engine: analyzer failed on image {}: {}", image.image_id, e);
            return empty;
        }
    };

    match matcher::match_faces(
        &mut ctx.conn,
        &faces,
        ctx.config.selected_person_ids.as_deref(),
    ) {
        Ok(matches) => ImageResult {
            image_id: image.image_id,
            batch_id: batch.batch_id,
            face_count: matches.face_count,
            matched_count: matches.matched_count,
            unknown_count: matches.unknown_count,
            matched_person_ids: matches.matched_person_ids,
        },
        Err(e) => {
            tracing::warn!("engine: matcher failed on image {}: {}", image.image_id, e);
            empty
        }
    }
}

/// Fan-out targets for every image of the batch with >= 1 match. Group mode
/// collapses an image covering all selected persons into one group-folder
/// target; otherwise one target per matched person.
fn compute_targets(ctx: &EngineContext, batch: &Batch) -> Result<Vec<CommitTarget>> {
    let results = jobs::image_results_for_batch(&ctx.conn, batch.batch_id)?;
    let persons: HashMap<i64, String> = registry::list_persons(&ctx.conn)?
        .into_iter()
        .map(|p| (p.person_id, p.output_folder_rel))
        .collect();

    let group = if ctx.config.group_mode {
        let folder = ctx.config.group_folder_name.clone().ok_or_else(|| {
            EngineError::Config("group_mode set without group_folder_name".into())
        })?;
        let selected = ctx.config.selected_person_ids.clone().ok_or_else(|| {
            EngineError::Config("group_mode set without selected_person_ids".into())
        })?;
        Some((folder, selected))
    } else {
        None
    };

    let mut targets = Vec::new();
    for result in &results {
        if result.matched_person_ids.is_empty() {
            continue;
        }
        let image = jobs::image_by_id(&ctx.conn, result.image_id)?.ok_or_else(|| {
            EngineError::Commit {
                batch_id: batch.batch_id,
                reason: format!("image {} vanished from the inventory", result.image_id),
            }
        })?;
        let filename = router::output_filename(image.ordering_idx, &image.sha256);

        if let Some((group_folder, selected)) = &group {
            if matcher::covers_selected(&result.matched_person_ids, selected) {
                targets.push(CommitTarget {
                    image_id: image.image_id,
                    person_id: None,
                    output_filename: filename.clone(),
                    output_path: ctx.config.output_root.join(group_folder).join(&filename),
                });
                continue;
            }
        }

        for person_id in &result.matched_person_ids {
            let folder = persons.get(person_id).ok_or_else(|| EngineError::Commit {
                batch_id: batch.batch_id,
                reason: format!("matched person {} is not in the registry", person_id),
            })?;
            targets.push(CommitTarget {
                image_id: image.image_id,
                person_id: Some(*person_id),
                output_filename: filename.clone(),
                output_path: ctx.config.output_root.join(folder).join(&filename),
            });
        }
    }
    Ok(targets)
}

/// COMMITTING: stage one artifact per matched image, then drive each
/// unverified commit-log row to verified. Row statuses advance individually;
/// a persistently failing row leaves the batch stuck in COMMITTING and the
/// job failed, with reconciliation picking up later.
fn commit_batch(ctx: &mut EngineContext, job: &Job, batch: &Batch) -> Result<BatchOutcome> {
    ctx.set_status(format!("committing batch {}", batch.batch_id));
    let staging_dir = ctx.paths.staging_dir(batch.batch_id);
    let rows = jobs::unverified_rows(&ctx.conn, batch.batch_id)?;

    if !rows.is_empty() {
        let needed: BTreeSet<i64> = rows.iter().map(|r| r.image_id).collect();
        let mut to_stage: Vec<(i64, PathBuf, ImageKind)> = Vec::with_capacity(needed.len());
        for image_id in needed {
            let image = jobs::image_by_id(&ctx.conn, image_id)?.ok_or_else(|| {
                EngineError::Commit {
                    batch_id: batch.batch_id,
                    reason: format!("image {} vanished from the inventory", image_id),
                }
            })?;
            to_stage.push((image_id, image.source_path.clone(), image.kind()));
        }

        for (image_id, result) in compress::stage_batch(&to_stage, &staging_dir) {
            if let Err(reason) = result {
                tracing::warn!(
                    "engine: cannot stage image {} for batch {}: {}",
                    image_id,
                    batch.batch_id,
                    reason
                );
                return Ok(BatchOutcome::Failed);
            }
        }

        let persons: HashMap<i64, String> = registry::list_persons(&ctx.conn)?
            .into_iter()
            .map(|p| (p.person_id, p.display_name))
            .collect();

        for row in &rows {
            // Safe point 3: between row transitions. Signals let every row
            // already underway reach verified; the halt lands after the batch.
            let _ = jobs::read_control(&ctx.conn)?;

            match route_row(ctx, row, &staging_dir)? {
                RowOutcome::Verified => {
                    let person = row
                        .person_id
                        .and_then(|id| persons.get(&id).cloned())
                        .unwrap_or_else(|| "group".to_string());
                    ctx.progress.on_row_verified(&person, &row.output_filename);
                    ctx.write_progress(job.job_id, Some(batch));
                }
                RowOutcome::Failed(reason) => {
                    tracing::warn!(
                        "engine: batch {} stuck in COMMITTING: {}",
                        batch.batch_id,
                        reason
                    );
                    return Ok(BatchOutcome::Failed);
                }
            }
        }
    }

    finish_batch(ctx, batch)?;
    ctx.write_progress(job.job_id, None);
    Ok(BatchOutcome::Committed)
}

fn route_row(ctx: &EngineContext, row: &CommitRow, staging_dir: &std::path::Path) -> Result<RowOutcome> {
    let staged = compress::staged_path(staging_dir, row.image_id);
    router::execute_row(&ctx.conn, row, &staged)
}

/// COMMITTED transition plus hot-storage cleanup: the staging directory and
/// any RAW intermediates for the batch are deleted.
fn finish_batch(ctx: &mut EngineContext, batch: &Batch) -> Result<()> {
    jobs::mark_batch_committed(&mut ctx.conn, batch)?;
    ctx.progress.on_batch_committed(batch);

    for dir in [
        ctx.paths.staging_dir(batch.batch_id),
        ctx.paths.temp_dir(batch.batch_id),
    ] {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("engine: cannot clean {:?}: {}", dir, e);
            }
        }
    }
    Ok(())
}
