use crate::engine::analyze::FaceAnalysis;
use crate::engine::progress::ProgressTracker;
use crate::jobs::model::{Batch, JobConfig};
use crate::jobs::repository as jobs;
use crate::paths::HotPaths;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// Everything the batch engine threads through its stages: the store
/// connection, the loaded analyzer, the hot layout, the job configuration,
/// and the progress mirror. Constructed once at startup, torn down on exit.
pub struct EngineContext {
    pub conn: Connection,
    pub analyzer: Box<dyn FaceAnalysis>,
    pub paths: HotPaths,
    pub config: JobConfig,
    pub progress: ProgressTracker,
    /// Mirrored into the heartbeat file by the 1 Hz heartbeat thread.
    pub status: Arc<Mutex<String>>,
}

impl EngineContext {
    pub fn new(
        conn: Connection,
        analyzer: Box<dyn FaceAnalysis>,
        paths: HotPaths,
        config: JobConfig,
        status: Arc<Mutex<String>>,
    ) -> Self {
        let progress = ProgressTracker::new(paths.state_dir());
        Self {
            conn,
            analyzer,
            paths,
            config,
            progress,
            status,
        }
    }

    pub fn set_status(&self, status: impl Into<String>) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status.into();
        }
    }

    /// Refresh `state/progress.json` from the store counters.
    pub fn write_progress(&mut self, job_id: i64, current: Option<&Batch>) {
        match jobs::job_counters(&self.conn, job_id) {
            Ok((total, processed)) => self.progress.write(total, processed, current),
            Err(e) => tracing::warn!("progress: cannot read job counters: {}", e),
        }
    }
}
