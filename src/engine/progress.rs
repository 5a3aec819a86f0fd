use crate::jobs::model::Batch;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Smoothing factor for the images-per-second estimate.
const EWMA_ALPHA: f64 = 0.2;
/// Recent-batch ring length.
const RING_LEN: usize = 20;
/// A heartbeat older than this marks the worker as hung or dead.
pub const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentBatchEntry {
    pub batch_id: i64,
    pub start_idx: i64,
    pub end_idx: i64,
    pub committed_at: String,
}

#[derive(Debug, Clone, Serialize)]
struct ProgressFile {
    total_images: i64,
    processed_images: i64,
    completion_percent: f64,
    current_batch_id: Option<i64>,
    current_image_range: Option<[i64; 2]>,
    current_batch_state: Option<String>,
    last_committed_person: Option<String>,
    last_committed_image: Option<String>,
    last_committed_time: Option<String>,
    recent_batches: Vec<RecentBatchEntry>,
    elapsed_seconds: f64,
    images_per_second: Option<f64>,
    eta_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatFile {
    pub pid: u32,
    pub status: String,
    pub timestamp: String,
}

/// Atomic JSON write: serialise to `<path>.tmp`, then rename over `path`.
/// Readers either see the previous file or the new one, never a torn write.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::other(format!("serialise {:?}: {}", path, e)))?;
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Mirrors engine state to `state/progress.json` after every image and every
/// commit-log transition. Write failures are logged, never fatal.
#[derive(Debug)]
pub struct ProgressTracker {
    state_dir: PathBuf,
    started: Instant,
    last_image_at: Option<Instant>,
    images_per_second: Option<f64>,
    ring: VecDeque<RecentBatchEntry>,
    last_committed_person: Option<String>,
    last_committed_image: Option<String>,
    last_committed_time: Option<String>,
}

impl ProgressTracker {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            started: Instant::now(),
            last_image_at: None,
            images_per_second: None,
            ring: VecDeque::with_capacity(RING_LEN),
            last_committed_person: None,
            last_committed_image: None,
            last_committed_time: None,
        }
    }

    pub fn progress_path(&self) -> PathBuf {
        self.state_dir.join("progress.json")
    }

    /// Fold one processed image into the EWMA throughput estimate.
    /// The first sample seeds the estimate directly.
    pub fn on_image_processed(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.last_image_at {
            let dt = now.duration_since(prev).as_secs_f64();
            if dt > 0.0 {
                let sample = 1.0 / dt;
                self.images_per_second = Some(match self.images_per_second {
                    Some(ewma) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * ewma,
                    None => sample,
                });
            }
        }
        self.last_image_at = Some(now);
    }

    /// Record the most recent verified commit-log row.
    pub fn on_row_verified(&mut self, person: &str, image: &str) {
        self.last_committed_person = Some(person.to_string());
        self.last_committed_image = Some(image.to_string());
        self.last_committed_time = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Push a committed batch into the recent ring (bounded at RING_LEN).
    pub fn on_batch_committed(&mut self, batch: &Batch) {
        if self.ring.len() == RING_LEN {
            self.ring.pop_front();
        }
        self.ring.push_back(RecentBatchEntry {
            batch_id: batch.batch_id,
            start_idx: batch.start_idx,
            end_idx: batch.end_idx,
            committed_at: chrono::Utc::now().to_rfc3339(),
        });
    }

    /// Write `state/progress.json`. Failures are logged and swallowed: a
    /// missing progress file must never take the engine down.
    pub fn write(&self, total_images: i64, processed_images: i64, current: Option<&Batch>) {
        let completion_percent = if total_images > 0 {
            processed_images as f64 / total_images as f64 * 100.0
        } else {
            0.0
        };
        let remaining = (total_images - processed_images).max(0) as f64;
        let eta_seconds = self
            .images_per_second
            .filter(|r| *r > 0.0)
            .map(|r| remaining / r);

        let file = ProgressFile {
            total_images,
            processed_images,
            completion_percent,
            current_batch_id: current.map(|b| b.batch_id),
            current_image_range: current.map(|b| [b.start_idx, b.end_idx]),
            current_batch_state: current.map(|b| b.state.as_str().to_string()),
            last_committed_person: self.last_committed_person.clone(),
            last_committed_image: self.last_committed_image.clone(),
            last_committed_time: self.last_committed_time.clone(),
            recent_batches: self.ring.iter().cloned().collect(),
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            images_per_second: self.images_per_second,
            eta_seconds,
        };

        if let Err(e) = write_json_atomic(&self.progress_path(), &file) {
            tracing::warn!("progress: cannot write {:?}: {}", self.progress_path(), e);
        }
    }
}

pub fn heartbeat_path(state_dir: &Path) -> PathBuf {
    state_dir.join("worker_heartbeat.json")
}

pub fn write_heartbeat(state_dir: &Path, status: &str) {
    let file = HeartbeatFile {
        pid: std::process::id(),
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    if let Err(e) = write_json_atomic(&heartbeat_path(state_dir), &file) {
        tracing::warn!("progress: cannot write heartbeat: {}", e);
    }
}

/// 1 Hz heartbeat thread, independent of batch activity. The shared status
/// string is whatever the engine last set; `stop` ends the loop.
pub fn spawn_heartbeat(
    state_dir: PathBuf,
    status: Arc<Mutex<String>>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            let current = status
                .lock()
                .map(|s| s.clone())
                .unwrap_or_else(|_| "unknown".to_string());
            write_heartbeat(&state_dir, &current);
            std::thread::sleep(Duration::from_secs(1));
        }
        // Final write so the last status survives shutdown.
        let current = status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());
        write_heartbeat(&state_dir, &current);
    })
}

/// A heartbeat from another live worker on this hot directory, if any.
/// Returns None for a missing, unreadable, stale, or own-pid heartbeat.
pub fn foreign_live_heartbeat(state_dir: &Path) -> Option<HeartbeatFile> {
    let text = std::fs::read_to_string(heartbeat_path(state_dir)).ok()?;
    let hb: HeartbeatFile = serde_json::from_str(&text).ok()?;
    if hb.pid == std::process::id() {
        return None;
    }
    let ts = chrono::DateTime::parse_from_rfc3339(&hb.timestamp).ok()?;
    let age = chrono::Utc::now().signed_duration_since(ts.with_timezone(&chrono::Utc));
    if age.num_seconds() >= 0 && age.num_seconds() < HEARTBEAT_STALE_AFTER.as_secs() as i64 {
        Some(hb)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::BatchState;
    use tempfile::TempDir;

    fn batch(batch_id: i64, start: i64, end: i64, state: BatchState) -> Batch {
        Batch {
            batch_id,
            job_id: 1,
            start_idx: start,
            end_idx: end,
            state,
        }
    }

    fn read_progress(tracker: &ProgressTracker) -> serde_json::Value {
        let text = std::fs::read_to_string(tracker.progress_path()).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_progress_file_contract() {
        let tmp = TempDir::new().unwrap();
        let mut tracker = ProgressTracker::new(tmp.path().to_path_buf());
        tracker.on_row_verified("Alice", "000001_ab.jpg");
        let b = batch(3, 100, 149, BatchState::Processing);
        tracker.write(500, 100, Some(&b));

        let v = read_progress(&tracker);
        assert_eq!(v["total_images"], 500);
        assert_eq!(v["processed_images"], 100);
        assert_eq!(v["completion_percent"], 20.0);
        assert_eq!(v["current_batch_id"], 3);
        assert_eq!(v["current_image_range"][0], 100);
        assert_eq!(v["current_image_range"][1], 149);
        assert_eq!(v["current_batch_state"], "PROCESSING");
        assert_eq!(v["last_committed_person"], "Alice");
        assert_eq!(v["last_committed_image"], "000001_ab.jpg");
        assert!(v["last_committed_time"].is_string());
        assert!(v["recent_batches"].is_array());
        assert!(v["elapsed_seconds"].is_number());
    }

    #[test]
    fn test_progress_without_current_batch() {
        let tmp = TempDir::new().unwrap();
        let tracker = ProgressTracker::new(tmp.path().to_path_buf());
        tracker.write(0, 0, None);

        let v = read_progress(&tracker);
        assert_eq!(v["completion_percent"], 0.0);
        assert!(v["current_batch_id"].is_null());
        assert!(v["images_per_second"].is_null());
        assert!(v["eta_seconds"].is_null());
    }

    #[test]
    fn test_ring_is_bounded_at_20() {
        let tmp = TempDir::new().unwrap();
        let mut tracker = ProgressTracker::new(tmp.path().to_path_buf());
        for i in 0..30 {
            tracker.on_batch_committed(&batch(i, i * 50, i * 50 + 49, BatchState::Committed));
        }
        tracker.write(1500, 1500, None);

        let v = read_progress(&tracker);
        let ring = v["recent_batches"].as_array().unwrap();
        assert_eq!(ring.len(), 20);
        assert_eq!(ring[0]["batch_id"], 10, "oldest entries are evicted");
        assert_eq!(ring[19]["batch_id"], 29);
    }

    #[test]
    fn test_ewma_seeds_then_smooths() {
        let tmp = TempDir::new().unwrap();
        let mut tracker = ProgressTracker::new(tmp.path().to_path_buf());

        tracker.on_image_processed(); // first call only stamps the clock
        assert!(tracker.images_per_second.is_none());

        std::thread::sleep(Duration::from_millis(20));
        tracker.on_image_processed();
        let seeded = tracker.images_per_second.expect("second image seeds the rate");
        assert!(seeded > 0.0);

        std::thread::sleep(Duration::from_millis(20));
        tracker.on_image_processed();
        let smoothed = tracker.images_per_second.unwrap();
        assert!(smoothed > 0.0);
    }

    #[test]
    fn test_atomic_write_leaves_no_tmp() {
        let tmp = TempDir::new().unwrap();
        let tracker = ProgressTracker::new(tmp.path().to_path_buf());
        tracker.write(10, 5, None);
        tracker.write(10, 6, None);

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty(), "tmp file must be renamed away");
    }

    #[test]
    fn test_heartbeat_contract() {
        let tmp = TempDir::new().unwrap();
        write_heartbeat(tmp.path(), "processing batch 3");

        let text = std::fs::read_to_string(heartbeat_path(tmp.path())).unwrap();
        let hb: HeartbeatFile = serde_json::from_str(&text).unwrap();
        assert_eq!(hb.pid, std::process::id());
        assert_eq!(hb.status, "processing batch 3");
        assert!(chrono::DateTime::parse_from_rfc3339(&hb.timestamp).is_ok());
    }

    #[test]
    fn test_foreign_live_heartbeat_ignores_own_pid() {
        let tmp = TempDir::new().unwrap();
        write_heartbeat(tmp.path(), "running");
        assert!(foreign_live_heartbeat(tmp.path()).is_none());
    }

    #[test]
    fn test_foreign_live_heartbeat_detects_other_fresh_worker() {
        let tmp = TempDir::new().unwrap();
        let hb = HeartbeatFile {
            pid: std::process::id().wrapping_add(1),
            status: "running".into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        write_json_atomic(&heartbeat_path(tmp.path()), &hb).unwrap();
        assert!(foreign_live_heartbeat(tmp.path()).is_some());
    }

    #[test]
    fn test_foreign_live_heartbeat_ignores_stale() {
        let tmp = TempDir::new().unwrap();
        let old = chrono::Utc::now() - chrono::Duration::seconds(60);
        let hb = HeartbeatFile {
            pid: std::process::id().wrapping_add(1),
            status: "running".into(),
            timestamp: old.to_rfc3339(),
        };
        write_json_atomic(&heartbeat_path(tmp.path()), &hb).unwrap();
        assert!(foreign_live_heartbeat(tmp.path()).is_none());
    }

    #[test]
    fn test_spawn_heartbeat_writes_and_stops() {
        let tmp = TempDir::new().unwrap();
        let status = Arc::new(Mutex::new("starting".to_string()));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_heartbeat(tmp.path().to_path_buf(), status.clone(), stop.clone());

        // First write happens immediately.
        std::thread::sleep(Duration::from_millis(100));
        assert!(heartbeat_path(tmp.path()).is_file());

        *status.lock().unwrap() = "done".to_string();
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        let text = std::fs::read_to_string(heartbeat_path(tmp.path())).unwrap();
        let hb: HeartbeatFile = serde_json::from_str(&text).unwrap();
        assert_eq!(hb.status, "done", "final write carries the last status");
    }
}
