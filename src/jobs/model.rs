use std::path::PathBuf;

/// Fixed batch width. The last batch of a job may be shorter.
pub const BATCH_WIDTH: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    Run,
    Stop,
    Terminate,
}

impl Control {
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::Run => "run",
            Control::Stop => "stop",
            Control::Terminate => "terminate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run" => Some(Control::Run),
            "stop" => Some(Control::Stop),
            "terminate" => Some(Control::Terminate),
            _ => None,
        }
    }
}

/// Singleton configuration record consumed from the control plane.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub source_root: PathBuf,
    pub output_root: PathBuf,
    /// None = match against every registered person.
    pub selected_person_ids: Option<Vec<i64>>,
    pub group_mode: bool,
    pub group_folder_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Stopped => "stopped",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(JobStatus::Created),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "stopped" => Some(JobStatus::Stopped),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Stopped | JobStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: i64,
    pub source_root: PathBuf,
    pub output_root: PathBuf,
    pub total_images: i64,
    pub processed_images: i64,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Raw,
}

#[derive(Debug, Clone)]
pub struct ImageRow {
    pub image_id: i64,
    pub job_id: i64,
    pub source_path: PathBuf,
    pub filename: String,
    pub extension: String,
    pub sha256: String,
    pub ordering_idx: i64,
}

impl ImageRow {
    pub fn kind(&self) -> ImageKind {
        if self.extension.eq_ignore_ascii_case(".arw") {
            ImageKind::Raw
        } else {
            ImageKind::Jpeg
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Processing,
    Committing,
    Committed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "PENDING",
            BatchState::Processing => "PROCESSING",
            BatchState::Committing => "COMMITTING",
            BatchState::Committed => "COMMITTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BatchState::Pending),
            "PROCESSING" => Some(BatchState::Processing),
            "COMMITTING" => Some(BatchState::Committing),
            "COMMITTED" => Some(BatchState::Committed),
            _ => None,
        }
    }
}

/// Contiguous block of images; the unit of atomic state. `start_idx` and
/// `end_idx` are inclusive ordering indices.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: i64,
    pub job_id: i64,
    pub start_idx: i64,
    pub end_idx: i64,
    pub state: BatchState,
}

impl Batch {
    pub fn width(&self) -> i64 {
        self.end_idx - self.start_idx + 1
    }
}

#[derive(Debug, Clone)]
pub struct ImageResult {
    pub image_id: i64,
    pub batch_id: i64,
    pub face_count: i64,
    pub matched_count: i64,
    pub unknown_count: i64,
    /// Ascending, deduplicated person ids.
    pub matched_person_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Pending,
    Written,
    Verified,
    Failed,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::Pending => "pending",
            CommitStatus::Written => "written",
            CommitStatus::Verified => "verified",
            CommitStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CommitStatus::Pending),
            "written" => Some(CommitStatus::Written),
            "verified" => Some(CommitStatus::Verified),
            "failed" => Some(CommitStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommitRow {
    pub commit_id: i64,
    pub batch_id: i64,
    pub image_id: i64,
    /// None routes to the group folder.
    pub person_id: Option<i64>,
    pub output_filename: String,
    pub output_path: PathBuf,
    pub status: CommitStatus,
}

/// One fan-out destination computed when a batch enters COMMITTING.
#[derive(Debug, Clone)]
pub struct CommitTarget {
    pub image_id: i64,
    pub person_id: Option<i64>,
    pub output_filename: String,
    pub output_path: PathBuf,
}
