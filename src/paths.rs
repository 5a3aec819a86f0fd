use std::path::{Path, PathBuf};

/// Layout of the hot-storage directory. Everything transient lives here:
/// the database, per-batch staging and temp trees, state files and models.
/// The cold output tree is configured separately and is append-only.
#[derive(Debug, Clone)]
pub struct HotPaths {
    root: PathBuf,
}

impl HotPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("registry.db")
    }

    pub fn staging_dir(&self, batch_id: i64) -> PathBuf {
        self.root.join("staging").join(batch_id.to_string())
    }

    pub fn temp_dir(&self, batch_id: i64) -> PathBuf {
        self.root.join("temp").join(batch_id.to_string())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn detector_path(&self) -> PathBuf {
        self.models_dir().join("face_detection.onnx")
    }

    pub fn embedder_path(&self) -> PathBuf {
        self.models_dir().join("face_embedding.onnx")
    }

    /// Create the hot directories the worker writes into.
    /// `models/` is not created: models are provisioned from the outside.
    pub fn bootstrap(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.root.join("staging"))?;
        std::fs::create_dir_all(self.root.join("temp"))?;
        std::fs::create_dir_all(self.state_dir())?;
        Ok(())
    }
}
