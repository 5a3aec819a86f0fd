/// Engine-level error type. Per-image failures (decode, inference) are not
/// errors — they are `ImageOutcome` values consumed by the batch loop.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("commit failed for batch {batch_id}: {reason}")]
    Commit { batch_id: i64, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
