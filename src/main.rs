use facesort::db::{open_connection, run_migrations};
use facesort::engine::analyze::OnnxFaceAnalyzer;
use facesort::engine::batch::{self, EngineExit};
use facesort::engine::progress;
use facesort::error::EngineError;
use facesort::jobs::model::JobConfig;
use facesort::jobs::repository as jobs;
use facesort::paths::HotPaths;
use facesort::registry::model::is_valid_folder_component;
use facesort::registry::repository as registry;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const EXIT_OK: i32 = 0;
const EXIT_ENGINE_ERROR: i32 = 1;
const EXIT_BAD_CONFIG: i32 = 2;

/// One batch of staged artifacts at ~10 MiB per image.
const MIN_HOT_FREE_BYTES: u64 = facesort::jobs::model::BATCH_WIDTH as u64 * 10 * 1024 * 1024;

fn main() {
    tracing_subscriber::fmt::init();
    std::process::exit(run());
}

fn run() -> i32 {
    let Some(hot_root) = resolve_hot_root() else {
        eprintln!("usage: facesort-worker <hot-dir>  (or set FACESORT_HOT)");
        return EXIT_BAD_CONFIG;
    };
    let paths = HotPaths::new(hot_root);
    if let Err(e) = paths.bootstrap() {
        tracing::error!("worker: cannot bootstrap hot dir {:?}: {}", paths.root(), e);
        return EXIT_ENGINE_ERROR;
    }
    let state_dir = paths.state_dir();

    // Hot storage must hold a full batch of staged artifacts plus the store.
    match fs2::available_space(paths.root()) {
        Ok(free) if free < MIN_HOT_FREE_BYTES => {
            tracing::error!(
                "worker: hot storage has {} bytes free, needs at least {}",
                free,
                MIN_HOT_FREE_BYTES
            );
            return EXIT_ENGINE_ERROR;
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("worker: cannot query hot free space: {}", e),
    }

    // One engine per hot directory: a fresh heartbeat from another pid means
    // a live worker already owns this store.
    if let Some(other) = progress::foreign_live_heartbeat(&state_dir) {
        tracing::error!(
            "worker: another worker (pid {}) holds {:?}, refusing to start",
            other.pid,
            paths.root()
        );
        return EXIT_ENGINE_ERROR;
    }

    let conn = match open_connection(&paths.db_path()).and_then(|c| {
        run_migrations(&c)?;
        Ok(c)
    }) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!("worker: cannot open store {:?}: {}", paths.db_path(), e);
            return EXIT_ENGINE_ERROR;
        }
    };

    // Configuration gate: no valid singleton config, no job.
    let config = match load_valid_config(&conn) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("worker: {}", e);
            progress::write_heartbeat(&state_dir, "waiting_for_config");
            return EXIT_BAD_CONFIG;
        }
    };

    // Models load once per process; inference stays on the CPU.
    let analyzer = match OnnxFaceAnalyzer::load(&paths.detector_path(), &paths.embedder_path()) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("worker: {}", e);
            progress::write_heartbeat(&state_dir, "waiting_for_config");
            return EXIT_BAD_CONFIG;
        }
    };

    let status = Arc::new(Mutex::new("starting".to_string()));
    let heartbeat_stop = Arc::new(AtomicBool::new(false));
    let heartbeat = progress::spawn_heartbeat(
        state_dir.clone(),
        Arc::clone(&status),
        Arc::clone(&heartbeat_stop),
    );

    let code = match batch::run_worker(conn, Box::new(analyzer), paths, config, Arc::clone(&status))
    {
        Ok(EngineExit::Completed) | Ok(EngineExit::Stopped) => EXIT_OK,
        Ok(EngineExit::Failed) => EXIT_ENGINE_ERROR,
        Err(e) => {
            tracing::error!("worker: unrecoverable engine error: {}", e);
            if let Ok(mut s) = status.lock() {
                *s = "failed".to_string();
            }
            EXIT_ENGINE_ERROR
        }
    };

    heartbeat_stop.store(true, Ordering::SeqCst);
    let _ = heartbeat.join();
    code
}

fn resolve_hot_root() -> Option<PathBuf> {
    if let Ok(root) = std::env::var("FACESORT_HOT") {
        if !root.is_empty() {
            return Some(PathBuf::from(root));
        }
    }
    std::env::args().nth(1).map(PathBuf::from)
}

/// Read and validate the singleton job configuration. Every failure here is
/// an operator problem, surfaced as `waiting_for_config` + exit code 2.
fn load_valid_config(conn: &rusqlite::Connection) -> Result<JobConfig, EngineError> {
    let config = jobs::read_config(conn)?
        .ok_or_else(|| EngineError::Config("job_config row is missing or incomplete".into()))?;

    if !config.source_root.is_dir() {
        return Err(EngineError::Config(format!(
            "source_root {:?} is not a directory",
            config.source_root
        )));
    }
    if config.output_root.as_os_str().is_empty() {
        return Err(EngineError::Config("output_root is empty".into()));
    }
    std::fs::create_dir_all(&config.output_root).map_err(|e| {
        EngineError::Config(format!(
            "cannot create output_root {:?}: {}",
            config.output_root, e
        ))
    })?;

    let persons = registry::list_persons(conn)?;
    if let Some(selected) = &config.selected_person_ids {
        for id in selected {
            if !persons.iter().any(|p| p.person_id == *id) {
                return Err(EngineError::Config(format!(
                    "selected person {} is not in the registry",
                    id
                )));
            }
        }
    }

    if config.group_mode {
        let selected = config.selected_person_ids.as_ref().ok_or_else(|| {
            EngineError::Config("group_mode requires selected_person_ids".into())
        })?;
        if selected.len() < 2 {
            return Err(EngineError::Config(
                "group_mode requires at least 2 selected persons".into(),
            ));
        }
        let folder = config.group_folder_name.as_deref().unwrap_or_default();
        if !is_valid_folder_component(folder) {
            return Err(EngineError::Config(format!(
                "group folder {:?} must be a single non-empty path component",
                folder
            )));
        }
        if persons.iter().any(|p| p.output_folder_rel == folder) {
            return Err(EngineError::Config(format!(
                "group folder {:?} collides with a person folder",
                folder
            )));
        }
    }

    Ok(config)
}

