// Squashed single-block schema. All tables are created in one flat batch;
// schema_version records the current revision for forward migrations.
pub fn run_migrations(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS persons (
            person_id         INTEGER PRIMARY KEY,
            display_name      TEXT NOT NULL,
            output_folder_rel TEXT NOT NULL UNIQUE,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS person_embeddings (
            embedding_id INTEGER PRIMARY KEY,
            person_id    INTEGER NOT NULL REFERENCES persons(person_id),
            vector       BLOB NOT NULL,
            source_type  TEXT NOT NULL CHECK (source_type IN ('reference','learned')),
            created_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS person_centroids (
            person_id       INTEGER PRIMARY KEY REFERENCES persons(person_id),
            centroid        BLOB NOT NULL,
            embedding_count INTEGER NOT NULL
        );

        -- Singleton control surface written by the operator side, polled here.
        CREATE TABLE IF NOT EXISTS job_config (
            id                  INTEGER PRIMARY KEY CHECK (id = 1),
            source_root         TEXT,
            output_root         TEXT,
            selected_person_ids TEXT,
            group_mode          INTEGER NOT NULL DEFAULT 0,
            group_folder_name   TEXT,
            control             TEXT NOT NULL DEFAULT 'run'
        );

        CREATE TABLE IF NOT EXISTS jobs (
            job_id           INTEGER PRIMARY KEY,
            source_root      TEXT NOT NULL,
            output_root      TEXT NOT NULL,
            total_images     INTEGER NOT NULL DEFAULT 0,
            processed_images INTEGER NOT NULL DEFAULT 0,
            status           TEXT NOT NULL DEFAULT 'created',
            created_at       TEXT NOT NULL,
            started_at       TEXT,
            completed_at     TEXT
        );

        CREATE TABLE IF NOT EXISTS images (
            image_id     INTEGER PRIMARY KEY,
            job_id       INTEGER NOT NULL REFERENCES jobs(job_id),
            source_path  TEXT NOT NULL,
            filename     TEXT NOT NULL,
            extension    TEXT NOT NULL,
            sha256       TEXT NOT NULL,
            ordering_idx INTEGER NOT NULL,
            UNIQUE (job_id, source_path)
        );

        CREATE TABLE IF NOT EXISTS batches (
            batch_id     INTEGER PRIMARY KEY,
            job_id       INTEGER NOT NULL REFERENCES jobs(job_id),
            start_idx    INTEGER NOT NULL,
            end_idx      INTEGER NOT NULL,
            state        TEXT NOT NULL DEFAULT 'PENDING',
            created_at   TEXT NOT NULL,
            started_at   TEXT,
            committed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS image_results (
            image_id           INTEGER PRIMARY KEY REFERENCES images(image_id),
            batch_id           INTEGER NOT NULL REFERENCES batches(batch_id),
            face_count         INTEGER NOT NULL,
            matched_count      INTEGER NOT NULL,
            unknown_count      INTEGER NOT NULL,
            matched_person_ids TEXT NOT NULL
        );

        -- person_id NULL marks the group-folder row for an image.
        CREATE TABLE IF NOT EXISTS commit_log (
            commit_id       INTEGER PRIMARY KEY,
            batch_id        INTEGER NOT NULL REFERENCES batches(batch_id),
            image_id        INTEGER NOT NULL REFERENCES images(image_id),
            person_id       INTEGER REFERENCES persons(person_id),
            output_filename TEXT NOT NULL,
            output_path     TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            created_at      TEXT NOT NULL,
            verified_at     TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_commit_person
            ON commit_log(image_id, person_id) WHERE person_id IS NOT NULL;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_commit_group
            ON commit_log(image_id) WHERE person_id IS NULL;

        CREATE INDEX IF NOT EXISTS idx_embeddings_person ON person_embeddings(person_id, embedding_id);
        CREATE INDEX IF NOT EXISTS idx_images_ordering   ON images(job_id, ordering_idx);
        CREATE INDEX IF NOT EXISTS idx_batches_state     ON batches(job_id, state);
        CREATE INDEX IF NOT EXISTS idx_commit_batch      ON commit_log(batch_id);

        -- Set version = 1. On a fresh DB: insert 0 first, then update.
        INSERT INTO schema_version SELECT 0
            WHERE NOT EXISTS (SELECT 1 FROM schema_version);
        UPDATE schema_version SET version = 1 WHERE version < 1;
        ",
    )?;

    Ok(())
}

pub fn schema_version(conn: &rusqlite::Connection) -> anyhow::Result<u32> {
    let version: u32 = conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
        row.get(0)
    })?;
    Ok(version)
}
