use crate::error::{EngineError, Result};
use crate::registry::model::{
    blob_to_vector, is_valid_folder_component, l2_normalize, vector_to_blob, Person,
    PersonCentroid, PersonEmbedding, SourceType, CENTROID_NORM_FLOOR, EMBEDDING_DIM,
    MAX_EMBEDDINGS_PER_PERSON,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

// ── Private helpers ───────────────────────────────────────────────────────────

/// Execute a prepared statement, collect all rows with `f`, and return a Vec.
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

fn validated_unit_vector(vector: &[f32]) -> Result<Vec<f32>> {
    if vector.len() != EMBEDDING_DIM {
        return Err(EngineError::Registry(format!(
            "embedding must have {} dimensions, got {}",
            EMBEDDING_DIM,
            vector.len()
        )));
    }
    let mut v = vector.to_vec();
    let norm = l2_normalize(&mut v);
    if norm <= 0.0 || !norm.is_finite() {
        return Err(EngineError::Registry(
            "embedding vector has zero or non-finite norm".into(),
        ));
    }
    Ok(v)
}

fn embeddings_in_tx(tx: &Transaction<'_>, person_id: i64) -> Result<Vec<PersonEmbedding>> {
    let mut stmt = tx.prepare(
        "SELECT embedding_id, person_id, vector, source_type, created_at
           FROM person_embeddings
          WHERE person_id = ?1
          ORDER BY embedding_id ASC",
    )?;
    let rows = stmt.query_map(params![person_id], |row| {
        let blob: Vec<u8> = row.get(2)?;
        let source: String = row.get(3)?;
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            blob,
            source,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (embedding_id, person_id, blob, source, created_at) = row?;
        let vector = blob_to_vector(&blob).ok_or_else(|| {
            EngineError::Registry(format!("embedding {} has a malformed vector", embedding_id))
        })?;
        let source_type = SourceType::parse(&source).ok_or_else(|| {
            EngineError::Registry(format!("embedding {} has source_type {}", embedding_id, source))
        })?;
        out.push(PersonEmbedding {
            embedding_id,
            person_id,
            vector,
            source_type,
            created_at,
        });
    }
    Ok(out)
}

/// FIFO eviction down to the cap. Oldest `learned` rows go first; references
/// are only evicted after all learned rows, and the person's original
/// reference seed (lowest reference embedding_id) survives unconditionally.
fn evict_over_cap(tx: &Transaction<'_>, person_id: i64) -> Result<()> {
    loop {
        let embeddings = embeddings_in_tx(tx, person_id)?;
        if embeddings.len() <= MAX_EMBEDDINGS_PER_PERSON {
            return Ok(());
        }

        let seed_id = embeddings
            .iter()
            .find(|e| e.source_type == SourceType::Reference)
            .map(|e| e.embedding_id);

        let victim = embeddings
            .iter()
            .find(|e| e.source_type == SourceType::Learned)
            .or_else(|| {
                embeddings
                    .iter()
                    .find(|e| e.source_type == SourceType::Reference && Some(e.embedding_id) != seed_id)
            })
            .map(|e| e.embedding_id);

        match victim {
            Some(id) => {
                tx.execute(
                    "DELETE FROM person_embeddings WHERE embedding_id = ?1",
                    params![id],
                )?;
            }
            // Only the seed is left; nothing evictable.
            None => return Ok(()),
        }
    }
}

/// Recompute the centroid from the person's current embeddings and upsert it.
/// Runs inside the same transaction as the embedding mutation.
fn refresh_centroid(tx: &Transaction<'_>, person_id: i64) -> Result<()> {
    let embeddings = embeddings_in_tx(tx, person_id)?;
    if embeddings.is_empty() {
        tx.execute(
            "DELETE FROM person_centroids WHERE person_id = ?1",
            params![person_id],
        )?;
        return Ok(());
    }

    let mut mean = vec![0.0f32; EMBEDDING_DIM];
    for e in &embeddings {
        for (m, x) in mean.iter_mut().zip(e.vector.iter()) {
            *m += x;
        }
    }
    let n = embeddings.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }

    let norm = l2_normalize(&mut mean);
    if norm < CENTROID_NORM_FLOOR {
        // Degenerate mean; fall back to the most recent embedding.
        mean = embeddings
            .last()
            .map(|e| e.vector.clone())
            .unwrap_or(mean);
    }

    tx.execute(
        "INSERT INTO person_centroids (person_id, centroid, embedding_count)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(person_id) DO UPDATE SET
             centroid = excluded.centroid,
             embedding_count = excluded.embedding_count",
        params![person_id, vector_to_blob(&mean), embeddings.len() as i64],
    )?;
    Ok(())
}

fn insert_embedding_tx(
    tx: &Transaction<'_>,
    person_id: i64,
    vector: &[f32],
    source_type: SourceType,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO person_embeddings (person_id, vector, source_type, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![person_id, vector_to_blob(vector), source_type.as_str(), now],
    )?;
    evict_over_cap(tx, person_id)?;
    refresh_centroid(tx, person_id)?;
    tx.execute(
        "UPDATE persons SET updated_at = ?1 WHERE person_id = ?2",
        params![now, person_id],
    )?;
    Ok(())
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Create a person with their first reference embedding. The centroid is
/// computed in the same transaction.
pub fn add_person(
    conn: &mut Connection,
    display_name: &str,
    output_folder_rel: &str,
    reference: &[f32],
) -> Result<i64> {
    if display_name.trim().is_empty() {
        return Err(EngineError::Registry("display_name must not be empty".into()));
    }
    if !is_valid_folder_component(output_folder_rel) {
        return Err(EngineError::Registry(format!(
            "output folder {:?} must be a single non-empty path component",
            output_folder_rel
        )));
    }
    let vector = validated_unit_vector(reference)?;

    let tx = conn.transaction()?;
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO persons (display_name, output_folder_rel, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)",
        params![display_name, output_folder_rel, now],
    )?;
    let person_id = tx.last_insert_rowid();
    insert_embedding_tx(&tx, person_id, &vector, SourceType::Reference)?;
    tx.commit()?;

    tracing::info!(
        "registry: added person {} ({}) -> {}",
        person_id,
        display_name,
        output_folder_rel
    );
    Ok(person_id)
}

/// Add an additional curated reference embedding for an existing person.
pub fn add_reference(conn: &mut Connection, person_id: i64, vector: &[f32]) -> Result<()> {
    let vector = validated_unit_vector(vector)?;
    let tx = conn.transaction()?;
    require_person(&tx, person_id)?;
    insert_embedding_tx(&tx, person_id, &vector, SourceType::Reference)?;
    tx.commit()?;
    Ok(())
}

/// Record a STRICT-match embedding for a person. Used only by the matcher.
pub fn learn(conn: &mut Connection, person_id: i64, vector: &[f32]) -> Result<()> {
    let vector = validated_unit_vector(vector)?;
    let tx = conn.transaction()?;
    require_person(&tx, person_id)?;
    insert_embedding_tx(&tx, person_id, &vector, SourceType::Learned)?;
    tx.commit()?;
    tracing::debug!("registry: learned embedding for person {}", person_id);
    Ok(())
}

fn require_person(tx: &Transaction<'_>, person_id: i64) -> Result<()> {
    let exists: Option<i64> = tx
        .query_row(
            "SELECT person_id FROM persons WHERE person_id = ?1",
            params![person_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(EngineError::Registry(format!("no person with id {}", person_id)));
    }
    Ok(())
}

pub fn list_persons(conn: &Connection) -> rusqlite::Result<Vec<Person>> {
    collect_rows(
        conn,
        "SELECT person_id, display_name, output_folder_rel, created_at, updated_at
           FROM persons ORDER BY person_id ASC",
        [],
        |row| {
            Ok(Person {
                person_id: row.get(0)?,
                display_name: row.get(1)?,
                output_folder_rel: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        },
    )
}

pub fn person_by_id(conn: &Connection, person_id: i64) -> rusqlite::Result<Option<Person>> {
    conn.query_row(
        "SELECT person_id, display_name, output_folder_rel, created_at, updated_at
           FROM persons WHERE person_id = ?1",
        params![person_id],
        |row| {
            Ok(Person {
                person_id: row.get(0)?,
                display_name: row.get(1)?,
                output_folder_rel: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        },
    )
    .optional()
}

/// Snapshot of centroids, restricted to `selected` person ids when given.
/// Ordered by person_id so exact distance ties break to the lowest id.
pub fn centroids(conn: &Connection, selected: Option<&[i64]>) -> Result<Vec<PersonCentroid>> {
    let rows = collect_rows(
        conn,
        "SELECT person_id, centroid, embedding_count
           FROM person_centroids ORDER BY person_id ASC",
        [],
        |row| {
            let blob: Vec<u8> = row.get(1)?;
            Ok((row.get::<_, i64>(0)?, blob, row.get::<_, i64>(2)?))
        },
    )?;

    let mut out = Vec::new();
    for (person_id, blob, embedding_count) in rows {
        if let Some(ids) = selected {
            if !ids.contains(&person_id) {
                continue;
            }
        }
        let centroid = blob_to_vector(&blob).ok_or_else(|| {
            EngineError::Registry(format!("centroid for person {} is malformed", person_id))
        })?;
        out.push(PersonCentroid {
            person_id,
            centroid,
            embedding_count,
        });
    }
    Ok(out)
}

pub fn embeddings_for_person(
    conn: &Connection,
    person_id: i64,
) -> rusqlite::Result<Vec<(i64, String)>> {
    collect_rows(
        conn,
        "SELECT embedding_id, source_type FROM person_embeddings
          WHERE person_id = ?1 ORDER BY embedding_id ASC",
        params![person_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
}

/// Delete a person and their embeddings/centroid. Refused while any commit-log
/// row references the person: committed output must stay attributable.
pub fn delete_person(conn: &mut Connection, person_id: i64) -> Result<()> {
    let tx = conn.transaction()?;
    let referenced: i64 = tx.query_row(
        "SELECT COUNT(*) FROM commit_log WHERE person_id = ?1",
        params![person_id],
        |row| row.get(0),
    )?;
    if referenced > 0 {
        return Err(EngineError::Registry(format!(
            "person {} is referenced by {} commit-log rows",
            person_id, referenced
        )));
    }
    tx.execute(
        "DELETE FROM person_centroids WHERE person_id = ?1",
        params![person_id],
    )?;
    tx.execute(
        "DELETE FROM person_embeddings WHERE person_id = ?1",
        params![person_id],
    )?;
    let deleted = tx.execute("DELETE FROM persons WHERE person_id = ?1", params![person_id])?;
    if deleted == 0 {
        return Err(EngineError::Registry(format!("no person with id {}", person_id)));
    }
    tx.commit()?;
    tracing::info!("registry: deleted person {}", person_id);
    Ok(())
}
