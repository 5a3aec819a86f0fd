use crate::engine::analyze::Face;
use crate::error::Result;
use crate::registry::model::PersonCentroid;
use crate::registry::repository as registry;
use rusqlite::Connection;
use std::collections::BTreeSet;

/// Distance bands on L2-normalised embeddings. Because both vectors are
/// unit-norm, d^2 = 2 * (1 - cos theta), so d ranges over [0, 2].
pub const STRICT_THRESHOLD: f32 = 0.80;
pub const LOOSE_THRESHOLD: f32 = 1.00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchBand {
    /// d* <= 0.80: match and learn the embedding.
    Strict,
    /// 0.80 < d* <= 1.00: match, do not learn.
    Loose,
    /// d* > 1.00: no output contribution.
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct FaceMatch {
    pub person_id: i64,
    pub distance: f32,
    pub band: MatchBand,
}

/// Euclidean distance between two vectors of equal length.
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Classify one face embedding against a centroid snapshot.
///
/// The snapshot must be ordered by ascending person_id (the registry
/// guarantees this); a strict `<` scan then breaks exact ties to the lowest
/// person_id. Returns None when the snapshot is empty.
pub fn classify(embedding: &[f32], centroids: &[PersonCentroid]) -> Option<FaceMatch> {
    let mut best: Option<(i64, f32)> = None;
    for c in centroids {
        let d = euclidean(embedding, &c.centroid);
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((c.person_id, d)),
        }
    }

    let (person_id, distance) = best?;
    let band = if distance <= STRICT_THRESHOLD {
        MatchBand::Strict
    } else if distance <= LOOSE_THRESHOLD {
        MatchBand::Loose
    } else {
        MatchBand::Unknown
    };
    Some(FaceMatch {
        person_id,
        distance,
        band,
    })
}

/// Per-image aggregation of face matches.
#[derive(Debug, Default, Clone)]
pub struct ImageMatches {
    pub face_count: i64,
    pub matched_count: i64,
    pub unknown_count: i64,
    /// Union of matched persons across faces, ascending, deduplicated.
    pub matched_person_ids: Vec<i64>,
}

/// Match every face of an image against the selected centroids and apply the
/// learning rule: STRICT appends the embedding to the winner (FIFO cap and
/// centroid refresh happen inside the registry transaction), LOOSE matches
/// without learning, UNKNOWN contributes nothing.
///
/// The snapshot is taken at call time, so learning from an earlier image in
/// the batch influences later images.
pub fn match_faces(
    conn: &mut Connection,
    faces: &[Face],
    selected: Option<&[i64]>,
) -> Result<ImageMatches> {
    let centroids = registry::centroids(conn, selected)?;

    let mut result = ImageMatches {
        face_count: faces.len() as i64,
        ..Default::default()
    };
    let mut matched: BTreeSet<i64> = BTreeSet::new();

    for face in faces {
        match classify(&face.embedding, &centroids) {
            Some(m) if m.band == MatchBand::Strict => {
                matched.insert(m.person_id);
                result.matched_count += 1;
                registry::learn(conn, m.person_id, &face.embedding)?;
                tracing::debug!(
                    "matcher: strict match person {} (d={:.3})",
                    m.person_id,
                    m.distance
                );
            }
            Some(m) if m.band == MatchBand::Loose => {
                matched.insert(m.person_id);
                result.matched_count += 1;
                tracing::debug!(
                    "matcher: loose match person {} (d={:.3})",
                    m.person_id,
                    m.distance
                );
            }
            _ => {
                result.unknown_count += 1;
            }
        }
    }

    result.matched_person_ids = matched.into_iter().collect();
    Ok(result)
}

/// Group-mode routing: the image goes to the single group folder when the
/// matched set covers every selected person.
pub fn covers_selected(matched: &[i64], selected: &[i64]) -> bool {
    selected.iter().all(|id| matched.contains(id))
}
