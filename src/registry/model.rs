/// Dimensionality of face embeddings; fixed by the embedder model.
pub const EMBEDDING_DIM: usize = 512;

/// Cap on stored embeddings per person. Oldest `learned` vectors are evicted
/// first; the original reference seed is never evicted.
pub const MAX_EMBEDDINGS_PER_PERSON: usize = 10;

/// A mean whose norm falls below this is considered degenerate; the centroid
/// then falls back to the most recent embedding.
pub const CENTROID_NORM_FLOOR: f32 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Reference,
    Learned,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Reference => "reference",
            SourceType::Learned => "learned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reference" => Some(SourceType::Reference),
            "learned" => Some(SourceType::Learned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Person {
    pub person_id: i64,
    pub display_name: String,
    pub output_folder_rel: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct PersonEmbedding {
    pub embedding_id: i64,
    pub person_id: i64,
    pub vector: Vec<f32>,
    pub source_type: SourceType,
    pub created_at: String,
}

/// Derived matching target: unit-norm mean of a person's current embeddings.
#[derive(Debug, Clone)]
pub struct PersonCentroid {
    pub person_id: i64,
    pub centroid: Vec<f32>,
    pub embedding_count: i64,
}

/// Normalise `v` to unit length in place. Returns the original norm.
/// A zero vector is left untouched.
pub fn l2_normalize(v: &mut [f32]) -> f32 {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    norm
}

pub fn vector_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn blob_to_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Output folders are a single path component: non-empty, no separators,
/// no traversal.
pub fn is_valid_folder_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && !s.contains('/')
        && !s.contains('\\')
        && !s.contains('\0')
}
