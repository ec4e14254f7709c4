use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WatchlistGroup {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub group_id: Option<i64>,
    pub note: Option<String>,
    pub created_at: i64,
}

/// One enrolled image of a person; the embedding column holds a JSON array.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PersonImageRow {
    pub id: i64,
    pub person_id: i64,
    pub relpath: String,
    pub embedding: String,
    pub created_at: i64,
}

/// Enrolled image joined with its owner, as loaded into the gallery
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnrolledEmbeddingRow {
    pub image_id: i64,
    pub person_id: i64,
    pub person_name: String,
    pub embedding: String,
}

/// Watchlist listing entry
#[derive(Debug, Clone, Serialize)]
pub struct WatchlistEntry {
    pub person_id: i64,
    pub person_name: String,
    pub group_id: Option<i64>,
    pub note: Option<String>,
    /// Number of enrolled embeddings
    pub embeddings: usize,
    pub images: Vec<String>,
    pub thumb_relpath: Option<String>,
}

/// Partial update of a person
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonUpdate {
    pub name: Option<String>,
    pub group_id: Option<i64>,
    pub note: Option<String>,
}
