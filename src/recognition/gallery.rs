use crate::db::models::watchlist_models::EnrolledEmbeddingRow;
use crate::recognition::cosine_similarity;
use log::warn;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub person_id: i64,
    pub person_name: String,
    pub embedding: Vec<f32>,
}

/// Immutable set of enrolled embeddings, in enrolment order
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    /// Build from stored rows, skipping embeddings that fail to decode
    pub fn from_rows(rows: Vec<EnrolledEmbeddingRow>) -> Self {
        let entries = rows
            .into_iter()
            .filter_map(|row| match serde_json::from_str::<Vec<f32>>(&row.embedding) {
                Ok(embedding) => Some(GalleryEntry {
                    person_id: row.person_id,
                    person_name: row.person_name,
                    embedding,
                }),
                Err(e) => {
                    warn!("Skipping unreadable embedding of image {}: {}", row.image_id, e);
                    None
                }
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn contains_person(&self, person_id: i64) -> bool {
        self.entries.iter().any(|e| e.person_id == person_id)
    }

    /// Most similar entry. Strict comparison keeps the earliest on ties.
    pub fn best_match(&self, embedding: &[f32]) -> Option<(&GalleryEntry, f32)> {
        let mut best: Option<(&GalleryEntry, f32)> = None;
        for entry in &self.entries {
            let similarity = cosine_similarity(embedding, &entry.embedding);
            if best.map_or(true, |(_, s)| similarity > s) {
                best = Some((entry, similarity));
            }
        }
        best
    }
}

/// Holder of the current gallery. Readers clone the `Arc` and keep using
/// their snapshot while enrolment swaps in a new one.
#[derive(Default)]
pub struct WatchlistGallery {
    current: RwLock<Arc<Gallery>>,
}

impl WatchlistGallery {
    pub fn new(gallery: Gallery) -> Self {
        Self {
            current: RwLock::new(Arc::new(gallery)),
        }
    }

    pub fn snapshot(&self) -> Arc<Gallery> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, gallery: Gallery) {
        let next = Arc::new(gallery);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(person_id: i64, embedding: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            person_id,
            person_name: format!("p{}", person_id),
            embedding,
        }
    }

    #[test]
    fn ties_keep_first_enrolled() {
        let gallery = Gallery::new(vec![entry(7, vec![1.0, 0.0]), entry(8, vec![1.0, 0.0])]);
        let (best, sim) = gallery.best_match(&[1.0, 0.0]).unwrap();
        assert_eq!(best.person_id, 7);
        assert_eq!(sim, 1.0);
    }

    #[test]
    fn snapshot_survives_replace() {
        let holder = WatchlistGallery::new(Gallery::new(vec![entry(1, vec![1.0, 0.0])]));
        let before = holder.snapshot();

        holder.replace(Gallery::default());

        assert_eq!(before.len(), 1);
        assert!(holder.snapshot().is_empty());
    }

    #[test]
    fn rows_with_bad_json_are_skipped() {
        let rows = vec![
            EnrolledEmbeddingRow {
                image_id: 1,
                person_id: 1,
                person_name: "Alice".to_string(),
                embedding: "[0.6, 0.8]".to_string(),
            },
            EnrolledEmbeddingRow {
                image_id: 2,
                person_id: 2,
                person_name: "Bob".to_string(),
                embedding: "not json".to_string(),
            },
        ];
        let gallery = Gallery::from_rows(rows);
        assert_eq!(gallery.len(), 1);
        assert!(gallery.contains_person(1));
        assert!(!gallery.contains_person(2));
    }
}
