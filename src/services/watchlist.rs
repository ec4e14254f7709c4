use crate::db::models::watchlist_models::{Person, PersonUpdate, WatchlistEntry, WatchlistGroup};
use crate::db::repositories::watchlist::WatchlistRepository;
use crate::error::Error;
use crate::recognition::{DetectionEngine, Gallery, WatchlistGallery};
use crate::services::compare::face_embedding;
use crate::store::UploadStore;
use anyhow::Result;
use bytes::Bytes;
use log::info;
use std::sync::Arc;

const WATCHLIST_DIR: &str = "watchlist";

/// Enrolment and maintenance of watchlist persons.
///
/// Every change to enrolled embeddings rebuilds the in-memory gallery and
/// swaps it in whole; recognition calls already holding the old snapshot
/// finish with it.
pub struct WatchlistService {
    repo: WatchlistRepository,
    gallery: Arc<WatchlistGallery>,
    engine: DetectionEngine,
    uploads: UploadStore,
}

impl WatchlistService {
    pub fn new(
        repo: WatchlistRepository,
        gallery: Arc<WatchlistGallery>,
        engine: DetectionEngine,
        uploads: UploadStore,
    ) -> Self {
        Self {
            repo,
            gallery,
            engine,
            uploads,
        }
    }

    /// Rebuild the gallery from the database; returns the embedding count
    pub async fn reload_gallery(&self) -> Result<usize> {
        let gallery = Gallery::from_rows(self.repo.load_embeddings().await?);
        let count = gallery.len();
        self.gallery.replace(gallery);
        info!("Watchlist gallery holds {} embeddings", count);
        Ok(count)
    }

    pub async fn create_group(&self, name: &str) -> Result<WatchlistGroup> {
        let name = required_name(name, "Group name")?;
        self.repo.create_group(&name).await
    }

    pub async fn groups(&self) -> Result<Vec<WatchlistGroup>> {
        self.repo.list_groups().await
    }

    pub async fn create_person(
        &self,
        name: &str,
        group_id: Option<i64>,
        note: Option<&str>,
    ) -> Result<Person> {
        let name = required_name(name, "Person name")?;
        self.check_group(group_id).await?;
        let person = self.repo.create_person(&name, group_id, note).await?;
        info!("Created watchlist person {} ({})", person.id, person.name);
        Ok(person)
    }

    pub async fn update_person(&self, id: i64, update: PersonUpdate) -> Result<()> {
        let update = PersonUpdate {
            name: match update.name {
                Some(name) => Some(required_name(&name, "Person name")?),
                None => None,
            },
            ..update
        };
        self.check_group(update.group_id).await?;

        if !self.repo.update_person(id, &update).await? {
            return Err(Error::NotFound(format!("Person {} not found", id)).into());
        }
        // names are copied into the gallery
        if update.name.is_some() {
            self.reload_gallery().await?;
        }
        Ok(())
    }

    /// Store an image of the person and enrol the embedding of its best
    /// face. Images without a face are rejected.
    pub async fn enroll(
        &self,
        person_id: i64,
        original_name: Option<&str>,
        bytes: Bytes,
    ) -> Result<String> {
        if self.repo.get_person(person_id).await?.is_none() {
            return Err(Error::NotFound(format!("Person {} not found", person_id)).into());
        }

        let embedding = face_embedding(self.engine.clone(), bytes.clone())
            .await?
            .ok_or_else(|| Error::Validation("No face found in image".to_string()))?;

        let relpath = self
            .uploads
            .save_image(
                WATCHLIST_DIR,
                &format!("person_{}", person_id),
                original_name,
                &bytes,
            )
            .await?;
        self.repo.add_image(person_id, &relpath, &embedding).await?;
        self.reload_gallery().await?;

        info!("Enrolled image {} for person {}", relpath, person_id);
        Ok(relpath)
    }

    /// Remove the person with every image and embedding
    pub async fn delete_person(&self, id: i64) -> Result<()> {
        let relpaths = self
            .repo
            .delete_person(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Person {} not found", id)))?;

        self.reload_gallery().await?;
        self.uploads.remove_files(&relpaths).await;
        info!("Deleted person {} and {} images", id, relpaths.len());
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<WatchlistEntry>> {
        self.repo.list_entries().await
    }

    async fn check_group(&self, group_id: Option<i64>) -> Result<()> {
        if let Some(group_id) = group_id {
            if !self.repo.group_exists(group_id).await? {
                return Err(Error::Validation(format!("Unknown group {}", group_id)).into());
            }
        }
        Ok(())
    }
}

fn required_name(name: &str, what: &str) -> Result<String, Error> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Validation(format!("{} is required", what)));
    }
    Ok(name.to_string())
}
