use crate::db::models::watchlist_models::{
    EnrolledEmbeddingRow, Person, PersonImageRow, PersonUpdate, WatchlistEntry, WatchlistGroup,
};
use crate::db::now_millis;
use crate::error::Error;
use anyhow::Result;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Groups, persons and their enrolled face images
#[derive(Clone)]
pub struct WatchlistRepository {
    pool: Arc<SqlitePool>,
}

impl WatchlistRepository {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub async fn create_group(&self, name: &str) -> Result<WatchlistGroup> {
        let existing = sqlx::query_scalar::<_, i64>("SELECT id FROM watchlist_groups WHERE name = ?")
            .bind(name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to look up group: {}", e)))?;
        if existing.is_some() {
            return Err(Error::Validation(format!("Group already exists: {}", name)).into());
        }

        let now = now_millis();
        let result = sqlx::query("INSERT INTO watchlist_groups (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to create group: {}", e)))?;

        Ok(WatchlistGroup {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            created_at: now,
        })
    }

    pub async fn list_groups(&self) -> Result<Vec<WatchlistGroup>> {
        let groups = sqlx::query_as::<_, WatchlistGroup>(
            "SELECT id, name, created_at FROM watchlist_groups ORDER BY name",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list groups: {}", e)))?;

        Ok(groups)
    }

    pub async fn group_exists(&self, id: i64) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT id FROM watchlist_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to look up group: {}", e)))?;

        Ok(found.is_some())
    }

    pub async fn create_person(
        &self,
        name: &str,
        group_id: Option<i64>,
        note: Option<&str>,
    ) -> Result<Person> {
        let now = now_millis();
        let result = sqlx::query(
            "INSERT INTO persons (name, group_id, note, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(group_id)
        .bind(note)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create person: {}", e)))?;

        Ok(Person {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            group_id,
            note: note.map(str::to_string),
            created_at: now,
        })
    }

    pub async fn get_person(&self, id: i64) -> Result<Option<Person>> {
        let person = sqlx::query_as::<_, Person>(
            "SELECT id, name, group_id, note, created_at FROM persons WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get person: {}", e)))?;

        Ok(person)
    }

    /// Apply the fields present in `update`
    pub async fn update_person(&self, id: i64, update: &PersonUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE persons SET
                name = COALESCE(?, name),
                group_id = COALESCE(?, group_id),
                note = COALESCE(?, note)
            WHERE id = ?
            "#,
        )
        .bind(&update.name)
        .bind(update.group_id)
        .bind(&update.note)
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update person: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a person together with every enrolled image. Returns the image
    /// paths so the caller can remove the files, or `None` when the person
    /// does not exist.
    pub async fn delete_person(&self, id: i64) -> Result<Option<Vec<String>>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to start transaction: {}", e)))?;

        let relpaths: Vec<String> =
            sqlx::query_scalar("SELECT relpath FROM person_images WHERE person_id = ?")
                .bind(id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| Error::Database(format!("Failed to list person images: {}", e)))?;

        sqlx::query("DELETE FROM person_images WHERE person_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete person images: {}", e)))?;

        let deleted = sqlx::query("DELETE FROM persons WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete person: {}", e)))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit person delete: {}", e)))?;

        if deleted == 0 {
            return Ok(None);
        }

        info!("Deleted person {} with {} images", id, relpaths.len());
        Ok(Some(relpaths))
    }

    pub async fn add_image(&self, person_id: i64, relpath: &str, embedding: &[f32]) -> Result<i64> {
        let encoded = serde_json::to_string(embedding)?;
        let result = sqlx::query(
            "INSERT INTO person_images (person_id, relpath, embedding, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(person_id)
        .bind(relpath)
        .bind(encoded)
        .bind(now_millis())
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to add person image: {}", e)))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn images_of(&self, person_id: i64) -> Result<Vec<PersonImageRow>> {
        let rows = sqlx::query_as::<_, PersonImageRow>(
            "SELECT id, person_id, relpath, embedding, created_at FROM person_images \
             WHERE person_id = ? ORDER BY id",
        )
        .bind(person_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list person images: {}", e)))?;

        Ok(rows)
    }

    /// Every person with image counts, ordered by name
    pub async fn list_entries(&self) -> Result<Vec<WatchlistEntry>> {
        let persons = sqlx::query_as::<_, Person>(
            "SELECT id, name, group_id, note, created_at FROM persons ORDER BY name, id",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list persons: {}", e)))?;

        let images: Vec<(i64, String)> =
            sqlx::query_as("SELECT person_id, relpath FROM person_images ORDER BY id")
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| Error::Database(format!("Failed to list person images: {}", e)))?;

        let mut by_person: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for (person_id, relpath) in images {
            by_person.entry(person_id).or_default().push(relpath);
        }

        Ok(persons
            .into_iter()
            .map(|person| {
                let images = by_person.remove(&person.id).unwrap_or_default();
                WatchlistEntry {
                    person_id: person.id,
                    person_name: person.name,
                    group_id: person.group_id,
                    note: person.note,
                    embeddings: images.len(),
                    thumb_relpath: images.first().cloned(),
                    images,
                }
            })
            .collect())
    }

    /// All enrolled embeddings with their owner's name
    pub async fn load_embeddings(&self) -> Result<Vec<EnrolledEmbeddingRow>> {
        let rows = sqlx::query_as::<_, EnrolledEmbeddingRow>(
            r#"
            SELECT pi.id AS image_id, p.id AS person_id, p.name AS person_name, pi.embedding
            FROM person_images pi
            JOIN persons p ON p.id = pi.person_id
            ORDER BY pi.id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load embeddings: {}", e)))?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn groups_are_unique() {
        let repo = WatchlistRepository::new(Arc::new(test_pool().await));
        let group = repo.create_group("Staff").await.unwrap();
        assert!(repo.group_exists(group.id).await.unwrap());
        assert!(repo.create_group("Staff").await.is_err());
        assert_eq!(repo.list_groups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_person_removes_images() {
        let repo = WatchlistRepository::new(Arc::new(test_pool().await));
        let alice = repo.create_person("Alice", None, None).await.unwrap();
        let bob = repo.create_person("Bob", None, Some("night shift")).await.unwrap();
        repo.add_image(alice.id, "images/a1.jpg", &[1.0, 0.0]).await.unwrap();
        repo.add_image(alice.id, "images/a2.jpg", &[0.0, 1.0]).await.unwrap();
        repo.add_image(bob.id, "images/b1.jpg", &[0.6, 0.8]).await.unwrap();

        let removed = repo.delete_person(alice.id).await.unwrap().unwrap();
        assert_eq!(removed, vec!["images/a1.jpg", "images/a2.jpg"]);

        let embeddings = repo.load_embeddings().await.unwrap();
        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings[0].person_name, "Bob");
        assert!(repo.images_of(alice.id).await.unwrap().is_empty());
        assert!(repo.delete_person(alice.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_update() {
        let repo = WatchlistRepository::new(Arc::new(test_pool().await));
        let group = repo.create_group("VIP").await.unwrap();
        let person = repo.create_person("Carol", None, Some("front desk")).await.unwrap();

        let update = PersonUpdate {
            group_id: Some(group.id),
            ..Default::default()
        };
        assert!(repo.update_person(person.id, &update).await.unwrap());

        let person = repo.get_person(person.id).await.unwrap().unwrap();
        assert_eq!(person.name, "Carol");
        assert_eq!(person.group_id, Some(group.id));
        assert_eq!(person.note.as_deref(), Some("front desk"));

        let entries = repo.list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].embeddings, 0);
        assert!(entries[0].thumb_relpath.is_none());
    }
}
