use crate::config::StorageConfig;
use crate::error::Error;
use crate::media::imaging::resolve_relpath;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use uuid::Uuid;

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]+").unwrap());

/// Filesystem-safe version of a user supplied name, never empty
pub fn safe_name(name: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(name.trim(), "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.chars().take(64).collect()
    }
}

/// Lower-case extension of an uploaded file name, or `default`
fn extension(original_name: Option<&str>, default: &str) -> String {
    original_name
        .and_then(|name| Path::new(name).extension())
        .map(|ext| safe_name(&ext.to_string_lossy()).to_lowercase())
        .filter(|ext| ext.len() <= 5)
        .unwrap_or_else(|| default.to_string())
}

/// Where uploaded images and videos are kept
#[derive(Debug, Clone)]
pub struct UploadStore {
    data_dir: PathBuf,
    uploads_dir: PathBuf,
}

impl UploadStore {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            data_dir: storage.data_dir.clone(),
            uploads_dir: storage.uploads_dir.clone(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    /// Store image bytes under `data_dir/<subdir>`; returns the relative path
    pub async fn save_image(
        &self,
        subdir: &str,
        prefix: &str,
        original_name: Option<&str>,
        bytes: &[u8],
    ) -> Result<String> {
        let dir = self.data_dir.join(subdir);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Io(format!("Failed to create {}: {}", dir.display(), e)))?;

        let name = format!(
            "{}_{}.{}",
            safe_name(prefix),
            &Uuid::new_v4().simple().to_string()[..8],
            extension(original_name, "jpg")
        );
        tokio::fs::write(dir.join(&name), bytes)
            .await
            .map_err(|e| Error::Io(format!("Failed to store image {}: {}", name, e)))?;

        Ok(format!("{}/{}", subdir, name))
    }

    /// Store an uploaded video and return its absolute location
    pub async fn save_video(&self, original_name: Option<&str>, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.uploads_dir).await.map_err(|e| {
            Error::Io(format!(
                "Failed to create {}: {}",
                self.uploads_dir.display(),
                e
            ))
        })?;

        let stem = original_name
            .and_then(|name| Path::new(name).file_stem())
            .map(|s| safe_name(&s.to_string_lossy()))
            .unwrap_or_else(|| "video".to_string());
        let name = format!(
            "{}_{}.{}",
            stem,
            &Uuid::new_v4().simple().to_string()[..8],
            extension(original_name, "mp4")
        );
        let path = self.uploads_dir.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::Io(format!("Failed to store video: {}", e)))?;

        Ok(path)
    }

    /// Absolute path of a stored relative path
    pub fn data_path(&self, relpath: &str) -> Result<PathBuf> {
        Ok(resolve_relpath(&self.data_dir, relpath)?)
    }

    /// Best effort removal of stored files
    pub async fn remove_files(&self, relpaths: &[String]) {
        for relpath in relpaths {
            if let Ok(path) = resolve_relpath(&self.data_dir, relpath) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    log::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Names of uploaded videos, newest first
    pub async fn list_videos(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.uploads_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(format!("Failed to list uploads: {}", e)).into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Io(format!("Failed to list uploads: {}", e)))?
        {
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified = metadata.modified().ok();
            files.push((modified, entry.file_name().to_string_lossy().into_owned()));
        }
        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        Ok(files.into_iter().map(|(_, name)| name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> UploadStore {
        UploadStore::new(&StorageConfig {
            data_dir: dir.join("data"),
            uploads_dir: dir.join("uploads"),
            save_full_frames: true,
        })
    }

    #[test]
    fn names_are_sanitised() {
        assert_eq!(safe_name("../../etc/passwd"), "etc_passwd");
        assert_eq!(safe_name("cam 1"), "cam_1");
        assert_eq!(safe_name("///"), "file");
        assert_eq!(extension(Some("clip.MP4"), "bin"), "mp4");
        assert_eq!(extension(None, "jpg"), "jpg");
    }

    #[tokio::test]
    async fn images_and_videos_land_in_their_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let relpath = store
            .save_image("watchlist", "person_3", Some("face.png"), b"png")
            .await
            .unwrap();
        assert!(relpath.starts_with("watchlist/person_3_"));
        assert!(relpath.ends_with(".png"));
        assert!(store.data_path(&relpath).unwrap().exists());

        let video = store.save_video(Some("door cam.mp4"), b"mp4").await.unwrap();
        assert!(video.starts_with(dir.path().join("uploads")));
        assert_eq!(store.list_videos().await.unwrap().len(), 1);

        store.remove_files(&[relpath.clone()]).await;
        assert!(!store.data_path(&relpath).unwrap().exists());
    }
}
