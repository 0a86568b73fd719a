// src/session.rs

use crate::models::SessionMetadata;
use crate::planner::validate_plan;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session file {} is unusable: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
}

/// Stable key for a session: SHA-256 of the source URL and destination path.
pub fn session_key(url: &str, destination: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(destination.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stores session metadata as one pretty-printed JSON file per session under
/// a directory. Files are safe to delete to force a fresh download.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Load and sanity-check the session stored under `key`.
    /// Returns `Ok(None)` if there is no session file.
    pub async fn load(&self, key: &str) -> Result<Option<SessionMetadata>, SessionError> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: SessionMetadata = serde_json::from_slice(&data).map_err(|e| SessionError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        validate_plan(&meta.chunks, meta.token.size)
            .map_err(|reason| SessionError::Corrupt { path: path.clone(), reason })?;
        if meta.segments.len() != meta.chunks.len() {
            return Err(SessionError::Corrupt {
                path,
                reason: format!(
                    "{} segment paths for {} chunks",
                    meta.segments.len(),
                    meta.chunks.len()
                ),
            });
        }
        Ok(Some(meta))
    }

    /// Write the session atomically (temp file + rename).
    pub async fn save(&self, key: &str, meta: &SessionMetadata) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        let data = serde_json::to_vec_pretty(meta)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Delete the session file; a missing file is not an error.
    pub async fn remove(&self, key: &str) -> Result<(), SessionError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResourceDescriptor, ValidationToken};
    use crate::planner::plan_chunks;
    use tempfile::tempdir;

    fn sample(dir: &Path) -> (String, SessionMetadata) {
        let res = ResourceDescriptor::new("http://example.test/a.bin", dir.join("a.bin"));
        let token = ValidationToken { size: 1000, tag: Some("\"v1\"".to_string()) };
        let meta = SessionMetadata::new(&res, token, true, plan_chunks(1000, 4));
        (session_key(&res.url, &res.destination), meta)
    }

    #[test]
    fn key_depends_on_url_and_destination() {
        let a = session_key("http://h/x", Path::new("/d/x"));
        assert_eq!(a, session_key("http://h/x", Path::new("/d/x")));
        assert_ne!(a, session_key("http://h/y", Path::new("/d/x")));
        assert_ne!(a, session_key("http://h/x", Path::new("/d/y")));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn save_load_remove() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        let (key, meta) = sample(dir.path());

        assert!(store.load(&key).await.unwrap().is_none());
        store.save(&key, &meta).await.unwrap();

        let loaded = store.load(&key).await.unwrap().expect("session present");
        assert_eq!(loaded.chunks, meta.chunks);
        assert_eq!(loaded.segments, meta.segments);
        assert_eq!(loaded.token, meta.token);

        let text = std::fs::read_to_string(store.path_for(&key)).unwrap();
        assert!(text.contains("\"chunks\""), "session file should be readable JSON");

        store.remove(&key).await.unwrap();
        assert!(store.load(&key).await.unwrap().is_none());
        store.remove(&key).await.unwrap();
    }

    #[tokio::test]
    async fn unreadable_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        std::fs::write(store.path_for("k"), b"{ not json").unwrap();
        let err = store.load("k").await.unwrap_err();
        assert!(matches!(err, SessionError::Corrupt { .. }), "{err}");
    }

    #[tokio::test]
    async fn inconsistent_plan_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let (key, mut meta) = sample(dir.path());
        meta.chunks[2].start += 1;
        store.save(&key, &meta).await.unwrap();
        assert!(matches!(
            store.load(&key).await,
            Err(SessionError::Corrupt { .. })
        ));
    }
}
