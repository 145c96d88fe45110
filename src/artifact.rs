//! Artifact persistence (Design Notes §9).
//!
//! `ArtifactStore::save` is the only write path the rest of the core
//! uses for session state, leaderboard files, and per-iteration prompt
//! and response dumps. The filesystem implementation writes to a
//! sibling temp file and renames over the destination, so a concurrent
//! reader always observes either the pre-write or the post-write bytes,
//! never a partial file (§8 artifact-atomicity invariant).

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save(&self, path: &Path, bytes: &[u8]) -> Result<()>;
    async fn load(&self, path: &Path) -> Result<Option<Vec<u8>>>;
}

/// Atomic-rename filesystem store.
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn save(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dest = self.resolve(path);
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || write_atomic(&dest, &bytes))
            .await
            .expect("blocking artifact write task panicked")
    }

    async fn load(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let dest = self.resolve(path);
        match tokio::fs::read(&dest).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ArtifactError::Io {
                path: dest.display().to_string(),
                source,
            }),
        }
    }
}

fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ArtifactError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let tmp_path = dest.with_extension(format!(
        "{}.tmp-{}",
        dest.extension().and_then(|e| e.to_str()).unwrap_or("bin"),
        std::process::id()
    ));
    std::fs::write(&tmp_path, bytes).map_err(|source| ArtifactError::Io {
        path: tmp_path.display().to_string(),
        source,
    })?;
    std::fs::rename(&tmp_path, dest).map_err(|source| ArtifactError::Io {
        path: dest.display().to_string(),
        source,
    })?;
    Ok(())
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    files: DashMap<PathBuf, Vec<u8>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn save(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        self.files.insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(self.files.get(path).map(|v| v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_roundtrips() {
        let store = InMemoryArtifactStore::new();
        store.save(Path::new("session.json"), b"{}").await.unwrap();
        let loaded = store.load(Path::new("session.json")).await.unwrap();
        assert_eq!(loaded, Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn filesystem_store_round_trips_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());
        store
            .save(Path::new("nested/session.json"), b"payload")
            .await
            .unwrap();
        let loaded = store.load(Path::new("nested/session.json")).await.unwrap();
        assert_eq!(loaded, Some(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let store = InMemoryArtifactStore::new();
        assert_eq!(store.load(Path::new("missing.json")).await.unwrap(), None);
    }
}
