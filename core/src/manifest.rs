//! Per-session File Manifest: a persisted `{file_id -> filename}` mapping
//! rooted at a session's working directory. Every mutating operation
//! rewrites the whole document atomically (write-temp-then-rename); a
//! malformed document on disk fails open to an empty manifest.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use tracing::warn;
use uuid::Uuid;

pub const MANIFEST_FILENAME: &str = ".session_files.json";

#[derive(Debug)]
pub struct FileManifest {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileManifest {
    /// Load the manifest rooted at `workdir`, failing open to an empty one
    /// on any read or parse error.
    pub async fn load(workdir: &Path) -> Self {
        let path = workdir.join(MANIFEST_FILENAME);
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, String>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed session manifest, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn has(&self, file_id: &str) -> bool {
        self.entries.contains_key(file_id)
    }

    pub fn name_of(&self, file_id: &str) -> Option<&str> {
        self.entries.get(file_id).map(String::as_str)
    }

    pub fn all(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub async fn put(&mut self, file_id: impl Into<String>, filename: impl Into<String>) -> std::io::Result<()> {
        self.entries.insert(file_id.into(), filename.into());
        self.persist().await
    }

    pub async fn remove(&mut self, file_id: &str) -> std::io::Result<()> {
        self.entries.remove(file_id);
        self.persist().await
    }

    pub async fn clear(&mut self) -> std::io::Result<()> {
        self.entries.clear();
        self.persist().await
    }

    /// Drop any entry whose backing file no longer exists in `workdir`.
    /// This is the only automatic reconciliation the manifest performs.
    pub async fn reconcile(&mut self, workdir: &Path) -> std::io::Result<()> {
        let mut missing = Vec::new();
        for (file_id, filename) in self.entries.iter() {
            if !workdir.join(filename).exists() {
                missing.push(file_id.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        for file_id in missing {
            self.entries.remove(&file_id);
        }
        self.persist().await
    }

    async fn persist(&self) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(&self.entries)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir).await?;
        let tmp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_persists_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = FileManifest::load(dir.path()).await;
        manifest.put("f1", "data.csv").await.unwrap();

        let reloaded = FileManifest::load(dir.path()).await;
        assert_eq!(reloaded.name_of("f1"), Some("data.csv"));
    }

    #[tokio::test]
    async fn malformed_manifest_fails_open_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(MANIFEST_FILENAME), b"not json")
            .await
            .unwrap();

        let manifest = FileManifest::load(dir.path()).await;
        assert!(manifest.all().is_empty());
    }

    #[tokio::test]
    async fn reconcile_purges_entries_with_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = FileManifest::load(dir.path()).await;
        manifest.put("f1", "present.txt").await.unwrap();
        manifest.put("f2", "missing.txt").await.unwrap();
        tokio::fs::write(dir.path().join("present.txt"), b"hi")
            .await
            .unwrap();

        manifest.reconcile(dir.path()).await.unwrap();

        assert!(manifest.has("f1"));
        assert!(!manifest.has("f2"));
    }

    #[tokio::test]
    async fn clear_empties_entries_but_keeps_file_valid() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = FileManifest::load(dir.path()).await;
        manifest.put("f1", "a.txt").await.unwrap();
        manifest.clear().await.unwrap();

        assert!(manifest.all().is_empty());
        let reloaded = FileManifest::load(dir.path()).await;
        assert!(reloaded.all().is_empty());
    }
}
