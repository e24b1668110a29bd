//! Native key-value store: one file per key under a data directory, using tokio::fs.

use async_trait::async_trait;
use casefile_core::store::{KeyValueStore, Result, StoreError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// File-backed store for the daemon.
///
/// Key `org/person` lives at `<base>/org/person`. Writes go to a hidden
/// temporary file that is synced and then renamed over the target, so a crash
/// leaves either the old or the new value, never a torn one.
pub struct NativeKv {
    base_path: PathBuf,
}

impl NativeKv {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        let segments: Vec<&str> = key.split('/').collect();
        let valid = segments.iter().all(|s| {
            !s.is_empty() && !s.starts_with('.') && !s.contains('\\') && !s.contains(':')
        });
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(segments
            .iter()
            .fold(self.base_path.clone(), |path, segment| path.join(segment)))
    }

    /// Collect every key under `dir`, which maps to key prefix `prefix`.
    async fn collect_keys(&self, dir: PathBuf, prefix: String, out: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![(dir, prefix)];
        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Io(e.to_string())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let key = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else {
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for NativeKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full_path = self.full_path(key)?;
        match fs::read(&full_path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let full_path = self.full_path(key)?;
        let parent = full_path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;

        // Create parent directories if needed
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        let temp_path = parent.join(format!(".{file_name}.tmp"));

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.write_all(value)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        drop(file);

        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(self.base_path.clone(), String::new(), &mut keys)
            .await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_remove() {
        let dir = TempDir::new().unwrap();
        let kv = NativeKv::new(dir.path().to_path_buf());

        assert_eq!(kv.get("org/person").await.unwrap(), None);
        kv.set("org/person", b"[]").await.unwrap();
        kv.set("org/person", b"[1]").await.unwrap();
        assert_eq!(kv.get("org/person").await.unwrap(), Some(b"[1]".to_vec()));
        assert!(dir.path().join("org").join("person").exists());

        kv.remove("org/person").await.unwrap();
        kv.remove("org/person").await.unwrap();
        assert_eq!(kv.get("org/person").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_skip_temporaries_and_filter_prefix() {
        let dir = TempDir::new().unwrap();
        let kv = NativeKv::new(dir.path().to_path_buf());
        kv.set("org/person", b"[]").await.unwrap();
        kv.set("org/person.tombstones", b"{}").await.unwrap();
        kv.set("other/person", b"[]").await.unwrap();
        std::fs::write(dir.path().join("org").join(".stray.tmp"), b"x").unwrap();

        assert_eq!(
            kv.keys("org/").await.unwrap(),
            vec!["org/person".to_string(), "org/person.tombstones".to_string()]
        );
        assert_eq!(kv.keys("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let kv = NativeKv::new(dir.path().to_path_buf());

        for key in ["../escape", "org/../../x", "", "org//person", "/abs", ".hidden"] {
            assert!(
                matches!(kv.set(key, b"x").await, Err(StoreError::InvalidKey(_))),
                "{key}"
            );
        }
    }
}
