use dashmap::DashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O failed at {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Stored data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Namespaced string persistence.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, namespace: &str) -> Result<Option<String>, StorageError>;

    async fn put(&self, namespace: &str, value: &str) -> Result<(), StorageError>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, namespace: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(namespace).map(|v| v.value().clone()))
    }

    async fn put(&self, namespace: &str, value: &str) -> Result<(), StorageError> {
        self.entries.insert(namespace.to_string(), value.to_string());
        Ok(())
    }
}

/// One `<namespace>.json` file per namespace in a data directory.
///
/// Writes go to a temporary file that is then renamed over the target, so a reader
/// never observes a half-written file. Each write gets its own temporary name, so
/// concurrent writers in one or several processes never share a partial file.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, namespace: &str) -> Result<Option<String>, StorageError> {
        let path = self.path(namespace);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(path, e)),
        }
    }

    async fn put(&self, namespace: &str, value: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::Io(self.dir.clone(), e))?;
        let path = self.path(namespace);
        let tmp = self.dir.join(format!(
            ".{namespace}.json.{}.{:016x}.tmp",
            std::process::id(),
            rand::random::<u64>()
        ));
        if let Err(e) = tokio::fs::write(&tmp, value).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::Io(tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::Io(path, e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));
        assert_eq!(store.get("ns").await.unwrap(), None);
        store.put("ns", "[1,2]").await.unwrap();
        store.put("ns", "[3]").await.unwrap();

        let reopened = FileStore::new(dir.path().join("nested"));
        assert_eq!(reopened.get("ns").await.unwrap().as_deref(), Some("[3]"));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name != "ns.json")
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileStore::new(dir.path()));
        let writers: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let value = serde_json::json!({ "writer": i, "pad": "x".repeat(4096) });
                    store.put("ns", &value.to_string()).await.unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        let content = store.get("ns").await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(parsed["writer"].as_u64().unwrap() < 16);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.put("a", "x").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("x"));
        assert_eq!(store.get("b").await.unwrap(), None);
    }
}
