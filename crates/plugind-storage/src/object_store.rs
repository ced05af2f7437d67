use std::path::PathBuf;

use async_trait::async_trait;
use plugind_types::DaemonError;

/// Raw blob collaborator the persistence bucket and the installed-blob
/// bucket both sit on top of. A real deployment would point this at S3 or
/// equivalent.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, DaemonError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), DaemonError>;
    async fn delete(&self, key: &str) -> Result<(), DaemonError>;
    async fn exists(&self, key: &str) -> Result<bool, DaemonError>;
    /// Lists every key with the given prefix.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, DaemonError>;
}

/// Filesystem-backed implementation: one file per key under `root`, with
/// the key's path separators escaped so no key can climb out of `root`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let escaped = key.replace('/', "__");
        self.root.join(escaped)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, DaemonError> {
        tokio::fs::read(self.path_for(key))
            .await
            .map_err(|_| DaemonError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), DaemonError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| DaemonError::Internal(e.to_string()))?;
        tokio::fs::write(self.path_for(key), value)
            .await
            .map_err(|e| DaemonError::Internal(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), DaemonError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DaemonError::Internal(e.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, DaemonError> {
        Ok(tokio::fs::try_exists(self.path_for(key))
            .await
            .unwrap_or(false))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, DaemonError> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(DaemonError::Internal(e.to_string())),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| DaemonError::Internal(e.to_string()))? {
            if let Some(name) = entry.file_name().to_str() {
                let key = name.replace("__", "/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

/// An in-memory `ObjectStore`, used by tests and by the installed-blob
/// bucket before a real backend is configured.
pub struct MemoryObjectStore {
    data: tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self { data: tokio::sync::RwLock::new(std::collections::HashMap::new()) }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, DaemonError> {
        self.data
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), DaemonError> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DaemonError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, DaemonError> {
        Ok(self.data.read().await.contains_key(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, DaemonError> {
        Ok(self.data.read().await.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}
