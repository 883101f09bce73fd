//! Directory-backed object store: each bucket is a subdirectory of the root
//! and each object key a relative path inside it.

use async_trait::async_trait;
use adcp_core::config::SourceTier;
use adcp_core::error::StoreError;
use adcp_core::store::ObjectStore;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

pub struct DirectoryObjectStore {
    root: PathBuf,
}

impl DirectoryObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(bucket).join(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || bucket.is_empty() {
            return Err(StoreError::Malformed {
                tier: SourceTier::ObjectStore,
                key: format!("{bucket}/{key}"),
                reason: "object key must be a plain relative path".into(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn io_error(path: &Path, e: std::io::Error) -> StoreError {
        StoreError::TransientIo {
            tier: SourceTier::ObjectStore,
            reason: format!("{}: {e}", path.display()),
        }
    }
}

#[async_trait]
impl ObjectStore for DirectoryObjectStore {
    fn name(&self) -> &str {
        "directory"
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.resolve(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let bucket_root = self.resolve(bucket, "")?;
        let mut keys = Vec::new();
        let mut pending = vec![bucket_root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::io_error(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::io_error(&dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Self::io_error(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(files: &[&str]) -> (tempfile::TempDir, DirectoryObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        for path in files {
            let full = dir.path().join(path);
            tokio::fs::create_dir_all(full.parent().unwrap()).await.unwrap();
            tokio::fs::write(full, format!("body of {path}")).await.unwrap();
        }
        let store = DirectoryObjectStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn get_existing_and_missing_objects() {
        let (_dir, store) = store_with(&["bucket/configs/global_configuration.json"]).await;

        let body = store
            .get_object("bucket", "configs/global_configuration.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, b"body of bucket/configs/global_configuration.json");
        assert!(store.get_object("bucket", "configs/nope.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_recursive_and_prefix_filtered() {
        let (_dir, store) = store_with(&[
            "bucket/configs/agent_cards/A.agent.card.json",
            "bucket/configs/agent_cards/B.agent.card.json",
            "bucket/configs/agent-instructions-library/A.txt",
        ])
        .await;

        let keys = store
            .list_objects("bucket", "configs/agent_cards/")
            .await
            .unwrap();
        assert_eq!(
            keys,
            vec![
                "configs/agent_cards/A.agent.card.json",
                "configs/agent_cards/B.agent.card.json"
            ]
        );
        assert!(store.list_objects("missing", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn parent_components_are_rejected() {
        let (_dir, store) = store_with(&[]).await;
        let err = store.get_object("bucket", "../secret").await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }
}
