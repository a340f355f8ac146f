//! Storage port: a blob/filesystem abstraction treated as an external
//! collaborator. `FsStorage` is the one concrete implementation this crate
//! ships, built on `tokio::fs` so the core's storage-bound operations are
//! genuinely `async fn` and suspend only at these calls.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Reads the full contents of `path`, or `None` if it does not exist.
    async fn read(&self, path: &str) -> std::io::Result<Option<Vec<u8>>>;

    /// Writes `bytes` to `path`, creating parent directories as needed.
    /// `mime_type` is informational only; `FsStorage` does not persist it.
    async fn write(&self, path: &str, mime_type: &str, bytes: &[u8]) -> std::io::Result<()>;

    async fn file_exists(&self, path: &str) -> std::io::Result<bool>;

    async fn dir_exists(&self, path: &str) -> std::io::Result<bool>;

    async fn delete_file(&self, path: &str) -> std::io::Result<()>;

    async fn delete_dir(&self, path: &str) -> std::io::Result<()>;

    /// Lists immediate subdirectory names under `prefix`, in lexicographic
    /// order, paginated by `page_size` starting after `cursor` (exclusive).
    async fn list_dirs(
        &self,
        prefix: &str,
        page_size: usize,
        cursor: Option<&str>,
    ) -> std::io::Result<ListDirsPage>;
}

#[derive(Debug, Clone, Default)]
pub struct ListDirsPage {
    pub names: Vec<String>,
    pub next: Option<String>,
}

/// Filesystem-backed storage port rooted at `root`.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl StoragePort for FsStorage {
    async fn read(&self, path: &str) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, path: &str, _mime_type: &str, bytes: &[u8]) -> std::io::Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write to a temp file then rename, so a reader never observes a
        // partially written shard/leaf/tree file.
        let tmp = full.with_extension(format!(
            "{}.tmp",
            full.extension().and_then(|e| e.to_str()).unwrap_or("part")
        ));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &full).await?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> std::io::Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await.unwrap_or(false)
            && tokio::fs::metadata(self.resolve(path)).await.map(|m| m.is_file()).unwrap_or(false))
    }

    async fn dir_exists(&self, path: &str) -> std::io::Result<bool> {
        Ok(tokio::fs::metadata(self.resolve(path)).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    async fn delete_file(&self, path: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_dir(&self, path: &str) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_dirs(
        &self,
        prefix: &str,
        page_size: usize,
        cursor: Option<&str>,
    ) -> std::io::Result<ListDirsPage> {
        let full = self.resolve(prefix);
        let mut names = Vec::new();
        match tokio::fs::read_dir(&full).await {
            Ok(mut rd) => {
                while let Some(entry) = rd.next_entry().await? {
                    if entry.file_type().await?.is_dir()
                        && let Some(name) = entry.file_name().to_str()
                    {
                        names.push(name.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        names.sort();
        if let Some(c) = cursor {
            names.retain(|n| n.as_str() > c);
        }
        let next = if names.len() > page_size {
            names.truncate(page_size);
            names.last().cloned()
        } else {
            None
        };
        Ok(ListDirsPage { names, next })
    }
}

/// Creates a file with restrictive permissions where supported (0o600 on
/// Unix).
///
/// # Errors
/// Returns an error if the file cannot be created/opened.
pub fn create_secure(path: &Path) -> std::io::Result<std::fs::File> {
    use std::fs::OpenOptions;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new().write(true).create(true).truncate(false).mode(0o600).open(path)
    }
    #[cfg(not(unix))]
    {
        OpenOptions::new().write(true).create(true).truncate(false).open(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        storage.write("a/b/c.bin", "application/octet-stream", b"hello").await.unwrap();
        assert!(storage.file_exists("a/b/c.bin").await.unwrap());
        let bytes = storage.read("a/b/c.bin").await.unwrap().unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn read_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(storage.read("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_dirs_paginates_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        for n in ["00", "01", "02", "03"] {
            storage.write(&format!("shards/{n}/x"), "x", b"x").await.unwrap();
        }
        let page1 = storage.list_dirs("shards", 2, None).await.unwrap();
        assert_eq!(page1.names, vec!["00", "01"]);
        assert_eq!(page1.next.as_deref(), Some("01"));
        let page2 = storage.list_dirs("shards", 2, page1.next.as_deref()).await.unwrap();
        assert_eq!(page2.names, vec!["02", "03"]);
        assert_eq!(page2.next, None);
    }

    #[tokio::test]
    async fn delete_file_and_dir_are_idempotent_on_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        storage.delete_file("nope").await.unwrap();
        storage.delete_dir("nope_dir").await.unwrap();
    }
}
