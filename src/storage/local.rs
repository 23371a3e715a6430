//! Local filesystem backend: one directory per session under a base path
//!
//! User files live in `{session}/files/`, which is the directory code runs in.
//! Reserved objects such as the metadata sit beside it, out of reach of `./`-relative
//! writes made by user code.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{
    canonical, checked, is_representable, is_reserved, validate_session_id, StorageBackend,
    StorageError, StorageResult,
};

const FILES_DIR: &str = "files";

#[derive(Debug, Clone)]
pub struct LocalStorage {
    base: PathBuf,
}

impl LocalStorage {
    /// Use `base` as the root, creating it if needed
    pub async fn create(base: impl Into<PathBuf>) -> StorageResult<Self> {
        let base = base.into();
        fs::create_dir_all(&base).await?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn session_dir(&self, session_id: &str) -> StorageResult<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.base.join(session_id))
    }

    /// Normalized name plus the object's location relative to the base
    fn object_path(&self, session_id: &str, path: &str) -> StorageResult<(String, PathBuf)> {
        let rel = checked(session_id, path)?;
        let mut object = PathBuf::from(session_id);
        if !is_reserved(&rel) {
            object.push(FILES_DIR);
        }
        object.push(&rel);
        Ok((rel, object))
    }

    /// Join `object` onto the base without passing through a symlink.
    ///
    /// User code can plant links anywhere under its session directory, so every
    /// existing component is checked, the final one included. `None` means a link
    /// was found. Components that do not exist yet are fine.
    async fn resolve(&self, object: &Path) -> StorageResult<Option<PathBuf>> {
        let mut full = self.base.clone();
        let mut exists = true;

        for component in object.components() {
            full.push(component);
            if !exists {
                continue;
            }
            match fs::symlink_metadata(&full).await {
                Ok(meta) if meta.file_type().is_symlink() => {
                    warn!("Refusing to follow symlink at {}", full.display());
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => exists = false,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Some(full))
    }
}

/// Map a path found under the session directory back to its object name
fn object_name(found: &str) -> Option<String> {
    let name = match found.strip_prefix(FILES_DIR).and_then(|rest| rest.strip_prefix('/')) {
        Some(user) if !is_reserved(user) => user,
        Some(_) => return None,
        None if is_reserved(found) => found,
        None => return None,
    };
    is_representable(name).then(|| name.to_string())
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn save(&self, session_id: &str, path: &str, data: &[u8]) -> StorageResult<String> {
        let (rel, object) = self.object_path(session_id, path)?;
        let full = self
            .resolve(&object)
            .await?
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full, data).await?;
        debug!("Saved {} bytes to {}", data.len(), full.display());
        Ok(canonical(session_id, &rel))
    }

    async fn open(&self, session_id: &str, path: &str) -> StorageResult<Vec<u8>> {
        let (rel, object) = self.object_path(session_id, path)?;
        let not_found = || StorageError::NotFound(canonical(session_id, &rel));

        let Some(full) = self.resolve(&object).await? else {
            return Err(not_found());
        };
        match fs::symlink_metadata(&full).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(not_found()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        }

        match fs::read(&full).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, session_id: &str, path: &str) -> StorageResult<()> {
        let (_, object) = self.object_path(session_id, path)?;
        // Nothing behind a link belongs to this session
        let Some(full) = self.resolve(&object).await? else {
            return Ok(());
        };
        match fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, session_id: &str) -> StorageResult<Vec<String>> {
        let dir = self.session_dir(session_id)?;
        if !fs::try_exists(&dir).await? {
            return Ok(vec![]);
        }

        let found = tokio::task::spawn_blocking(move || list_files_in_dir(&dir))
            .await
            .map_err(|e| StorageError::Backend(format!("Listing task failed: {}", e)))??;

        let mut files: Vec<String> = found.iter().filter_map(|path| object_name(path)).collect();
        files.sort();
        Ok(files)
    }

    async fn delete_session(&self, session_id: &str) -> StorageResult<()> {
        let dir = self.session_dir(session_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("Removed session directory {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn local_dir(&self, session_id: &str) -> Option<PathBuf> {
        self.session_dir(session_id)
            .ok()
            .map(|dir| dir.join(FILES_DIR))
    }
}

/// Regular files under `dir`, relative with `/` separators, sorted
pub(crate) fn list_files_in_dir(dir: &Path) -> StorageResult<Vec<String>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| match e.into_io_error() {
            Some(io) => StorageError::Io(io),
            None => StorageError::Backend("Directory walk failed".into()),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(dir) {
            let parts: Vec<_> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            files.push(parts.join("/"));
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::create(dir.path().join("sessions")).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_save_open_list() {
        let (_dir, storage) = storage().await;

        let key = storage.save("s1", "a.txt", b"hello").await.unwrap();
        assert_eq!(key, "s1/a.txt");
        storage.save("s1", "nested/deep/b.bin", &[0, 1, 2]).await.unwrap();
        storage.save("s1", ".meta.json", b"{}").await.unwrap();

        assert_eq!(storage.open("s1", "a.txt").await.unwrap(), b"hello");
        assert_eq!(
            storage.list("s1").await.unwrap(),
            vec![".meta.json", "a.txt", "nested/deep/b.bin"]
        );

        // Overwrite
        storage.save("s1", "./a.txt", b"bye").await.unwrap();
        assert_eq!(storage.open("s1", "a.txt").await.unwrap(), b"bye");
    }

    #[tokio::test]
    async fn test_missing_objects() {
        let (_dir, storage) = storage().await;

        assert!(matches!(
            storage.open("s1", "nope.txt").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(storage.list("s1").await.unwrap().is_empty());
        storage.delete("s1", "nope.txt").await.unwrap();
        storage.delete_session("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_session_removes_everything() {
        let (_dir, storage) = storage().await;

        storage.save("s1", "a.txt", b"1").await.unwrap();
        storage.save("s1", "d/b.txt", b"2").await.unwrap();
        storage.save("s2", "c.txt", b"3").await.unwrap();

        storage.delete("s1", "a.txt").await.unwrap();
        assert_eq!(storage.list("s1").await.unwrap(), vec!["d/b.txt"]);

        storage.delete_session("s1").await.unwrap();
        assert!(storage.list("s1").await.unwrap().is_empty());
        assert_eq!(storage.list("s2").await.unwrap(), vec!["c.txt"]);
    }

    #[tokio::test]
    async fn test_rejects_escapes() {
        let (dir, storage) = storage().await;
        std::fs::write(dir.path().join("secret"), b"x").unwrap();

        assert!(matches!(
            storage.open("s1", "../../secret").await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            storage.save("..", "a.txt", b"x").await,
            Err(StorageError::InvalidSessionId(_))
        ));
        assert!(storage.local_dir("a/b").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_not_followed() {
        let (dir, storage) = storage().await;
        std::fs::write(dir.path().join("secret"), b"x").unwrap();

        let session_dir = storage.local_dir("s1").unwrap();
        std::fs::create_dir_all(&session_dir).unwrap();
        std::os::unix::fs::symlink(dir.path().join("secret"), session_dir.join("link")).unwrap();

        assert!(matches!(
            storage.open("s1", "link").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(storage.list("s1").await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_links_in_intermediate_components() {
        let (dir, storage) = storage().await;
        std::fs::write(dir.path().join("secret.txt"), b"outside").unwrap();

        let session_dir = storage.local_dir("s1").unwrap();
        std::fs::create_dir_all(&session_dir).unwrap();
        std::os::unix::fs::symlink(dir.path(), session_dir.join("up")).unwrap();

        assert!(matches!(
            storage.open("s1", "up/secret.txt").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.save("s1", "up/planted.txt", b"x").await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            storage.save("s1", "up/new/planted.txt", b"x").await,
            Err(StorageError::InvalidPath(_))
        ));
        storage.delete("s1", "up/secret.txt").await.unwrap();

        assert!(!dir.path().join("planted.txt").exists());
        assert!(!dir.path().join("new").exists());
        assert_eq!(std::fs::read(dir.path().join("secret.txt")).unwrap(), b"outside");
    }

    #[tokio::test]
    async fn test_reserved_objects_stay_out_of_the_run_directory() {
        let (_dir, storage) = storage().await;
        storage.save("s1", ".meta.json", b"{}").await.unwrap();
        storage.save("s1", "a.txt", b"A").await.unwrap();

        let run_dir = storage.local_dir("s1").unwrap();
        assert!(run_dir.join("a.txt").is_file());
        assert!(!run_dir.join(".meta.json").exists());

        // What user code writes there is never mistaken for the real object
        std::fs::write(run_dir.join(".meta.json"), b"forged").unwrap();
        std::fs::write(run_dir.join("a\\b"), b"odd").unwrap();
        assert_eq!(storage.open("s1", ".meta.json").await.unwrap(), b"{}");
        assert_eq!(storage.list("s1").await.unwrap(), vec![".meta.json", "a.txt"]);
    }
}
