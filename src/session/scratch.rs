//! Scratch directories for backends without a local directory
//!
//! Before a run the session's user-visible files are copied into a private temp
//! directory; afterwards every user-visible file found there is uploaded back.
//! Files deleted by the run are NOT deleted from storage. Names the backend cannot
//! hold verbatim are left behind with a warning.

use std::path::Path;

use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::{
    self, is_representable, is_reserved, normalize_path, StorageBackend, StorageError,
};

const SCRATCH_PREFIX: &str = "codeexec-";

/// Create a scratch directory holding a copy of the session's files.
///
/// It is created under `root` when given, otherwise in the system temp directory.
pub(crate) async fn materialize(
    storage: &dyn StorageBackend,
    session_id: &str,
    root: Option<&Path>,
) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(SCRATCH_PREFIX);
    let scratch = match root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    }
    .map_err(Error::Workspace)?;

    let mut copied = 0usize;
    for entry in storage.list(session_id).await? {
        let rel = match normalize_path(&entry) {
            Ok(rel) if !is_reserved(&rel) => rel,
            Ok(_) => continue,
            Err(_) => {
                warn!("Skipping unusable object name in session {}: {:?}", session_id, entry);
                continue;
            }
        };

        let data = storage.open(session_id, &rel).await?;
        let target = scratch.path().join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(Error::Workspace)?;
        }
        fs::write(&target, data).await.map_err(Error::Workspace)?;
        copied += 1;
    }

    debug!(
        "Materialized {} files for session {} into {}",
        copied,
        session_id,
        scratch.path().display()
    );
    Ok(scratch)
}

/// Upload every user-visible file under `dir` into the session
pub(crate) async fn reconcile(
    storage: &dyn StorageBackend,
    session_id: &str,
    dir: &Path,
) -> Result<Vec<String>> {
    let root = dir.to_path_buf();
    let found = tokio::task::spawn_blocking(move || storage::list_files_in_dir(&root))
        .await
        .map_err(|e| Error::Workspace(std::io::Error::other(e)))?
        .map_err(|e| match e {
            StorageError::Io(io) => Error::Workspace(io),
            other => other.into(),
        })?;

    let mut uploaded = Vec::new();
    for rel in found.into_iter().filter(|p| !is_reserved(p)) {
        if !is_representable(&rel) {
            warn!("Not keeping file with unusable name in session {}: {:?}", session_id, rel);
            continue;
        }
        let data = fs::read(dir.join(&rel)).await.map_err(Error::Workspace)?;
        storage.save(session_id, &rel, &data).await?;
        uploaded.push(rel);
    }

    debug!("Uploaded {} files for session {}", uploaded.len(), session_id);
    Ok(uploaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_materialize_skips_reserved() {
        let storage = MemoryStorage::new();
        storage.save("s1", ".meta.json", b"{}").await.unwrap();
        storage.save("s1", "data/in.csv", b"1,2").await.unwrap();

        let scratch = materialize(&storage, "s1", None).await.unwrap();

        assert_eq!(
            std::fs::read(scratch.path().join("data/in.csv")).unwrap(),
            b"1,2"
        );
        assert!(!scratch.path().join(".meta.json").exists());
    }

    #[tokio::test]
    async fn test_reconcile_uploads_without_deleting() {
        let storage = MemoryStorage::new();
        storage.save("s1", ".meta.json", b"{}").await.unwrap();
        storage.save("s1", "old.txt", b"old").await.unwrap();

        let scratch = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(scratch.path().join("out")).unwrap();
        std::fs::write(scratch.path().join("out/new.txt"), b"new").unwrap();
        std::fs::write(scratch.path().join(".snippet.py"), b"print()").unwrap();

        let uploaded = reconcile(&storage, "s1", scratch.path()).await.unwrap();

        assert_eq!(uploaded, vec!["out/new.txt"]);
        assert_eq!(
            storage.list("s1").await.unwrap(),
            vec![".meta.json", "old.txt", "out/new.txt"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reconcile_skips_unusable_names() {
        let storage = MemoryStorage::new();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(scratch.path().join("a.txt"), b"a").unwrap();
        std::fs::write(scratch.path().join("x:y"), b"colon").unwrap();
        std::fs::write(scratch.path().join("a\\b"), b"backslash").unwrap();
        std::fs::create_dir_all(scratch.path().join("out")).unwrap();
        std::fs::write(scratch.path().join("out/.env"), b"K=V").unwrap();

        let uploaded = reconcile(&storage, "s1", scratch.path()).await.unwrap();

        assert_eq!(uploaded, vec!["a.txt", "out/.env", "x:y"]);
        assert_eq!(storage.open("s1", "x:y").await.unwrap(), b"colon");
        assert!(matches!(
            storage.open("s1", "a/b").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_materialize_in_root() {
        let storage = MemoryStorage::new();
        storage.save("s1", "in.txt", b"1").await.unwrap();
        let root = tempfile::tempdir().unwrap();

        let scratch = materialize(&storage, "s1", Some(root.path())).await.unwrap();
        assert!(scratch.path().starts_with(root.path()));
        assert!(scratch
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(SCRATCH_PREFIX));

        scratch.close().unwrap();
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
