//! Storage module - durable session artifacts
//!
//! This module provides:
//! - The [`StorageBackend`] trait every backend implements
//! - Session id validation and relative path normalization shared by all backends
//! - Local filesystem, S3-compatible and in-memory backends
//!
//! The storage module does NOT:
//! - Interpret session metadata (it is an ordinary object under the reserved prefix)
//! - Filter reserved entries from listings (callers decide what is user-visible)

mod local;
mod memory;
mod s3;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::StorageConfig;

pub(crate) use local::list_files_in_dir;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use s3::S3Storage;

/// Top-level names starting with this are hidden from users
pub const RESERVED_PREFIX: &str = ".";

/// Session metadata object
pub const METADATA_FILE: &str = ".meta.json";

const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable key space for session files
///
/// Paths are relative to the session namespace and use `/` as separator. Every
/// method validates the session id and normalizes the path before touching storage.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `data`, overwriting any existing object. Returns `"{session_id}/{path}"`.
    async fn save(&self, session_id: &str, path: &str, data: &[u8]) -> StorageResult<String>;

    async fn open(&self, session_id: &str, path: &str) -> StorageResult<Vec<u8>>;

    /// Remove one object; absent objects are not an error
    async fn delete(&self, session_id: &str, path: &str) -> StorageResult<()>;

    /// Every object in the session, recursive, sorted
    async fn list(&self, session_id: &str) -> StorageResult<Vec<String>>;

    /// Remove the whole namespace; a no-op when it is already empty
    async fn delete_session(&self, session_id: &str) -> StorageResult<()>;

    /// Real directory holding the session's user files, if the backend has one.
    ///
    /// When present, executions run in place instead of in a scratch copy.
    fn local_dir(&self, _session_id: &str) -> Option<PathBuf> {
        None
    }
}

/// Build the backend selected in configuration
pub async fn from_config(config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Local { path } => {
            info!("Using local storage at {}", path.display());
            Ok(Arc::new(LocalStorage::create(path).await?))
        }
        StorageConfig::S3(s3) => {
            info!("Using S3 storage bucket {}", s3.bucket);
            Ok(Arc::new(S3Storage::from_config(s3).await?))
        }
    }
}

/// Reject ids that could escape or collide with another namespace
pub fn validate_session_id(session_id: &str) -> StorageResult<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidSessionId(session_id.to_string()))
    }
}

/// Normalize a caller-supplied relative path.
///
/// Backslashes become `/`, `.` and empty segments are dropped. Empty, absolute and
/// parent-relative paths are rejected.
pub fn normalize_path(path: &str) -> StorageResult<String> {
    let unified = path.replace('\\', "/");
    let invalid = || StorageError::InvalidPath(path.to_string());

    if unified.starts_with('/') || unified.contains('\0') {
        return Err(invalid());
    }

    let mut parts = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(invalid()),
            s => parts.push(s),
        }
    }

    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.join("/"))
}

/// Whether a normalized path is hidden from user-visible listings.
///
/// Only the first segment counts: `out/.env` is an ordinary user file.
pub fn is_reserved(path: &str) -> bool {
    path.starts_with(RESERVED_PREFIX)
}

/// Whether a name found on disk survives normalization unchanged.
///
/// Names that don't (a backslash, for one) cannot be stored under the same name.
pub fn is_representable(name: &str) -> bool {
    normalize_path(name).is_ok_and(|normalized| normalized == name)
}

/// Validate both halves of an object address at once
pub(crate) fn checked(session_id: &str, path: &str) -> StorageResult<String> {
    validate_session_id(session_id)?;
    normalize_path(path)
}

pub(crate) fn canonical(session_id: &str, path: &str) -> String {
    format!("{}/{}", session_id, path)
}
