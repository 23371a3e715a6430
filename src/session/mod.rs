//! Session module - orchestration of sessions, storage and executors
//!
//! This module provides:
//! - Session lifecycle (create, get, delete) with metadata kept in storage
//! - Code execution against a session's files, directly in the backend's local
//!   directory when it has one, otherwise in a scratch copy
//! - File upload and download
//! - A per-session lease serializing mutating operations on one session
//!
//! The session module does NOT:
//! - Know how a language is run (see `executor`)
//! - Speak any wire protocol (see `jobs`)

mod scratch;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::executor::{ExecutionResult, ExecutorRegistry};
use crate::languages::Language;
use crate::storage::{
    is_reserved, normalize_path, validate_session_id, StorageBackend, StorageError, METADATA_FILE,
};

/// A session as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub language: Language,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// User-visible files, sorted
    pub files: Vec<String>,
}

/// Persisted form of a session (`.meta.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SessionMeta {
    session_id: String,
    language: Language,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Overrides the session language for this run only
    #[serde(default)]
    pub language: Option<String>,
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub path: String,
    pub data: Vec<u8>,
}

impl UploadedFile {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

/// In-process async mutex per session id
#[derive(Debug, Default)]
struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop locks nobody holds or waits for
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(session_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Ties session identity, storage and executors together
pub struct SessionManager {
    storage: Arc<dyn StorageBackend>,
    executors: ExecutorRegistry,
    locks: SessionLocks,
    /// Parent of scratch directories; the system temp directory when `None`
    scratch_root: Option<PathBuf>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn StorageBackend>, executors: ExecutorRegistry) -> Self {
        Self {
            storage,
            executors,
            locks: SessionLocks::default(),
            scratch_root: None,
        }
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Create a session for `language` (canonical name or alias)
    pub async fn create(&self, language: &str) -> Result<Session> {
        let language = self
            .executors
            .resolve(language)
            .ok_or_else(|| Error::UnsupportedLanguage(language.to_string()))?;

        let meta = SessionMeta {
            session_id: Uuid::new_v4().to_string(),
            language,
            created_at: OffsetDateTime::now_utc(),
        };
        let bytes = serde_json::to_vec_pretty(&meta).map_err(|source| Error::Metadata {
            session_id: meta.session_id.clone(),
            source,
        })?;
        self.storage
            .save(&meta.session_id, METADATA_FILE, &bytes)
            .await
            .inspect_err(|e| error!("Failed to persist session metadata: {}", e))?;

        info!("Created session {} ({})", meta.session_id, meta.language);

        Ok(Session {
            session_id: meta.session_id,
            language: meta.language,
            created_at: meta.created_at,
            files: vec![],
        })
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let meta = self.load_meta(session_id).await?;
        let files = self.user_files(session_id).await?;

        Ok(Session {
            session_id: meta.session_id,
            language: meta.language,
            created_at: meta.created_at,
            files,
        })
    }

    /// Remove every object of the session
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        let _lease = self.locks.acquire(session_id).await;

        if self.storage.list(session_id).await?.is_empty() {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        self.storage.delete_session(session_id).await?;

        info!("Deleted session {}", session_id);
        Ok(())
    }

    /// Run code against the session's files
    pub async fn execute(
        &self,
        session_id: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        validate_session_id(session_id)?;
        let _lease = self.locks.acquire(session_id).await;

        let meta = self.load_meta(session_id).await?;
        let language = match &request.language {
            Some(token) => self
                .executors
                .resolve(token)
                .ok_or_else(|| Error::UnsupportedLanguage(token.clone()))?,
            None => meta.language,
        };
        let executor = self
            .executors
            .get(language)
            .ok_or_else(|| Error::UnsupportedLanguage(language.to_string()))?;

        let code = request.code.as_str();
        let stdin = request.stdin.as_deref();

        let mut result = match self.storage.local_dir(session_id) {
            Some(dir) => {
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(Error::Workspace)?;
                executor.execute(&dir, code, stdin).await
            }
            None => {
                let scratch = scratch::materialize(
                    self.storage.as_ref(),
                    session_id,
                    self.scratch_root.as_deref(),
                )
                .await?;
                let result = executor.execute(scratch.path(), code, stdin).await;
                let uploaded = match &result {
                    Ok(_) => scratch::reconcile(self.storage.as_ref(), session_id, scratch.path())
                        .await
                        .map(|_| ()),
                    Err(_) => Ok(()),
                };
                if let Err(e) = scratch.close() {
                    warn!("Failed to remove scratch directory: {}", e);
                }
                uploaded.and(result)
            }
        }
        .inspect_err(|e| {
            if e.is_infrastructure() {
                error!("Execution in session {} failed: {}", session_id, e);
            }
        })?;

        result.produced_files = self.user_files(session_id).await?;

        info!(
            "Executed {} in session {}: exit_code={}, duration_ms={}, timed_out={}",
            language, session_id, result.exit_code, result.duration_ms, result.timed_out
        );
        Ok(result)
    }

    /// Store caller-supplied files; returns their normalized paths
    pub async fn upload(&self, session_id: &str, files: &[UploadedFile]) -> Result<Vec<String>> {
        validate_session_id(session_id)?;
        let _lease = self.locks.acquire(session_id).await;
        self.load_meta(session_id).await?;

        // Validate everything before writing anything
        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            let rel = normalize_path(&file.path)?;
            if is_reserved(&rel) {
                return Err(Error::InvalidPath(file.path.clone()));
            }
            paths.push(rel);
        }

        for (rel, file) in paths.iter().zip(files) {
            self.storage.save(session_id, rel, &file.data).await?;
        }

        info!("Uploaded {} files to session {}", paths.len(), session_id);
        Ok(paths)
    }

    pub async fn download(&self, session_id: &str, path: &str) -> Result<Vec<u8>> {
        validate_session_id(session_id)?;
        let rel = normalize_path(path)?;
        if is_reserved(&rel) {
            return Err(Error::FileNotFound(path.to_string()));
        }

        match self.storage.open(session_id, &rel).await {
            Ok(data) => Ok(data),
            Err(StorageError::NotFound(_)) => Err(Error::FileNotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_meta(&self, session_id: &str) -> Result<SessionMeta> {
        let bytes = match self.storage.open(session_id, METADATA_FILE).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => {
                return Err(Error::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes).map_err(|source| Error::Metadata {
            session_id: session_id.to_string(),
            source,
        })
    }

    async fn user_files(&self, session_id: &str) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list(session_id)
            .await?
            .into_iter()
            .filter(|path| !is_reserved(path))
            .collect())
    }
}
