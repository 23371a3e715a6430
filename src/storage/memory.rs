//! In-memory backend
//!
//! Has no local directory, so sessions stored here always run through a scratch copy.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{canonical, checked, validate_session_id, StorageBackend, StorageError, StorageResult};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    sessions: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn save(&self, session_id: &str, path: &str, data: &[u8]) -> StorageResult<String> {
        let rel = checked(session_id, path)?;
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .insert(rel.clone(), data.to_vec());
        Ok(canonical(session_id, &rel))
    }

    async fn open(&self, session_id: &str, path: &str) -> StorageResult<Vec<u8>> {
        let rel = checked(session_id, path)?;
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|files| files.get(&rel))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(canonical(session_id, &rel)))
    }

    async fn delete(&self, session_id: &str, path: &str) -> StorageResult<()> {
        let rel = checked(session_id, path)?;
        let mut sessions = self.sessions.write().await;
        if let Some(files) = sessions.get_mut(session_id) {
            files.remove(&rel);
            if files.is_empty() {
                sessions.remove(session_id);
            }
        }
        Ok(())
    }

    async fn list(&self, session_id: &str) -> StorageResult<Vec<String>> {
        validate_session_id(session_id)?;
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_session(&self, session_id: &str) -> StorageResult<()> {
        validate_session_id(session_id)?;
        self.sessions.write().await.remove(session_id);
        Ok(())
    }
}
