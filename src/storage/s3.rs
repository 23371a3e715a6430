//! MinIO/S3 storage backend
//!
//! Objects live at `"{session_id}/{path}"` in a single bucket.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use super::{canonical, checked, validate_session_id, StorageBackend, StorageError, StorageResult};
use crate::config::S3Config;

/// S3/MinIO storage client
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub async fn from_config(config: &S3Config) -> anyhow::Result<Self> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials =
                Credentials::new(access_key, secret_key, None, None, "codeexec-static");
            loader = loader.credentials_provider(credentials);
        }

        let shared = loader.load().await;
        let mut builder =
            aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            info!("Connecting to S3 endpoint {}", endpoint);
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self::new(Client::from_conf(builder.build()), config.bucket.clone()))
    }

    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Every key under the session prefix
    async fn list_keys(&self, session_id: &str) -> StorageResult<Vec<String>> {
        let prefix = format!("{}/", session_id);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| backend_error("list", &prefix, e))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| key.len() > prefix.len())
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn save(&self, session_id: &str, path: &str, data: &[u8]) -> StorageResult<String> {
        let key = canonical(session_id, &checked(session_id, path)?);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| backend_error("upload", &key, e))?;

        debug!("Uploaded {} bytes to s3://{}/{}", data.len(), self.bucket, key);
        Ok(key)
    }

    async fn open(&self, session_id: &str, path: &str) -> StorageResult<Vec<u8>> {
        let key = canonical(session_id, &checked(session_id, path)?);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    StorageError::NotFound(key.clone())
                } else {
                    backend_error("download", &key, service_error)
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| backend_error("read body of", &key, e))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, session_id: &str, path: &str) -> StorageResult<()> {
        let key = canonical(session_id, &checked(session_id, path)?);

        // DeleteObject succeeds for missing keys
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| backend_error("delete", &key, e))?;
        Ok(())
    }

    async fn list(&self, session_id: &str) -> StorageResult<Vec<String>> {
        validate_session_id(session_id)?;
        let prefix_len = session_id.len() + 1;

        let mut files: Vec<String> = self
            .list_keys(session_id)
            .await?
            .into_iter()
            .map(|key| key[prefix_len..].to_string())
            .collect();
        files.sort();
        Ok(files)
    }

    async fn delete_session(&self, session_id: &str) -> StorageResult<()> {
        validate_session_id(session_id)?;

        let keys = self.list_keys(session_id).await?;
        for key in &keys {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| backend_error("delete", key, e))?;
        }

        if !keys.is_empty() {
            info!("Deleted {} objects for session {}", keys.len(), session_id);
        }
        Ok(())
    }
}

fn backend_error<E>(action: &str, key: &str, err: E) -> StorageError
where
    E: std::error::Error,
{
    StorageError::Backend(format!(
        "Failed to {} {}: {}",
        action,
        key,
        DisplayErrorContext(err)
    ))
}
