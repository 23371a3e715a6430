//! Queue job wire format and dispatch
//!
//! Jobs are JSON objects tagged by `job_type`. Every job names the `result_key` its
//! [`JobReply`] is pushed to.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::session::{ExecutionRequest, SessionManager, UploadedFile};

const DEFAULT_LANGUAGE: &str = "python";

/// Worker job enum - represents different types of jobs the worker can process
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum WorkerJob {
    #[serde(rename = "create_session")]
    CreateSession(CreateSessionJob),
    #[serde(rename = "get_session")]
    GetSession(SessionJob),
    #[serde(rename = "delete_session")]
    DeleteSession(SessionJob),
    #[serde(rename = "execute")]
    Execute(ExecuteJob),
    #[serde(rename = "upload_files")]
    UploadFiles(UploadFilesJob),
    #[serde(rename = "download_file")]
    DownloadFile(DownloadFileJob),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionJob {
    pub result_key: String,
    #[serde(default = "default_language")]
    pub language: String,
}

/// Jobs that only address a session
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionJob {
    pub result_key: String,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteJob {
    pub result_key: String,
    pub session_id: String,
    pub code: String,
    /// Overrides the session language for this run
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadFilesJob {
    pub result_key: String,
    pub session_id: String,
    pub files: Vec<JobFile>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadFileJob {
    pub result_key: String,
    pub session_id: String,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobFile {
    pub path: String,
    /// File content as base64-encoded string
    pub content_base64: String,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl WorkerJob {
    pub fn result_key(&self) -> &str {
        match self {
            WorkerJob::CreateSession(job) => &job.result_key,
            WorkerJob::GetSession(job) | WorkerJob::DeleteSession(job) => &job.result_key,
            WorkerJob::Execute(job) => &job.result_key,
            WorkerJob::UploadFiles(job) => &job.result_key,
            WorkerJob::DownloadFile(job) => &job.result_key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerJob::CreateSession(_) => "create_session",
            WorkerJob::GetSession(_) => "get_session",
            WorkerJob::DeleteSession(_) => "delete_session",
            WorkerJob::Execute(_) => "execute",
            WorkerJob::UploadFiles(_) => "upload_files",
            WorkerJob::DownloadFile(_) => "download_file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Reply pushed to the job's result key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobReply {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(JobError {
                kind,
                message: message.into(),
            }),
        }
    }
}

impl From<Error> for JobReply {
    fn from(err: Error) -> Self {
        JobReply::failure(err.kind(), err.to_string())
    }
}

/// A queue payload that could not be parsed as a job
#[derive(Debug)]
pub struct MalformedJob {
    /// Present when the payload still told us where to reply
    pub result_key: Option<String>,
    pub reason: String,
}

/// Parse a raw queue payload
pub fn decode(payload: &str) -> std::result::Result<WorkerJob, MalformedJob> {
    serde_json::from_str::<WorkerJob>(payload).map_err(|e| MalformedJob {
        result_key: serde_json::from_str::<Value>(payload)
            .ok()
            .and_then(|v| v.get("result_key")?.as_str().map(str::to_string)),
        reason: e.to_string(),
    })
}

/// Run one job against the session manager and build its reply
pub async fn process_job(manager: &SessionManager, job: WorkerJob) -> JobReply {
    let name = job.name();
    match dispatch(manager, job).await {
        Ok(data) => JobReply::success(data),
        Err(e) => {
            if e.is_infrastructure() {
                error!("Job {} failed: {}", name, e);
            } else {
                warn!("Job {} rejected: {}", name, e);
            }
            e.into()
        }
    }
}

async fn dispatch(manager: &SessionManager, job: WorkerJob) -> Result<Value> {
    match job {
        WorkerJob::CreateSession(job) => {
            let session = manager.create(&job.language).await?;
            Ok(json!(session))
        }
        WorkerJob::GetSession(job) => {
            let session = manager.get(&job.session_id).await?;
            Ok(json!(session))
        }
        WorkerJob::DeleteSession(job) => {
            manager.delete(&job.session_id).await?;
            Ok(json!({ "session_id": job.session_id, "deleted": true }))
        }
        WorkerJob::Execute(job) => {
            info!(
                "Received execute job: session_id={}, language={:?}",
                job.session_id, job.language
            );
            let request = ExecutionRequest {
                language: job.language,
                code: job.code,
                stdin: job.stdin,
            };
            let result = manager.execute(&job.session_id, &request).await?;
            Ok(json!(result))
        }
        WorkerJob::UploadFiles(job) => {
            let files = job
                .files
                .into_iter()
                .map(|file| {
                    let data = general_purpose::STANDARD
                        .decode(&file.content_base64)
                        .map_err(|e| {
                            Error::InvalidRequest(format!(
                                "Failed to decode base64 file content for {}: {}",
                                file.path, e
                            ))
                        })?;
                    Ok(UploadedFile::new(file.path, data))
                })
                .collect::<Result<Vec<_>>>()?;

            let paths = manager.upload(&job.session_id, &files).await?;
            Ok(json!({ "paths": paths }))
        }
        WorkerJob::DownloadFile(job) => {
            let data = manager.download(&job.session_id, &job.path).await?;
            Ok(json!({
                "path": job.path,
                "content_base64": general_purpose::STANDARD.encode(data),
            }))
        }
    }
}
