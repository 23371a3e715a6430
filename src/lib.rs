//! Session-scoped code execution engine
//!
//! Runs untrusted python and bash snippets in per-session working directories under
//! wall-clock, CPU, memory and output limits, and keeps the files they produce in a
//! pluggable storage backend.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod languages;
pub mod redis_manager;
pub mod session;
pub mod storage;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use executor::{ExecutionResult, Executor, ExecutorRegistry};
pub use languages::Language;
pub use session::{ExecutionRequest, Session, SessionManager, UploadedFile};
pub use storage::StorageBackend;
