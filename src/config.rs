//! Engine configuration loaded from environment variables
//!
//! Every option has a default so local development works without a `.env` file.
//! `CODEEXEC_DISABLE_NETWORK` is advisory: enforcement belongs to the deployment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::engine::ResourceLimits;

const DEFAULT_STORAGE_PATH: &str = "/tmp/codeexec";
const DEFAULT_ALLOWED_LANGS: &str = "python,bash";
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_QUEUE_NAME: &str = "codeexec:queue";

/// Where session files are kept
#[derive(Debug, Clone, PartialEq)]
pub enum StorageConfig {
    /// Per-session directories under a base path
    Local { path: PathBuf },
    /// S3-compatible object store (AWS S3, MinIO)
    S3(S3Config),
}

#[derive(Debug, Clone, PartialEq)]
pub struct S3Config {
    pub bucket: String,
    /// Custom endpoint for MinIO and friends; AWS default resolution when `None`
    pub endpoint: Option<String>,
    pub region: String,
    /// Static credentials; the default AWS provider chain is used when absent
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub force_path_style: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Wall-clock budget for a single execution
    pub timeout: Duration,
    pub max_memory_mb: u64,
    pub max_cpu_secs: u64,
    /// Cap on captured bytes per output stream
    pub max_output_bytes: usize,
    pub allowed_langs: Vec<String>,
    pub storage: StorageConfig,
    pub disable_network: bool,
    /// Optional override for the embedded language table
    pub languages_config: Option<PathBuf>,
    /// Parent of scratch directories for backends without a local directory
    pub scratch_dir: Option<PathBuf>,
    pub redis_url: String,
    pub queue_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_memory_mb: 512,
            max_cpu_secs: 30,
            max_output_bytes: 1024 * 1024,
            allowed_langs: parse_list(DEFAULT_ALLOWED_LANGS),
            storage: StorageConfig::Local {
                path: PathBuf::from(DEFAULT_STORAGE_PATH),
            },
            disable_network: true,
            languages_config: None,
            scratch_dir: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let int_var = |name: &str, default: u64| -> Result<u64> {
            match get(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("Invalid integer for {}: {}", name, raw)),
                None => Ok(default),
            }
        };

        let storage = match get("CODEEXEC_STORAGE_BACKEND")
            .map(|v| v.trim().to_lowercase())
            .as_deref()
        {
            None | Some("local") => StorageConfig::Local {
                path: get("CODEEXEC_STORAGE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_PATH)),
            },
            Some("s3") | Some("remote") => {
                let bucket = get("CODEEXEC_S3_BUCKET").context(
                    "CODEEXEC_S3_BUCKET must be set when using the s3 storage backend",
                )?;
                StorageConfig::S3(S3Config {
                    bucket,
                    endpoint: get("CODEEXEC_S3_ENDPOINT"),
                    region: get("CODEEXEC_S3_REGION").unwrap_or_else(|| "us-east-1".into()),
                    access_key: get("CODEEXEC_S3_ACCESS_KEY"),
                    secret_key: get("CODEEXEC_S3_SECRET_KEY"),
                    force_path_style: parse_bool(get("CODEEXEC_S3_FORCE_PATH_STYLE"), true),
                })
            }
            Some(other) => bail!(
                "Invalid CODEEXEC_STORAGE_BACKEND: {}. Use 'local' or 's3'.",
                other
            ),
        };

        let allowed_langs = parse_list(
            &get("CODEEXEC_ALLOWED_LANGS").unwrap_or_else(|| DEFAULT_ALLOWED_LANGS.into()),
        );
        if allowed_langs.is_empty() {
            bail!("CODEEXEC_ALLOWED_LANGS must list at least one language");
        }

        let timeout_secs = int_var("CODEEXEC_MAX_EXECUTION_SECONDS", defaults.timeout.as_secs())?;
        if timeout_secs == 0 {
            bail!("CODEEXEC_MAX_EXECUTION_SECONDS must be greater than zero");
        }

        let max_output_bytes =
            int_var("CODEEXEC_MAX_OUTPUT_BYTES", defaults.max_output_bytes as u64)? as usize;

        Ok(Self {
            timeout: Duration::from_secs(timeout_secs),
            max_memory_mb: int_var("CODEEXEC_MAX_MEMORY_MB", defaults.max_memory_mb)?,
            max_cpu_secs: int_var("CODEEXEC_MAX_CPU_SECS", defaults.max_cpu_secs)?,
            max_output_bytes,
            allowed_langs,
            storage,
            disable_network: parse_bool(get("CODEEXEC_DISABLE_NETWORK"), defaults.disable_network),
            languages_config: get("CODEEXEC_LANGUAGES_CONFIG").map(PathBuf::from),
            scratch_dir: get("CODEEXEC_SCRATCH_DIR").map(PathBuf::from),
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            queue_name: get("CODEEXEC_QUEUE_NAME").unwrap_or(defaults.queue_name),
        })
    }

    /// Per-execution limits handed to every executor
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            timeout: self.timeout,
            max_memory_mb: self.max_memory_mb,
            max_cpu_secs: self.max_cpu_secs,
            max_output_bytes: self.max_output_bytes,
        }
    }
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value {
        Some(v) => matches!(
            v.trim().to_lowercase().as_str(),
            "1" | "true" | "t" | "yes" | "y"
        ),
        None => default,
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
