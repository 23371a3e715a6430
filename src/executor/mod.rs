//! Executor module - language-specific snippet runners
//!
//! This module provides:
//! - The [`Executor`] trait and its python/bash implementations
//! - [`ExecutionResult`], the structured outcome of one run
//! - [`ExecutorRegistry`], the explicit language -> executor map
//!
//! The executor module does NOT:
//! - Manage sessions or storage (see `session`)
//! - Enforce limits itself (delegated to `engine::ProcessSupervisor`)

mod bash;
mod python;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::{ExecutionOutcome, ExecutionSpec, ProcessSupervisor};
use crate::error::{Error, Result};
use crate::languages::{Language, LanguageConfig, LanguageTable};

pub use bash::BashExecutor;
pub use python::PythonExecutor;

/// Outcome of running user code
///
/// Non-zero exits and timeouts are ordinary results, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    /// User-visible session files after the run (filled in by the session layer)
    #[serde(default)]
    pub produced_files: Vec<String>,
    pub timed_out: bool,
    pub output_truncated: bool,
}

impl ExecutionResult {
    fn from_outcome(outcome: ExecutionOutcome, supervisor: &ProcessSupervisor) -> Self {
        let timed_out = outcome.timed_out();
        let exit_code = outcome.exit_code();
        let duration_ms = outcome.duration_ms();
        let output_truncated = outcome.stdout.truncated || outcome.stderr.truncated;

        let stdout = outcome.stdout.into_string();
        let mut stderr = outcome.stderr.into_string();
        if timed_out {
            stderr.push_str(&format!(
                "\nExecution timed out after {} seconds.",
                supervisor.limits().timeout.as_secs_f64()
            ));
        }

        Self {
            stdout,
            stderr,
            exit_code,
            duration_ms,
            produced_files: vec![],
            timed_out,
            output_truncated,
        }
    }
}

/// Runs a code snippet of one language inside a prepared directory
#[async_trait]
pub trait Executor: Send + Sync {
    fn language(&self) -> Language;

    /// Run `code` with `work_dir` as the current directory.
    ///
    /// Errors only when the environment fails (directory unusable, interpreter
    /// missing, spawn failure).
    async fn execute(&self, work_dir: &Path, code: &str, stdin: Option<&str>)
        -> Result<ExecutionResult>;
}

/// Write the snippet, run it under the supervisor, then remove it again
pub(crate) async fn run_snippet(
    supervisor: &ProcessSupervisor,
    config: &LanguageConfig,
    work_dir: &Path,
    source: &str,
    stdin: Option<&str>,
    executable: bool,
) -> Result<ExecutionResult> {
    if !fs::metadata(work_dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return Err(Error::Workspace(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", work_dir.display()),
        )));
    }

    let snippet = work_dir.join(&config.source_file);
    fs::write(&snippet, source).await.map_err(Error::Workspace)?;
    if executable {
        set_executable(&snippet).await?;
    }

    let mut spec = ExecutionSpec::new(work_dir)
        .with_command(config.run_command.clone())
        .with_env(config.env.clone());
    if let Some(input) = stdin {
        spec = spec.with_stdin(input);
    }

    let outcome = supervisor.run(&spec).await;

    // User code may have removed it already
    if let Err(e) = fs::remove_file(&snippet).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove snippet {}: {}", snippet.display(), e);
        }
    }

    Ok(ExecutionResult::from_outcome(outcome?, supervisor))
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .await
        .map_err(Error::Workspace)
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Language -> executor map, built once at startup
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<Language, Arc<dyn Executor>>,
    aliases: HashMap<String, Language>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register executors for every allowed language in `config`
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let table = LanguageTable::load(config.languages_config.as_deref())
            .context("Failed to load language table")?;
        let supervisor = ProcessSupervisor::new(config.limits());

        let registry = Self::with_languages(&table, &supervisor, &config.allowed_langs);
        if registry.is_empty() {
            anyhow::bail!(
                "None of the allowed languages {:?} has an executor",
                config.allowed_langs
            );
        }
        Ok(registry)
    }

    /// Register executors for the allowed tokens; unknown tokens are skipped
    pub fn with_languages(
        table: &LanguageTable,
        supervisor: &ProcessSupervisor,
        allowed: &[String],
    ) -> Self {
        let mut registry = Self::new();

        for token in allowed {
            let Some(config) = table.resolve(token).and_then(|lang| table.get(lang)) else {
                warn!("Ignoring unsupported language in allow-list: {}", token);
                continue;
            };
            let executor: Arc<dyn Executor> = match config.language {
                Language::Python => Arc::new(PythonExecutor::new(config.clone(), supervisor.clone())),
                Language::Bash => Arc::new(BashExecutor::new(config.clone(), supervisor.clone())),
            };
            registry.register(executor);
        }

        // Aliases only count for languages that made it into the registry
        for language in registry.languages() {
            for alias in table.aliases_of(language) {
                registry.aliases.insert(alias, language);
            }
        }

        info!("Registered executors: {:?}", registry.languages());
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        let language = executor.language();
        self.aliases.insert(language.as_str().to_string(), language);
        self.executors.insert(language, executor);
    }

    /// Resolve a request token to a registered language
    pub fn resolve(&self, token: &str) -> Option<Language> {
        self.aliases.get(&token.trim().to_lowercase()).copied()
    }

    pub fn get(&self, language: Language) -> Option<Arc<dyn Executor>> {
        self.executors.get(&language).cloned()
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<_> = self.executors.keys().copied().collect();
        languages.sort_by_key(|lang| lang.as_str());
        languages
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ResourceLimits;

    fn registry(allowed: &[&str]) -> ExecutorRegistry {
        let table = LanguageTable::embedded().unwrap();
        let supervisor = ProcessSupervisor::new(ResourceLimits::default());
        let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        ExecutorRegistry::with_languages(&table, &supervisor, &allowed)
    }

    #[test]
    fn test_registry_respects_allow_list() {
        let registry = registry(&["python"]);

        assert_eq!(registry.languages(), vec![Language::Python]);
        assert_eq!(registry.resolve("py"), Some(Language::Python));
        assert_eq!(registry.resolve("bash"), None);
        assert_eq!(registry.resolve("sh"), None);
        assert!(registry.get(Language::Bash).is_none());
    }

    #[test]
    fn test_registry_skips_unknown_tokens() {
        let registry = registry(&["ruby", "sh", "python"]);
        assert_eq!(registry.languages(), vec![Language::Bash, Language::Python]);
        assert_eq!(registry.resolve("shell"), Some(Language::Bash));
    }

    #[test]
    fn test_from_config_requires_one_language() {
        let config = Config {
            allowed_langs: vec!["cobol".into()],
            ..Config::default()
        };
        assert!(ExecutorRegistry::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_missing_work_dir() {
        let registry = registry(&["python"]);
        let dir = tempfile::tempdir().unwrap();
        let executor = registry.get(Language::Python).unwrap();

        let err = executor
            .execute(&dir.path().join("missing"), "print(1)", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Workspace(_)));
    }

    #[test]
    fn test_timeout_notice() {
        use crate::engine::{CapturedOutput, ExecutionStatus, TIMEOUT_EXIT_CODE};
        use std::time::Duration;

        let supervisor = ProcessSupervisor::new(
            ResourceLimits::default().with_timeout(Duration::from_secs(2)),
        );
        let outcome = ExecutionOutcome {
            status: ExecutionStatus::TimedOut,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput {
                data: b"partial".to_vec(),
                total_bytes: 7,
                truncated: false,
            },
            duration: Duration::from_millis(2001),
        };

        let result = ExecutionResult::from_outcome(outcome, &supervisor);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.stderr, "partial\nExecution timed out after 2 seconds.");
        assert_eq!(result.duration_ms, 2001);
    }
}
