use std::path::Path;

use async_trait::async_trait;

use super::{run_snippet, ExecutionResult, Executor};
use crate::engine::ProcessSupervisor;
use crate::error::Result;
use crate::languages::{Language, LanguageConfig};

/// Runs the snippet verbatim with the configured interpreter
pub struct PythonExecutor {
    config: LanguageConfig,
    supervisor: ProcessSupervisor,
}

impl PythonExecutor {
    pub fn new(config: LanguageConfig, supervisor: ProcessSupervisor) -> Self {
        Self { config, supervisor }
    }
}

#[async_trait]
impl Executor for PythonExecutor {
    fn language(&self) -> Language {
        Language::Python
    }

    async fn execute(
        &self,
        work_dir: &Path,
        code: &str,
        stdin: Option<&str>,
    ) -> Result<ExecutionResult> {
        run_snippet(&self.supervisor, &self.config, work_dir, code, stdin, false).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::{ResourceLimits, TIMEOUT_EXIT_CODE};
    use crate::languages::LanguageTable;
    use std::time::Duration;

    fn executor(timeout: Duration) -> PythonExecutor {
        let table = LanguageTable::embedded().unwrap();
        PythonExecutor::new(
            table.get(Language::Python).unwrap().clone(),
            ProcessSupervisor::new(ResourceLimits::default().with_timeout(timeout)),
        )
    }

    #[tokio::test]
    async fn test_print() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(Duration::from_secs(10))
            .execute(dir.path(), "print(1+1)", None)
            .await
            .unwrap();

        assert_eq!(result.stdout, "2\n");
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
        assert!(result.duration_ms > 0);
        // Snippet cleaned up
        assert!(!dir.path().join(".snippet.py").exists());
    }

    #[tokio::test]
    async fn test_exit_code_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let code = "import sys\ndata = sys.stdin.read()\nprint(data.upper())\nsys.exit(7)";
        let result = executor(Duration::from_secs(10))
            .execute(dir.path(), code, Some("abc"))
            .await
            .unwrap();

        assert_eq!(result.stdout, "ABC\n");
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn test_runtime_error_is_a_result() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(Duration::from_secs(10))
            .execute(dir.path(), "raise ValueError('boom')", None)
            .await
            .unwrap();

        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("ValueError: boom"));
    }

    #[tokio::test]
    async fn test_writes_into_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(Duration::from_secs(10))
            .execute(dir.path(), "open('o.txt', 'w').write('hi')", None)
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(std::fs::read(dir.path().join("o.txt")).unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(Duration::from_secs(1))
            .execute(dir.path(), "import time\ntime.sleep(30)", None)
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result
            .stderr
            .ends_with("Execution timed out after 1 seconds."));
        assert!(result.duration_ms >= 1000);
    }
}
