use std::path::Path;

use async_trait::async_trait;

use super::{run_snippet, ExecutionResult, Executor};
use crate::engine::ProcessSupervisor;
use crate::error::Result;
use crate::languages::{Language, LanguageConfig};

const DEFAULT_SHEBANG: &str = "#!/bin/bash\n";

/// Runs the snippet as an executable shell script
pub struct BashExecutor {
    config: LanguageConfig,
    supervisor: ProcessSupervisor,
}

impl BashExecutor {
    pub fn new(config: LanguageConfig, supervisor: ProcessSupervisor) -> Self {
        Self { config, supervisor }
    }
}

/// Prepend a bash shebang unless the script brings its own
fn with_shebang(code: &str) -> String {
    if code.starts_with("#!") {
        code.to_string()
    } else {
        format!("{}{}", DEFAULT_SHEBANG, code)
    }
}

#[async_trait]
impl Executor for BashExecutor {
    fn language(&self) -> Language {
        Language::Bash
    }

    async fn execute(
        &self,
        work_dir: &Path,
        code: &str,
        stdin: Option<&str>,
    ) -> Result<ExecutionResult> {
        let script = with_shebang(code);
        run_snippet(&self.supervisor, &self.config, work_dir, &script, stdin, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shebang_injection() {
        assert_eq!(with_shebang("echo hi"), "#!/bin/bash\necho hi");
        assert_eq!(with_shebang("#!/bin/sh\necho hi"), "#!/bin/sh\necho hi");
        assert_eq!(with_shebang(""), "#!/bin/bash\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_and_exit_code() {
        use crate::engine::ResourceLimits;
        use crate::languages::LanguageTable;

        let table = LanguageTable::embedded().unwrap();
        let executor = BashExecutor::new(
            table.get(Language::Bash).unwrap().clone(),
            ProcessSupervisor::new(ResourceLimits::default()),
        );
        let dir = tempfile::tempdir().unwrap();

        let result = executor
            .execute(dir.path(), "echo test\nread line\necho \"got $line\" >&2\nexit 4", Some("x\n"))
            .await
            .unwrap();

        assert!(result.stdout.contains("test"));
        assert_eq!(result.stderr, "got x\n");
        assert_eq!(result.exit_code, 4);
        assert!(!dir.path().join(".snippet.sh").exists());
    }
}
