//! Process supervisor
//!
//! Launches one child per call and guarantees it does not outlive its wall-clock
//! budget. The child gets its own process group so the kill reaches every descendant
//! that did not deliberately leave the group.
//!
//! Per invocation: `Launched -> Running -> {Completed | TimedOut | LaunchFailed}`.
//! Nothing is retried.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::sleep_until;
use tracing::{debug, info, warn};

use super::limits::ResourceLimits;
use super::output::{capture, CapturedOutput};
use crate::error::{Error, Result};

/// Exit code reported for a run killed by the wall-clock watch.
///
/// Real exit statuses are `0..=255` and signal deaths are reported as `-signo`
/// (`-1..=-64`), so this value cannot be produced by a finished process.
pub const TIMEOUT_EXIT_CODE: i32 = -256;

/// How long readers may keep draining after the child is gone
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What to run and where
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub work_dir: PathBuf,
    pub command: Vec<String>,
    /// Extra environment variables (KEY=VALUE)
    pub env: Vec<String>,
    pub stdin: Option<String>,
}

impl ExecutionSpec {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            command: vec![],
            env: vec![],
            stdin: None,
        }
    }

    pub fn with_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// How the child finished
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by a signal it did not get from us
    Signaled(i32),
    /// Killed by the wall-clock watch
    TimedOut,
}

#[derive(Debug)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// Wall-clock time from spawn to reap
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Exited(0))
    }

    pub fn timed_out(&self) -> bool {
        self.status == ExecutionStatus::TimedOut
    }

    /// Exit code with signal deaths as `-signo` and timeouts as [`TIMEOUT_EXIT_CODE`]
    pub fn exit_code(&self) -> i32 {
        match self.status {
            ExecutionStatus::Exited(code) => code,
            ExecutionStatus::Signaled(sig) => -sig,
            ExecutionStatus::TimedOut => TIMEOUT_EXIT_CODE,
        }
    }

    /// Elapsed time rounded up to whole milliseconds
    pub fn duration_ms(&self) -> u64 {
        let micros = self.duration.as_micros();
        micros.div_ceil(1000).min(u64::MAX as u128) as u64
    }
}

/// Runs commands under a fixed set of limits
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    limits: ResourceLimits,
}

impl ProcessSupervisor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Run `spec` to completion or until the timeout fires.
    ///
    /// A non-zero exit or a timeout is an `Ok` outcome; only failures to start the
    /// process are errors.
    pub async fn run(&self, spec: &ExecutionSpec) -> Result<ExecutionOutcome> {
        let program = spec
            .command
            .first()
            .ok_or_else(|| Error::InvalidRequest("No command specified for execution".into()))?;

        if !spec.work_dir.is_dir() {
            return Err(Error::Workspace(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", spec.work_dir.display()),
            )));
        }

        let mut cmd = Command::new(program);
        cmd.args(&spec.command[1..])
            .current_dir(&spec.work_dir)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for pair in &spec.env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }

        configure_isolation(&mut cmd, &self.limits);

        debug!("Spawning {:?} in {}", spec.command, spec.work_dir.display());

        let started = Instant::now();
        let deadline = tokio::time::Instant::from_std(started + self.limits.timeout);

        let mut child = cmd.spawn().map_err(|e| launch_error(program, e))?;
        let pid = child.id();

        let stdin_task = match (child.stdin.take(), spec.stdin.clone()) {
            (Some(mut pipe), Some(input)) => Some(tokio::spawn(async move {
                // The child may exit without reading; a broken pipe is expected then
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!("Stopped writing stdin: {}", e);
                }
            })),
            _ => None,
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let limit = self.limits.max_output_bytes;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_rx = stop_rx.clone();
        let stdout_task = tokio::spawn(async move {
            match stdout_pipe {
                Some(pipe) => capture(pipe, limit, stdout_rx).await,
                None => CapturedOutput::default(),
            }
        });
        let stderr_task = tokio::spawn(async move {
            match stderr_pipe {
                Some(pipe) => capture(pipe, limit, stop_rx).await,
                None => CapturedOutput::default(),
            }
        });

        // The exit branch is polled first: a child that has already exited wins even
        // if the deadline elapsed in the same instant.
        let status = tokio::select! {
            biased;
            exited = wait_for_exit(&mut child, pid) => {
                let exit_status = exited.map_err(|e| launch_error(program, e))?;
                status_from_exit(exit_status)
            }
            _ = sleep_until(deadline) => {
                warn!(
                    "Process {:?} exceeded {:?}; killing process group",
                    pid, self.limits.timeout
                );
                terminate(&mut child, pid);
                if let Err(e) = child.wait().await {
                    warn!("Failed to reap timed-out process {:?}: {}", pid, e);
                }
                ExecutionStatus::TimedOut
            }
        };
        let duration = started.elapsed();

        let readers = async { tokio::join!(stdout_task, stderr_task) };
        tokio::pin!(readers);
        let (stdout, stderr) = tokio::select! {
            joined = &mut readers => joined,
            _ = tokio::time::sleep(OUTPUT_DRAIN_GRACE) => {
                debug!("Output pipes still open after exit; stopping readers");
                let _ = stop_tx.send(true);
                readers.await
            }
        };
        if let Some(task) = stdin_task {
            task.abort();
        }

        let outcome = ExecutionOutcome {
            status,
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
            duration,
        };

        info!(
            "Process {:?} finished: status={:?}, duration_ms={}, stdout_bytes={}, stderr_bytes={}",
            pid,
            outcome.status,
            outcome.duration_ms(),
            outcome.stdout.total_bytes,
            outcome.stderr.total_bytes
        );

        Ok(outcome)
    }
}

fn launch_error(program: &str, source: std::io::Error) -> Error {
    if source.kind() == std::io::ErrorKind::NotFound {
        Error::InterpreterMissing {
            program: program.to_string(),
        }
    } else {
        Error::Launch {
            program: program.to_string(),
            source,
        }
    }
}

#[cfg(unix)]
fn status_from_exit(status: ExitStatus) -> ExecutionStatus {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => ExecutionStatus::Exited(code),
        (None, Some(sig)) => ExecutionStatus::Signaled(sig),
        (None, None) => ExecutionStatus::Exited(-1),
    }
}

#[cfg(not(unix))]
fn status_from_exit(status: ExitStatus) -> ExecutionStatus {
    ExecutionStatus::Exited(status.code().unwrap_or(-1))
}

#[cfg(unix)]
fn configure_isolation(cmd: &mut Command, limits: &ResourceLimits) {
    // New process group led by the child, so killpg(pid) reaches its descendants
    cmd.process_group(0);

    let rlimits = limits.rlimits();
    // SAFETY: the hook only calls setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || rlimits.apply());
    }
}

#[cfg(not(unix))]
fn configure_isolation(_cmd: &mut Command, _limits: &ResourceLimits) {}

#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // The child is not reaped yet, so its pid still names our process group
    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pid, e);
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {}", e);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {}", e);
    }
}

/// Wait for the leader to exit, killing what is left of its group before reaping it.
///
/// An exited but unreaped leader keeps its pid, so the pgid cannot have been handed to
/// another group when the stragglers are signalled.
#[cfg(target_os = "linux")]
async fn wait_for_exit(child: &mut Child, pid: Option<u32>) -> std::io::Result<ExitStatus> {
    if let Some(pid) = pid {
        exited_unreaped(pid).await?;
        kill_stragglers(pid);
    }
    child.wait().await
}

/// Without `waitid` the leader cannot be observed unreaped, so stragglers are left alone
#[cfg(not(target_os = "linux"))]
async fn wait_for_exit(child: &mut Child, _pid: Option<u32>) -> std::io::Result<ExitStatus> {
    child.wait().await
}

#[cfg(target_os = "linux")]
async fn exited_unreaped(pid: u32) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::wait::{waitid, Id, WaitPidFlag};
    use nix::unistd::Pid;

    tokio::task::spawn_blocking(move || loop {
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT;
        match waitid(Id::Pid(Pid::from_raw(pid as i32)), flags) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(std::io::Error::from(e)),
        }
    })
    .await
    .map_err(std::io::Error::other)?
}

#[cfg(target_os = "linux")]
fn kill_stragglers(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => debug!("Killed leftover processes in group {}", pgid),
        Err(Errno::ESRCH) => {}
        Err(e) => debug!("killpg({}) for stragglers failed: {}", pgid, e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;

    async fn run_in(
        supervisor: &ProcessSupervisor,
        work_dir: &Path,
        command: &[String],
        stdin: Option<&str>,
    ) -> Result<ExecutionOutcome> {
        let mut spec = ExecutionSpec::new(work_dir).with_command(command.to_vec());
        if let Some(input) = stdin {
            spec = spec.with_stdin(input);
        }
        supervisor.run(&spec).await
    }

    fn supervisor(timeout: Duration) -> ProcessSupervisor {
        ProcessSupervisor::new(ResourceLimits::default().with_timeout(timeout))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_exit_code_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(
            &supervisor(Duration::from_secs(10)),
            dir.path(),
            &sh("echo out; echo err >&2; exit 3"),
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Exited(3));
        assert_eq!(outcome.exit_code(), 3);
        assert_eq!(outcome.stdout.clone().into_string(), "out\n");
        assert_eq!(outcome.stderr.clone().into_string(), "err\n");
        assert!(outcome.duration_ms() > 0);
    }

    #[tokio::test]
    async fn test_stdin_is_piped() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(
            &supervisor(Duration::from_secs(10)),
            dir.path(),
            &sh("cat"),
            Some("from stdin"),
        )
        .await
        .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.stdout.into_string(), "from stdin");
    }

    #[tokio::test]
    async fn test_missing_stdin_reads_eof() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(
            &supervisor(Duration::from_secs(5)),
            dir.path(),
            &sh("cat; echo done"),
            None,
        )
        .await
        .unwrap();

        assert!(!outcome.timed_out());
        assert_eq!(outcome.stdout.into_string(), "done\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let outcome = run_in(
            &supervisor(Duration::from_millis(500)),
            dir.path(),
            &sh("echo before; sleep 30"),
            None,
        )
        .await
        .unwrap();

        assert!(outcome.timed_out());
        assert_eq!(outcome.exit_code(), TIMEOUT_EXIT_CODE);
        assert_eq!(outcome.stdout.into_string(), "before\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_signal_death_is_negative() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(
            &supervisor(Duration::from_secs(10)),
            dir.path(),
            &sh("kill -TERM $$"),
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Signaled(15));
        assert_eq!(outcome.exit_code(), -15);
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let outcome = run_in(
            &supervisor(Duration::from_secs(20)),
            dir.path(),
            &sh("sleep 30 & echo spawned"),
            None,
        )
        .await
        .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.stdout.into_string(), "spawned\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stragglers_are_killed_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(
            &supervisor(Duration::from_secs(20)),
            dir.path(),
            &sh("sleep 30 >/dev/null 2>&1 & echo $!"),
            None,
        )
        .await
        .unwrap();

        assert!(outcome.is_success());
        let pid = outcome.stdout.into_string().trim().to_string();
        assert!(!pid.is_empty());

        // The orphan is reparented and reaped elsewhere; at most a zombie may remain
        let mut alive = true;
        for _ in 0..20 {
            alive = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Ok(stat) => !stat
                    .rsplit(')')
                    .next()
                    .map(|rest| rest.trim_start().starts_with('Z'))
                    .unwrap_or(false),
                Err(_) => false,
            };
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!alive, "straggler {} survived", pid);
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(
            ResourceLimits::default()
                .with_timeout(Duration::from_secs(20))
                .with_max_output_bytes(1024),
        );
        let outcome = run_in(
            &supervisor,
            dir.path(),
            &sh("head -c 200000 /dev/zero | tr '\\0' 'a'"),
            None,
        )
        .await
        .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.stdout.data.len(), 1024);
        assert_eq!(outcome.stdout.total_bytes, 200_000);
        assert!(outcome.stdout.truncated);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_in(
            &supervisor(Duration::from_secs(5)),
            dir.path(),
            &["definitely-not-a-real-binary-codeexec".to_string()],
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::InterpreterMissing { .. }));
    }

    #[tokio::test]
    async fn test_missing_work_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = run_in(&supervisor(Duration::from_secs(5)), &missing, &sh("true"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Workspace(_)));
    }
}
