//! Resource limits for a single execution
//!
//! The wall-clock timeout is always enforced by the supervisor. Memory and CPU caps
//! are rlimits set in the child between fork and exec; on platforms without rlimits
//! they are accepted and ignored.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Wall-clock budget
    pub timeout: Duration,
    /// Address-space cap in MB (0 disables)
    pub max_memory_mb: u64,
    /// CPU time cap in seconds (0 disables)
    pub max_cpu_secs: u64,
    /// Bytes kept per output stream
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_memory_mb: 512,
            max_cpu_secs: 30,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// The subset that must be copied into the pre-exec hook
    pub(crate) fn rlimits(&self) -> RLimits {
        RLimits {
            memory_bytes: (self.max_memory_mb > 0)
                .then(|| self.max_memory_mb.saturating_mul(1024 * 1024)),
            cpu_secs: (self.max_cpu_secs > 0).then_some(self.max_cpu_secs),
        }
    }
}

/// Plain-data rlimit values; `Copy` so the pre-exec closure owns them outright
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_secs: Option<u64>,
}

#[cfg(unix)]
impl RLimits {
    /// Apply the limits to the calling process.
    ///
    /// Runs in the forked child before exec, so it only issues `setrlimit` syscalls.
    pub(crate) fn apply(&self) -> std::io::Result<()> {
        use nix::libc::rlim_t;
        use nix::sys::resource::{setrlimit, Resource};

        if let Some(bytes) = self.memory_bytes {
            setrlimit(Resource::RLIMIT_AS, bytes as rlim_t, bytes as rlim_t)
                .map_err(std::io::Error::from)?;
        }

        if let Some(secs) = self.cpu_secs {
            // Soft limit delivers SIGXCPU, the hard limit one second later SIGKILL
            setrlimit(
                Resource::RLIMIT_CPU,
                secs as rlim_t,
                secs.saturating_add(1) as rlim_t,
            )
            .map_err(std::io::Error::from)?;
        }

        Ok(())
    }
}
