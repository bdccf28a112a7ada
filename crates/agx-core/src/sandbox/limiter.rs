//! Resource limiter capability: arms ceilings before spawn, samples memory
//! while the child runs, and hard-kills it.

use std::sync::Arc;

use tokio::process::{Child, Command};

use super::config::SandboxConfig;
use super::error::SandboxResult;

/// Platform hook around one child process.
pub trait ResourceLimiter: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Arm limits on the command before it is spawned.
    fn prepare(&self, command: &mut Command, config: &SandboxConfig) -> SandboxResult<()>;

    /// Current resident-set size of `pid`, when the platform exposes it.
    fn resident_bytes(&self, pid: u32) -> Option<u64>;

    /// Kill the child and everything it spawned. The caller still reaps it.
    fn terminate(&self, child: &mut Child) -> std::io::Result<()>;
}

/// Limiter for the current target.
pub fn default_limiter() -> Arc<dyn ResourceLimiter> {
    #[cfg(unix)]
    {
        Arc::new(RlimitLimiter)
    }
    #[cfg(not(unix))]
    {
        Arc::new(PortableLimiter)
    }
}

/// Kill-only limiter: no pre-spawn ceilings and no memory sampling.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortableLimiter;

impl ResourceLimiter for PortableLimiter {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn prepare(&self, _command: &mut Command, _config: &SandboxConfig) -> SandboxResult<()> {
        Ok(())
    }

    fn resident_bytes(&self, _pid: u32) -> Option<u64> {
        None
    }

    fn terminate(&self, child: &mut Child) -> std::io::Result<()> {
        child.start_kill()
    }
}

/// POSIX limiter: own process group, `RLIMIT_AS` and `RLIMIT_CORE=0` set in
/// the child, `killpg(SIGKILL)` on terminate, `/proc` RSS sampling on Linux.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RlimitLimiter;

#[cfg(unix)]
fn apply_rlimits(memory_limit_bytes: u64) -> std::io::Result<()> {
    // Runs between fork and exec: async-signal-safe calls only.
    unsafe {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            #[allow(clippy::useless_conversion)]
            let v: libc::rlim_t = memory_limit_bytes as libc::rlim_t;
            let as_limit = libc::rlimit {
                rlim_cur: v,
                rlim_max: v,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &as_limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = memory_limit_bytes;
        }

        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(unix)]
impl ResourceLimiter for RlimitLimiter {
    fn name(&self) -> &'static str {
        "rlimit"
    }

    fn prepare(&self, command: &mut Command, config: &SandboxConfig) -> SandboxResult<()> {
        let memory_limit_bytes = config.memory_limit_bytes;
        command.process_group(0);
        unsafe {
            command.pre_exec(move || apply_rlimits(memory_limit_bytes));
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn resident_bytes(&self, pid: u32) -> Option<u64> {
        let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        Some(pages.saturating_mul(page_size as u64))
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_bytes(&self, _pid: u32) -> Option<u64> {
        None
    }

    fn terminate(&self, child: &mut Child) -> std::io::Result<()> {
        if let Some(pid) = child.id() {
            // The child leads its own group, so its pid is the group id.
            let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::warn!(pid, error = %err, "killpg failed, killing child only");
                }
            }
        }
        match child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}
