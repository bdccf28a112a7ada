//! One sandbox session: a scoped working directory plus serialized
//! executions under the session's limits.

use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::metrics::METRICS;
use crate::obs;

use super::capability::find_denied;
use super::capture;
use super::config::SandboxConfig;
use super::error::{SandboxError, SandboxResult};
use super::limiter::{default_limiter, ResourceLimiter};
use super::result::{ExecutionResult, TerminationReason};

const SCRIPT_NAME: &str = "_agx_main.py";
/// How long to wait for pipe readers once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How the wait loop ended.
enum Stop {
    Exited(ExitStatus),
    Timeout,
    MemoryExceeded,
    OutputExceeded,
    Cancelled,
}

/// Scoped sandbox. The working directory is created on first use and
/// removed by [`close`](Self::close) or on drop.
#[derive(Debug)]
pub struct SandboxSession {
    id: Uuid,
    config: SandboxConfig,
    limiter: Arc<dyn ResourceLimiter>,
    workdir: Option<TempDir>,
}

impl SandboxSession {
    /// Open a session with the platform's default limiter.
    pub fn open(config: SandboxConfig) -> SandboxResult<Self> {
        Self::open_with_limiter(config, default_limiter())
    }

    pub fn open_with_limiter(
        config: SandboxConfig,
        limiter: Arc<dyn ResourceLimiter>,
    ) -> SandboxResult<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        debug!(session = %id, limiter = limiter.name(), "sandbox session opened");
        Ok(Self {
            id,
            config,
            limiter,
            workdir: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The working directory, once it exists.
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(TempDir::path)
    }

    fn ensure_workdir(&mut self) -> SandboxResult<PathBuf> {
        if let Some(dir) = &self.workdir {
            return Ok(dir.path().to_path_buf());
        }
        let mut builder = tempfile::Builder::new();
        builder.prefix("agx-sandbox-");
        let dir = match &self.config.work_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::infrastructure("create working directory", e))?;
        let path = dir.path().to_path_buf();
        debug!(session = %self.id, workdir = %path.display(), "working directory created");
        self.workdir = Some(dir);
        Ok(path)
    }

    /// Copy `bytes` into the working directory at `relative_path`.
    ///
    /// Absolute paths and `..` components are rejected.
    pub async fn stage_input(&mut self, relative_path: &str, bytes: &[u8]) -> SandboxResult<PathBuf> {
        let rel = Path::new(relative_path);
        let confined = !relative_path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !confined {
            return Err(SandboxError::InvalidConfig(format!(
                "staged input path must be relative and stay inside the working directory: {relative_path}"
            )));
        }
        let target = self.ensure_workdir()?.join(rel);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::infrastructure("create staging directory", e))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| SandboxError::infrastructure("stage input", e))?;
        Ok(target)
    }

    /// Run `code` to completion or until a limit stops it.
    pub async fn execute(&mut self, code: &str) -> SandboxResult<ExecutionResult> {
        self.execute_cancellable(code, &CancellationToken::new())
            .await
    }

    /// Read a script from the caller's filesystem and run it. An unreadable
    /// script is a failed result, not an error.
    pub async fn execute_file(&mut self, path: &Path) -> SandboxResult<ExecutionResult> {
        let started = Instant::now();
        match tokio::fs::read_to_string(path).await {
            Ok(code) => self.execute(&code).await,
            Err(e) => {
                let detail = if e.kind() == std::io::ErrorKind::NotFound {
                    format!("File not found: {}", path.display())
                } else {
                    format!("Cannot read {}: {e}", path.display())
                };
                Ok(ExecutionResult::rejected(
                    TerminationReason::Normal,
                    detail,
                    started.elapsed(),
                ))
            }
        }
    }

    /// Like [`execute`](Self::execute), but `cancel` kills and reaps the
    /// process group and yields [`SandboxError::Cancelled`].
    #[instrument(skip_all, fields(session = %self.id))]
    pub async fn execute_cancellable(
        &mut self,
        code: &str,
        cancel: &CancellationToken,
    ) -> SandboxResult<ExecutionResult> {
        let started = Instant::now();
        METRICS.inc_sandbox_runs();

        if let Some(hit) = find_denied(code, &self.config.denied_capabilities) {
            let result = ExecutionResult::rejected(
                TerminationReason::DeniedCapability,
                hit.to_string(),
                started.elapsed(),
            );
            finish(&result);
            return Ok(result);
        }
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let workdir = self.ensure_workdir()?;
        let script = workdir.join(SCRIPT_NAME);
        tokio::fs::write(&script, code)
            .await
            .map_err(|e| SandboxError::infrastructure("write script", e))?;

        let mut command = self.command(&workdir, &script);
        self.limiter.prepare(&mut command, &self.config)?;
        let mut child = command.spawn().map_err(|e| {
            SandboxError::infrastructure(format!("spawn {}", self.config.interpreter), e)
        })?;
        let pid = child.id();

        let overflow = Arc::new(Notify::new());
        let stdout = capture::shared(self.config.max_output_bytes);
        let stderr = capture::shared(self.config.max_output_bytes);
        let mut readers: Vec<JoinHandle<std::io::Result<()>>> = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(capture::drain(out, stdout.clone(), overflow.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(capture::drain(err, stderr.clone(), overflow.clone())));
        }

        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.config.memory_poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut peak_rss: Option<u64> = None;
        let stop = loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => break Stop::Exited(status),
                        Err(e) => {
                            self.kill(&mut child).await;
                            abort_readers(readers);
                            return Err(SandboxError::infrastructure("wait for child", e));
                        }
                    }
                }
                _ = &mut deadline => break Stop::Timeout,
                _ = cancel.cancelled() => break Stop::Cancelled,
                _ = overflow.notified(), if self.config.kill_on_output_overflow => {
                    break Stop::OutputExceeded;
                }
                _ = poll.tick() => {
                    if let Some(rss) = pid.and_then(|p| self.limiter.resident_bytes(p)) {
                        peak_rss = Some(peak_rss.map_or(rss, |peak| peak.max(rss)));
                        if rss > self.config.memory_limit_bytes {
                            break Stop::MemoryExceeded;
                        }
                    }
                }
            }
        };

        if !matches!(stop, Stop::Exited(_)) {
            self.kill(&mut child).await;
        }
        collect_readers(readers).await;

        if matches!(stop, Stop::Cancelled) {
            debug!(session = %self.id, "execution cancelled");
            return Err(SandboxError::Cancelled);
        }

        let (stdout_text, stdout_truncated) = capture::snapshot(&stdout);
        let (mut stderr_text, stderr_truncated) = capture::snapshot(&stderr);
        let elapsed = started.elapsed();

        let (success, termination, exit_code) = match stop {
            Stop::Exited(status) => {
                let out_of_memory = !status.success()
                    && looks_out_of_memory(
                        exit_signal(&status),
                        &stderr_text,
                        peak_rss,
                        self.config.memory_limit_bytes,
                    );
                let termination = if out_of_memory {
                    TerminationReason::MemoryExceeded
                } else {
                    TerminationReason::Normal
                };
                (
                    status.success() && termination == TerminationReason::Normal,
                    termination,
                    status.code(),
                )
            }
            Stop::Timeout => {
                append_note(
                    &mut stderr_text,
                    &format!("Execution timed out after {}s", self.config.timeout_secs),
                    self.config.max_output_bytes,
                );
                (false, TerminationReason::Timeout, None)
            }
            Stop::MemoryExceeded => {
                append_note(
                    &mut stderr_text,
                    &format!(
                        "Memory limit of {} bytes exceeded",
                        self.config.memory_limit_bytes
                    ),
                    self.config.max_output_bytes,
                );
                (false, TerminationReason::MemoryExceeded, None)
            }
            Stop::OutputExceeded => (false, TerminationReason::OutputExceeded, None),
            Stop::Cancelled => return Err(SandboxError::Cancelled),
        };

        let result = ExecutionResult {
            success,
            stdout: stdout_text,
            stderr: stderr_text,
            duration_seconds: elapsed.as_secs_f64(),
            truncated: stdout_truncated || stderr_truncated,
            termination_reason: termination,
            exit_code,
        };
        finish(&result);
        Ok(result)
    }

    fn command(&self, workdir: &Path, script: &Path) -> Command {
        let mut command = Command::new(&self.config.interpreter);
        command
            .args(&self.config.interpreter_args)
            .arg(script)
            .current_dir(workdir)
            .env_clear()
            .env("HOME", workdir)
            .env("TMPDIR", workdir)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        command
    }

    async fn kill(&self, child: &mut tokio::process::Child) {
        if let Err(e) = self.limiter.terminate(child) {
            warn!(session = %self.id, error = %e, "failed to kill sandboxed process");
        }
        if let Err(e) = child.wait().await {
            warn!(session = %self.id, error = %e, "failed to reap sandboxed process");
        }
    }

    /// Remove the working directory now.
    pub fn close(mut self) -> SandboxResult<()> {
        if let Some(dir) = self.workdir.take() {
            dir.close()
                .map_err(|e| SandboxError::infrastructure("remove working directory", e))?;
        }
        debug!(session = %self.id, "sandbox session closed");
        Ok(())
    }
}

/// Resident size at or above this share of the ceiling counts as "near" it.
const NEAR_CEILING_PERCENT: u64 = 90;

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt as _;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// An allocation failure under the address-space ceiling ends the traceback
/// with `MemoryError`. A SIGKILL/SIGSEGV death only counts when the last
/// resident samples were already close to the ceiling.
fn looks_out_of_memory(signal: Option<i32>, stderr: &str, peak_rss: Option<u64>, limit: u64) -> bool {
    let last_line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    if last_line == "MemoryError" || last_line.starts_with("MemoryError:") {
        return true;
    }
    #[cfg(unix)]
    {
        if matches!(signal, Some(libc::SIGKILL) | Some(libc::SIGSEGV)) {
            let near = limit / 100 * NEAR_CEILING_PERCENT;
            return peak_rss.is_some_and(|rss| rss >= near);
        }
    }
    #[cfg(not(unix))]
    let _ = (signal, peak_rss, limit);
    false
}

fn append_note(stderr: &mut String, note: &str, max: usize) {
    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(note);
    if stderr.len() > max {
        let text = std::mem::take(stderr);
        *stderr = capture::within_bytes(text, max);
    }
}

fn abort_readers(readers: Vec<JoinHandle<std::io::Result<()>>>) {
    for reader in readers {
        reader.abort();
    }
}

async fn collect_readers(readers: Vec<JoinHandle<std::io::Result<()>>>) {
    for mut reader in readers {
        match tokio::time::timeout(DRAIN_GRACE, &mut reader).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "output reader failed"),
            Ok(Err(e)) => warn!(error = %e, "output reader panicked"),
            Err(_) => {
                warn!("output pipe still open after child exit, abandoning reader");
                reader.abort();
            }
        }
    }
}

fn finish(result: &ExecutionResult) {
    if result.termination_reason.is_limit_violation() {
        METRICS.inc_limit_violations();
    }
    obs::emit_sandbox_finished(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_error_only_counts_on_final_traceback_line() {
        let limit = 100 * 1024 * 1024;
        let oom = "Traceback (most recent call last):\n  File \"x\", line 1\nMemoryError\n";
        assert!(looks_out_of_memory(None, oom, None, limit));
        assert!(looks_out_of_memory(None, "MemoryError: cannot allocate\n", None, limit));

        let printed = "MemoryError is just a word here\nValueError: bad input\n";
        assert!(!looks_out_of_memory(None, printed, None, limit));
        assert!(!looks_out_of_memory(None, "CustomMemoryError: nope\n", None, limit));
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_death_needs_resident_size_near_ceiling() {
        let limit = 100 * 1024 * 1024;
        assert!(!looks_out_of_memory(Some(libc::SIGSEGV), "", None, limit));
        assert!(!looks_out_of_memory(Some(libc::SIGSEGV), "", Some(10 * 1024 * 1024), limit));
        assert!(!looks_out_of_memory(Some(libc::SIGKILL), "", Some(50 * 1024 * 1024), limit));
        assert!(looks_out_of_memory(Some(libc::SIGKILL), "", Some(95 * 1024 * 1024), limit));
        assert!(!looks_out_of_memory(Some(libc::SIGTERM), "", Some(99 * 1024 * 1024), limit));
    }

    #[test]
    fn test_append_note_stays_within_cap() {
        let mut s = "x".repeat(10);
        append_note(&mut s, "Execution timed out after 1s", 16);
        assert!(s.len() <= 16);
        assert!(s.starts_with("xxxxxxxxxx\n"));
    }

    #[tokio::test]
    async fn test_denied_code_creates_no_workdir() {
        let root = tempfile::tempdir().unwrap();
        let mut session =
            SandboxSession::open(SandboxConfig::default().with_work_root(root.path())).unwrap();
        let result = session.execute("import subprocess").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.termination_reason, TerminationReason::DeniedCapability);
        assert!(result.stderr.contains("Blocked"));
        assert!(session.workdir().is_none());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stage_input_rejects_escapes() {
        let root = tempfile::tempdir().unwrap();
        let mut session =
            SandboxSession::open(SandboxConfig::default().with_work_root(root.path())).unwrap();
        assert!(session.stage_input("../evil.txt", b"x").await.is_err());
        assert!(session.stage_input("/etc/passwd", b"x").await.is_err());

        let staged = session.stage_input("data/in.txt", b"hello").await.unwrap();
        assert_eq!(std::fs::read(&staged).unwrap(), b"hello");
        let dir = session.workdir().unwrap().to_path_buf();
        session.close().unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_missing_script_is_failed_result() {
        let mut session = SandboxSession::open(SandboxConfig::default()).unwrap();
        let result = session
            .execute_file(Path::new("/nonexistent/agx/script.py"))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.termination_reason, TerminationReason::Normal);
        assert!(result.stderr.to_lowercase().contains("not found"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_infrastructure_fault() {
        let root = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default().with_work_root(root.path());
        config.interpreter = "/nonexistent/agx-interpreter".into();
        let mut session = SandboxSession::open(config).unwrap();
        let err = session.execute("print(1)").await.unwrap_err();
        assert_eq!(
            err.termination_reason(),
            Some(TerminationReason::InternalError)
        );
        drop(session);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let err = SandboxSession::open(SandboxConfig::default().with_timeout_secs(-1.0)).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig(_)));
        let err = SandboxSession::open(SandboxConfig::default().with_timeout_secs(1e20)).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig(_)));
    }
}
