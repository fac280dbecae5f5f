use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::exec::profiles::RuntimeProfile;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),
    #[error("scratch setup failed: {0}")]
    Scratch(std::io::Error),
    #[error("sandbox spawn failed: {0}")]
    Spawn(std::io::Error),
}

/// Resource limits applied to one execution job
#[derive(Debug, Clone, Copy)]
pub struct JobLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// Raw outcome of one sandboxed run
pub struct SandboxRun {
    /// Combined stdout/stderr, capped at the output ceiling
    pub output: Vec<u8>,
    pub timed_out: bool,
    pub exit_ok: bool,
}

/// Capability for launching one isolated execution unit.
///
/// The invariant every backend must preserve: isolation from the host and
/// from other jobs, guaranteed cleanup, bounded wall-clock time. The concrete
/// mechanism (containers, restricted subprocess) is swappable.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn run(
        &self,
        profile: &RuntimeProfile,
        entry_path: &Path,
        work_dir: &Path,
        limits: &JobLimits,
    ) -> Result<SandboxRun, ExecError>;
}

/// Read up to `cap` bytes, then keep draining so the child never blocks on a
/// full pipe. This bounds memory against runaway producers.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut buf = vec![0u8; 8192];
    let mut out = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if out.len() < cap {
                    let take = n.min(cap - out.len());
                    out.extend_from_slice(&buf[..take]);
                }
            }
        }
    }
    out
}

/// Grace period for collecting pipe output once the job itself is done
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Kill the job's whole process group. Backgrounded grandchildren inherit the
/// stdout/stderr write ends, so leaving them alive would both break isolation
/// and keep the output pipes open past the job's lifetime.
#[cfg(unix)]
async fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid else { return };
    // Signalling an already-dead group is fine; the error is ignored
    let _ = Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pgid)])
        .output()
        .await;
}

#[cfg(not(unix))]
async fn kill_group(_pgid: Option<u32>) {}

/// Collect a drain task's output, giving up after the grace period in case
/// something outside the process group still holds the pipe open.
async fn drain_or_abort(mut task: tokio::task::JoinHandle<Vec<u8>>, grace: Duration) -> Vec<u8> {
    match timeout(grace, &mut task).await {
        Ok(out) => out.unwrap_or_default(),
        Err(_elapsed) => {
            task.abort();
            Vec::new()
        }
    }
}

/// Spawn the prepared command in its own process group, capture capped
/// combined output and enforce the wall-clock timeout. The whole group is
/// torn down on every exit path, so a job can never outlive its bound by
/// backgrounding children.
async fn run_with_limits(mut cmd: Command, limits: &JobLimits) -> Result<SandboxRun, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
    // With process_group(0) the group id is the child's pid; taken before
    // wait() clears it
    let group = child.id();

    // Each stream gets the full ceiling; the combined result is capped again
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let cap = limits.max_output_bytes;
    let stdout_task =
        tokio::spawn(async move { read_capped(stdout.expect("stdout piped"), cap).await });
    let stderr_task =
        tokio::spawn(async move { read_capped(stderr.expect("stderr piped"), cap).await });

    let (timed_out, exit_ok) = match timeout(limits.timeout, child.wait()).await {
        Ok(Ok(status)) => (false, status.success()),
        Ok(Err(e)) => return Err(ExecError::Spawn(e)),
        Err(_elapsed) => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed-out job: {}", e);
            }
            (true, false)
        }
    };
    kill_group(group).await;

    let mut output = drain_or_abort(stdout_task, DRAIN_GRACE).await;
    let mut err_bytes = drain_or_abort(stderr_task, DRAIN_GRACE).await;
    err_bytes.truncate(limits.max_output_bytes.saturating_sub(output.len()));
    output.extend_from_slice(&err_bytes);
    output.truncate(limits.max_output_bytes);

    Ok(SandboxRun {
        output,
        timed_out,
        exit_ok,
    })
}

/// Runs each job in its own container: source mounted read-only, no network,
/// writable byproducts confined to the container's /tmp.
pub struct DockerProvider;

#[async_trait]
impl SandboxProvider for DockerProvider {
    async fn run(
        &self,
        profile: &RuntimeProfile,
        entry_path: &Path,
        _work_dir: &Path,
        limits: &JobLimits,
    ) -> Result<SandboxRun, ExecError> {
        let job_name = format!("nexus-exec-{}", Uuid::new_v4());
        let guest_entry = format!("/sandbox/{}", profile.entry_file);
        let mount = format!("{}:{}:ro", entry_path.display(), guest_entry);
        let argv = profile.resolve_command(&guest_entry, "/tmp");

        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "--name", &job_name, "--network", "none"])
            .args(["--memory", "256m", "--cpus", "1"])
            .args(["-v", mount.as_str(), profile.image.as_str()])
            .args(&argv);

        debug!("Launching container {} for {}", job_name, profile.language);
        let run = run_with_limits(cmd, limits).await?;

        if run.timed_out {
            // Killing the docker client does not stop the container; tear the
            // whole process tree down by name.
            let kill = Command::new("docker")
                .args(["kill", &job_name])
                .output()
                .await;
            if let Err(e) = kill {
                warn!("docker kill {} failed: {}", job_name, e);
            }
        }
        Ok(run)
    }
}

/// Restricted subprocess backend for docker-less deployments and tests.
/// The scratch directory doubles as the working directory for byproducts.
pub struct ProcessProvider;

#[async_trait]
impl SandboxProvider for ProcessProvider {
    async fn run(
        &self,
        profile: &RuntimeProfile,
        entry_path: &Path,
        work_dir: &Path,
        limits: &JobLimits,
    ) -> Result<SandboxRun, ExecError> {
        let argv = profile.resolve_command(
            &entry_path.display().to_string(),
            &work_dir.display().to_string(),
        );
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(work_dir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin");

        debug!("Launching subprocess for {}", profile.language);
        run_with_limits(cmd, limits).await
    }
}
