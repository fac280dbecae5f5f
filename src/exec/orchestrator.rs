use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::exec::profiles::RuntimeProfile;
use crate::exec::provider::{ExecError, JobLimits, SandboxProvider};
use crate::utils::scope_guard::ScopeGuard;

/// Final result of one execution job.
///
/// A timeout or a non-zero exit (including compiler failure) is a normal,
/// successfully handled result, not an orchestrator fault.
#[derive(Debug)]
pub struct ExecutionResult {
    pub output: String,
    pub timed_out: bool,
    pub crashed: bool,
}

/// Accepts (language, source) pairs and runs them in isolated, time-bounded
/// sandboxes on a bounded worker pool.
pub struct ExecOrchestrator {
    profiles: Vec<RuntimeProfile>,
    provider: Arc<dyn SandboxProvider>,
    permits: Arc<Semaphore>,
    limits: JobLimits,
    running: AtomicU32,
    scratch_prefix: String,
}

impl ExecOrchestrator {
    pub fn new(
        profiles: Vec<RuntimeProfile>,
        provider: Arc<dyn SandboxProvider>,
        max_jobs: usize,
        limits: JobLimits,
    ) -> Self {
        Self {
            profiles,
            provider,
            permits: Arc::new(Semaphore::new(max_jobs)),
            limits,
            running: AtomicU32::new(0),
            scratch_prefix: "nexus-exec-".to_string(),
        }
    }

    #[cfg(test)]
    fn with_scratch_prefix(mut self, prefix: &str) -> Self {
        self.scratch_prefix = prefix.to_string();
        self
    }

    /// Jobs currently holding a pool permit, for diagnostics
    pub fn running_jobs(&self) -> u32 {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one snippet. Unknown languages fail fast without creating a job;
    /// everything past the registry lookup produces an [`ExecutionResult`].
    pub async fn submit(&self, language: &str, code: &str) -> Result<ExecutionResult, ExecError> {
        let profile = self
            .profiles
            .iter()
            .find(|p| p.language == language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(language.to_string()))?;

        // The semaphore is never closed
        let _permit = self.permits.acquire().await.expect("worker pool closed");
        self.running.fetch_add(1, Ordering::SeqCst);
        let _running = ScopeGuard::new(|| {
            self.running.fetch_sub(1, Ordering::SeqCst);
        });

        info!("Executing {} job ({} bytes of source)", language, code.len());

        // Scratch lives exactly as long as the job: the TempDir is removed on
        // every exit path, compiled byproducts included.
        let scratch = tempfile::Builder::new()
            .prefix(&self.scratch_prefix)
            .tempdir()
            .map_err(ExecError::Scratch)?;
        let entry_path = scratch.path().join(&profile.entry_file);
        tokio::fs::write(&entry_path, code)
            .await
            .map_err(ExecError::Scratch)?;

        let run = self
            .provider
            .run(profile, &entry_path, scratch.path(), &self.limits)
            .await;

        if let Err(e) = scratch.close() {
            error!("Failed to remove scratch dir: {}", e);
        }

        let run = run?;
        let result = ExecutionResult {
            output: String::from_utf8_lossy(&run.output).into_owned(),
            timed_out: run.timed_out,
            crashed: !run.timed_out && !run.exit_ok,
        };
        info!(
            "Job finished: language={}, timed_out={}, crashed={}, {} output bytes",
            language,
            result.timed_out,
            result.crashed,
            result.output.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::provider::ProcessProvider;
    use std::time::{Duration, Instant};

    fn shell_profile() -> RuntimeProfile {
        RuntimeProfile {
            language: "shell".to_string(),
            image: String::new(),
            entry_file: "script.sh".to_string(),
            command: vec!["sh".to_string(), "{entry}".to_string()],
        }
    }

    fn orchestrator(prefix: &str, limits: JobLimits) -> ExecOrchestrator {
        ExecOrchestrator::new(
            vec![shell_profile()],
            Arc::new(ProcessProvider),
            2,
            limits,
        )
        .with_scratch_prefix(prefix)
    }

    fn default_limits() -> JobLimits {
        JobLimits {
            timeout: Duration::from_secs(5),
            max_output_bytes: 64 * 1024,
        }
    }

    fn leftover_scratch_dirs(prefix: &str) -> usize {
        std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
            .count()
    }

    #[tokio::test]
    async fn unknown_language_fails_fast() {
        let orch = orchestrator("t-unknown-", default_limits());
        let err = orch.submit("cobol", "DISPLAY '2'.").await.unwrap_err();
        assert!(matches!(err, ExecError::UnsupportedLanguage(_)));
    }

    #[tokio::test]
    async fn successful_run_captures_combined_output() {
        let orch = orchestrator("t-ok-", default_limits());
        let result = orch
            .submit("shell", "echo out-line\necho err-line >&2\n")
            .await
            .unwrap();
        assert!(result.output.contains("out-line"));
        assert!(result.output.contains("err-line"));
        assert!(!result.crashed);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_crashed_not_a_fault() {
        let orch = orchestrator("t-crash-", default_limits());
        let result = orch
            .submit("shell", "echo diagnostics >&2\nexit 3\n")
            .await
            .unwrap();
        assert!(result.crashed);
        assert!(!result.timed_out);
        assert!(result.output.contains("diagnostics"));
    }

    #[tokio::test]
    async fn timeout_kills_the_job_and_cleans_scratch() {
        let prefix = "t-timeout-";
        let limits = JobLimits {
            timeout: Duration::from_millis(300),
            max_output_bytes: 64 * 1024,
        };
        let orch = orchestrator(prefix, limits);

        let started = Instant::now();
        let result = orch
            .submit("shell", "while :; do :; done\n")
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(!result.crashed);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(leftover_scratch_dirs(prefix), 0);
    }

    #[tokio::test]
    async fn timeout_holds_when_the_job_backgrounds_a_child() {
        let prefix = "t-bg-timeout-";
        let limits = JobLimits {
            timeout: Duration::from_millis(300),
            max_output_bytes: 64 * 1024,
        };
        let orch = orchestrator(prefix, limits);

        // The backgrounded sleep inherits the output pipes; the job bound
        // must hold regardless.
        let started = Instant::now();
        let result = orch
            .submit("shell", "sleep 8 &\nwhile :; do :; done\n")
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "submit took {:?}",
            started.elapsed()
        );
        assert_eq!(leftover_scratch_dirs(prefix), 0);
    }

    #[tokio::test]
    async fn exited_job_does_not_wait_for_surviving_children() {
        let orch = orchestrator("t-bg-exit-", default_limits());

        let started = Instant::now();
        let result = orch
            .submit("shell", "echo done\nsleep 8 &\nexit 0\n")
            .await
            .unwrap();

        assert!(!result.timed_out);
        assert!(!result.crashed);
        assert!(result.output.contains("done"));
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "submit took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn scratch_is_removed_after_success_and_crash() {
        let prefix = "t-clean-";
        let orch = orchestrator(prefix, default_limits());
        orch.submit("shell", "echo fine\n").await.unwrap();
        orch.submit("shell", "exit 1\n").await.unwrap();
        assert_eq!(leftover_scratch_dirs(prefix), 0);
    }

    #[tokio::test]
    async fn output_is_truncated_at_the_byte_ceiling() {
        let limits = JobLimits {
            timeout: Duration::from_secs(5),
            max_output_bytes: 100,
        };
        let orch = orchestrator("t-trunc-", limits);
        let result = orch
            .submit(
                "shell",
                "i=0\nwhile [ $i -lt 1000 ]; do echo 0123456789; i=$((i+1)); done\n",
            )
            .await
            .unwrap();
        assert!(result.output.len() <= 100);
        assert!(!result.crashed);
    }
}
