use std::{
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use cloudos_action::{ActionMap, ExecutionResult, FailureKind};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    time::Instant,
};
use tracing::Instrument;

use crate::error::RegistryError;
use crate::registry::ActionRegistry;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;
const TRUNCATED_SUFFIX: &str = "…(truncated)";

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("action has an empty command")]
    EmptyCommand,
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("wait: {0}")]
    Wait(#[source] std::io::Error),
    #[error("Action timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
}

impl RunError {
    fn into_result(self) -> ExecutionResult {
        let kind = match self {
            RunError::Timeout(_) => FailureKind::Timeout,
            RunError::EmptyCommand | RunError::Spawn { .. } | RunError::Wait(_) => {
                FailureKind::SpawnFailed
            }
        };
        ExecutionResult::failed(kind, self.to_string())
    }
}

/// Runs allowlisted actions. The only place in the agent that spawns processes.
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    registry: Arc<ActionRegistry>,
    timeout: Duration,
    spawned: Arc<AtomicU64>,
}

impl ActionExecutor {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            timeout: DEFAULT_TIMEOUT,
            spawned: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Number of child processes successfully spawned so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn list_actions(&self) -> Arc<ActionMap> {
        self.registry.list()
    }

    pub async fn add_action(&self, name: &str, raw_command: &str) -> Result<Vec<String>, RegistryError> {
        self.registry.add(name, raw_command).await
    }

    pub async fn execute(&self, name: &str) -> ExecutionResult {
        let span = tracing::info_span!("action", action = %name);
        async move {
            let Some(argv) = self.registry.get(name) else {
                tracing::warn!(outcome = "not_allowed", "rejected action outside the allowlist");
                return ExecutionResult::failed(FailureKind::NotAllowed, "Action not allowed");
            };

            tracing::info!(argv = ?argv, "executing action");
            let started = Instant::now();
            let result = match run_argv(&argv, self.timeout, &self.spawned).await {
                Ok(r) => r,
                Err(e) => e.into_result(),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &result {
                ExecutionResult::Success { code, .. } | ExecutionResult::ProcessError { code, .. } => {
                    tracing::info!(outcome = result.status(), code, elapsed_ms, "action finished");
                }
                ExecutionResult::Failed { kind, error } => {
                    tracing::error!(outcome = kind.as_str(), error = %error, elapsed_ms, "action failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, take the action down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    // The child is its own session leader, so pgid == pid.
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Kills the action's process group if `run_argv` is dropped before the child was reaped
/// and its output drained. `kill_on_drop` only reaches the direct child.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.pid.is_some() {
            kill_process_group(self.pid);
            tracing::warn!(pid = self.pid, "action abandoned by caller; killed process group");
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep draining past the cap so the child never blocks on a full pipe.
                let room = MAX_CAPTURE_BYTES.saturating_sub(out.len());
                out.extend_from_slice(&buf[..n.min(room)]);
                truncated |= n > room;
            }
        }
    }
    (out, truncated)
}

fn render_output((bytes, truncated): (Vec<u8>, bool)) -> String {
    let text = String::from_utf8_lossy(&bytes);
    let mut out = text.trim().to_string();
    if truncated {
        out.push_str(TRUNCATED_SUFFIX);
    }
    out
}

async fn run_argv(
    argv: &[String],
    budget: Duration,
    spawned: &AtomicU64,
) -> Result<ExecutionResult, RunError> {
    let (program, args) = argv.split_first().ok_or(RunError::EmptyCommand)?;
    let deadline = Instant::now() + budget;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;
    spawned.fetch_add(1, Ordering::Relaxed);
    let pid = child.id();
    let mut guard = GroupGuard { pid };
    tracing::debug!(pid, "action spawned");

    let stdout_task = tokio::spawn(read_capped(child.stdout.take()));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            kill_process_group(pid);
            guard.disarm();
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(RunError::Wait(e));
        }
        Err(_) => {
            kill_process_group(pid);
            guard.disarm();
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            tracing::warn!(pid, timeout_ms = budget.as_millis() as u64, "action killed after timeout");
            return Err(RunError::Timeout(budget));
        }
    };

    // A backgrounded grandchild can keep the pipes open after the child exits.
    let joined = tokio::time::timeout_at(deadline, async {
        let out = stdout_task.await.unwrap_or_default();
        let err = stderr_task.await.unwrap_or_default();
        (out, err)
    })
    .await;
    let Ok((stdout, stderr)) = joined else {
        kill_process_group(pid);
        guard.disarm();
        tracing::warn!(pid, "action output still open at deadline; killed process group");
        return Err(RunError::Timeout(budget));
    };
    guard.disarm();

    let code = exit_code(status);
    let stdout = render_output(stdout);
    let stderr = render_output(stderr);
    Ok(if status.success() {
        ExecutionResult::Success {
            stdout,
            stderr,
            code,
        }
    } else {
        ExecutionResult::ProcessError {
            stdout,
            stderr,
            code,
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor(actions: &[(&str, &[&str])]) -> ActionExecutor {
        let mut map = ActionMap::new();
        for (name, argv) in actions {
            map.insert(
                name.to_string(),
                argv.iter().map(|s| s.to_string()).collect(),
            );
        }
        let path = std::env::temp_dir().join("cloudos-executor-tests-unused.json");
        ActionExecutor::new(Arc::new(ActionRegistry::with_actions(path, map)))
    }

    #[tokio::test]
    async fn unknown_action_is_rejected_without_spawning() {
        let ex = executor(&[("ok", &["true"])]);
        assert!(!ex.is_allowed("rm_everything"));

        let r = ex.execute("rm_everything").await;
        assert_eq!(
            r,
            ExecutionResult::failed(FailureKind::NotAllowed, "Action not allowed")
        );
        assert_eq!(ex.spawn_count(), 0);
    }

    #[tokio::test]
    async fn zero_exit_is_success_with_trimmed_output() {
        let ex = executor(&[(
            "ok",
            &["sh", "-c", "printf '  hello world \\n\\n'; printf '\\twarn\\n' >&2"],
        )]);
        assert!(ex.is_allowed("ok"));

        let r = ex.execute("ok").await;
        assert_eq!(
            r,
            ExecutionResult::Success {
                stdout: "hello world".to_string(),
                stderr: "warn".to_string(),
                code: 0,
            }
        );
        assert_eq!(ex.spawn_count(), 1);
    }

    #[tokio::test]
    async fn non_zero_exit_is_error_with_verbatim_code() {
        let ex = executor(&[("bad", &["sh", "-c", "echo partial; echo nope >&2; exit 7"])]);

        let r = ex.execute("bad").await;
        assert_eq!(
            r,
            ExecutionResult::ProcessError {
                stdout: "partial".to_string(),
                stderr: "nope".to_string(),
                code: 7,
            }
        );
    }

    #[tokio::test]
    async fn signal_termination_maps_to_shell_style_code() {
        let ex = executor(&[("killed", &["sh", "-c", "kill -9 $$"])]);
        let r = ex.execute("killed").await;
        assert_eq!(r.status(), "error");
        assert_eq!(r.code(), Some(128 + 9));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let ex = executor(&[("ghost", &["/definitely/not/a/program"])]);
        let r = ex.execute("ghost").await;
        match r {
            ExecutionResult::Failed { kind, error } => {
                assert_eq!(kind, FailureKind::SpawnFailed);
                assert!(error.contains("/definitely/not/a/program"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(ex.spawn_count(), 0);
    }

    #[tokio::test]
    async fn empty_command_is_spawn_failure() {
        let ex = executor(&[("empty", &[])]);
        let r = ex.execute("empty").await;
        assert!(matches!(
            r,
            ExecutionResult::Failed {
                kind: FailureKind::SpawnFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn slow_action_times_out_within_budget() {
        let ex = executor(&[("slow", &["sleep", "5"])]).with_timeout(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let r = ex.execute("slow").await;
        let elapsed = started.elapsed();

        match r {
            ExecutionResult::Failed { kind, error } => {
                assert_eq!(kind, FailureKind::Timeout);
                assert!(error.contains("300 ms"), "{error}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn backgrounded_grandchild_does_not_outlive_the_budget() {
        let ex = executor(&[("daemonish", &["sh", "-c", "sleep 5 & echo started"])])
            .with_timeout(Duration::from_millis(500));

        let started = std::time::Instant::now();
        let r = ex.execute("daemonish").await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            r,
            ExecutionResult::Failed {
                kind: FailureKind::Timeout,
                ..
            }
        ));
    }

    fn process_alive(pid: i32) -> bool {
        // Orphans may linger as zombies until init reaps them; those count as gone.
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) if std::path::Path::new("/proc/self").exists() => false,
            Err(_) => unsafe { libc::kill(pid, 0) == 0 },
        }
    }

    async fn wait_until_gone(pid: i32) -> bool {
        for _ in 0..40 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn read_pid(path: &std::path::Path) -> i32 {
        for _ in 0..40 {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Ok(pid) = raw.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    #[tokio::test]
    async fn timeout_kills_child_and_its_background_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let child_pid = dir.path().join("child.pid");
        let job_pid = dir.path().join("job.pid");
        let script = format!(
            "echo $$ > {}; sleep 30 & echo $! > {}; wait",
            child_pid.display(),
            job_pid.display()
        );
        let ex = executor(&[("slow", &["sh", "-c", script.as_str()])])
            .with_timeout(Duration::from_millis(300));

        let r = ex.execute("slow").await;
        assert!(matches!(
            r,
            ExecutionResult::Failed {
                kind: FailureKind::Timeout,
                ..
            }
        ));

        let child = read_pid(&child_pid).await;
        let job = read_pid(&job_pid).await;
        assert!(wait_until_gone(child).await, "child {child} still running");
        assert!(wait_until_gone(job).await, "background job {job} still running");
    }

    #[tokio::test]
    async fn cancelled_execution_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let job_pid = dir.path().join("job.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", job_pid.display());
        let ex = Arc::new(executor(&[("slow", &["sh", "-c", script.as_str()])]));

        let task = tokio::spawn({
            let ex = ex.clone();
            async move { ex.execute("slow").await }
        });
        let job = read_pid(&job_pid).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(wait_until_gone(job).await, "background job {job} outlived its caller");
    }

    #[tokio::test]
    async fn concurrent_executions_do_not_serialize() {
        let ex = executor(&[("a", &["sleep", "1"]), ("b", &["sleep", "1"])]);

        let started = std::time::Instant::now();
        let (ra, rb) = tokio::join!(ex.execute("a"), ex.execute("b"));
        let elapsed = started.elapsed();

        assert_eq!(ra.status(), "success");
        assert_eq!(rb.status(), "success");
        assert!(elapsed < Duration::from_millis(1900), "took {elapsed:?}");
        assert_eq!(ex.spawn_count(), 2);
    }

    #[tokio::test]
    async fn registered_command_is_never_shell_interpreted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ActionRegistry::load(dir.path().join("commands.json")).await);
        let ex = ActionExecutor::new(registry);

        ex.add_action("echoish", "echo hi; id > pwned $(whoami)").await.unwrap();
        let r = ex.execute("echoish").await;
        assert_eq!(
            r,
            ExecutionResult::Success {
                stdout: "hi; id > pwned $(whoami)".to_string(),
                stderr: String::new(),
                code: 0,
            }
        );
        assert!(!dir.path().join("pwned").exists());
        assert!(ex.list_actions().contains_key("echoish"));
    }

    #[test]
    fn capture_is_trimmed_and_marked_when_truncated() {
        assert_eq!(render_output((b"  x \n".to_vec(), false)), "x");
        assert_eq!(render_output((b"abc".to_vec(), true)), format!("abc{TRUNCATED_SUFFIX}"));
    }
}
