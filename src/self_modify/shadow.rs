//! # Stage: Shadow Runtime Harness
//!
//! ## Responsibility
//! Boots a second, disposable instance of the service rooted at the workspace,
//! on a free loopback port, and proves it works:
//!
//! 1. allocate an ephemeral port (bind to 0, read it back, release it)
//! 2. spawn the service as a child process in its own process group, with its
//!    working directory and module search path pointed at the workspace
//! 3. wait out the warm-up; a child that already exited is a startup crash and
//!    no network call is made
//! 4. `GET <health_path>` with a bounded timeout
//! 5. `POST <task_path>` with the smoke task; the reply must be JSON carrying
//!    a `result` field
//! 6. tear the process down: SIGTERM to the group, then SIGKILL after the grace
//!    period
//!
//! ## Guarantees
//! - Teardown runs on every path.  The normal path awaits
//!   [`ShadowProcess::shutdown`]; if the future is dropped (caller timeout) or
//!   panics, `Drop` kills the group and `kill_on_drop` kills the leader.
//! - Every wait is bounded: warm-up, probe, task, grace.
//! - Failures are structured ([`ShadowFailure`]), never collapsed into one error.
//!
//! ## NOT Responsible For
//! - Closing the port race: another process may take the port between release
//!   and the shadow's bind.  That shows up as a startup crash or probe failure.
//! - Copying runtime config into the workspace (the session does that first).

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ShadowConfig;
use crate::self_modify::record::truncate_detail;

/// Bytes of stdout/stderr retained per stream (the tail is kept).
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;
/// Delay between health attempts while the shadow refuses connections.
const PROBE_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for the output readers after the process is gone.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// ShadowFailure
// ---------------------------------------------------------------------------

/// Why a shadow run failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowFailure {
    /// No port could be allocated or the process could not be started.
    Spawn { detail: String },
    /// The process exited before it answered the liveness probe.
    StartupCrash { status: String, stderr: String },
    /// Health endpoint unreachable, timed out, or returned non-2xx.
    ProbeFailure { detail: String },
    /// The smoke task errored, timed out, or returned a malformed body.
    TaskFailure { detail: String },
}

impl ShadowFailure {
    /// Stable short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ShadowFailure::Spawn { .. } => "spawn",
            ShadowFailure::StartupCrash { .. } => "startup_crash",
            ShadowFailure::ProbeFailure { .. } => "probe_failure",
            ShadowFailure::TaskFailure { .. } => "task_failure",
        }
    }
}

impl std::fmt::Display for ShadowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShadowFailure::Spawn { detail } => write!(f, "could not start shadow: {detail}"),
            ShadowFailure::StartupCrash { status, stderr } if stderr.is_empty() => {
                write!(f, "shadow crashed at startup ({status})")
            }
            ShadowFailure::StartupCrash { status, stderr } => {
                write!(f, "shadow crashed at startup ({status}): {stderr}")
            }
            ShadowFailure::ProbeFailure { detail } => write!(f, "health check failed: {detail}"),
            ShadowFailure::TaskFailure { detail } => write!(f, "smoke task failed: {detail}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Teardown / report
// ---------------------------------------------------------------------------

/// How the shadow process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    /// It had already exited on its own.
    AlreadyExited { status: String },
    /// It exited within the grace period after SIGTERM.
    Terminated,
    /// It ignored SIGTERM and was killed.
    Killed,
}

/// Everything one shadow run produced.
#[derive(Debug, Clone)]
pub struct ShadowReport {
    pub port: Option<u16>,
    pub pid: Option<u32>,
    /// `Ok` carries a snippet of the task's `result`.
    pub outcome: Result<String, ShadowFailure>,
    pub teardown: Option<Teardown>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration: Duration,
}

impl ShadowReport {
    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failure(&self) -> Option<&ShadowFailure> {
        self.outcome.as_ref().err()
    }

    /// Text recorded in the session's `TestResult`.
    pub fn summary(&self) -> String {
        let port = self.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        match &self.outcome {
            Ok(snippet) => format!("shadow test passed on port {port}; result: {snippet}"),
            Err(f) => format!("shadow test failed on port {port}: {f}"),
        }
    }

    fn spawn_failed(port: Option<u16>, detail: String, started: Instant) -> Self {
        Self {
            port,
            pid: None,
            outcome: Err(ShadowFailure::Spawn { detail }),
            teardown: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            duration: started.elapsed(),
        }
    }
}

// ---------------------------------------------------------------------------
// Port allocation
// ---------------------------------------------------------------------------

/// Bind loopback port 0, read back the assigned port, release the socket.
///
/// The port is free at the moment of return only; see the module docs.
pub fn allocate_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

// ---------------------------------------------------------------------------
// ShadowProcess
// ---------------------------------------------------------------------------

/// Owned handle on a running shadow instance.
///
/// Dropping it without calling [`shutdown`](Self::shutdown) kills the process
/// group immediately.
pub struct ShadowProcess {
    child: Option<Child>,
    pid: Option<u32>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

/// Captured output tails after teardown.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ShadowProcess {
    /// Launch `cfg.program` rooted at `workspace`, listening on `port`.
    pub fn spawn(cfg: &ShadowConfig, workspace: &Path, port: u16) -> std::io::Result<Self> {
        let mut cmd = Command::new(&cfg.program);
        cmd.args(cfg.render_args(port, workspace))
            .current_dir(workspace)
            .envs(&cfg.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(var) = &cfg.module_path_var {
            cmd.env(var, workspace);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take().map(|r| tokio::spawn(read_tail(r)));
        let stderr = child.stderr.take().map(|r| tokio::spawn(read_tail(r)));
        Ok(Self { child: Some(child), pid, stdout, stderr })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait up to `limit` for the process to exit.  `None` means still running.
    pub async fn exited_within(&mut self, limit: Duration) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(error = %e, "shadow: wait failed");
                None
            }
            Err(_) => None,
        }
    }

    /// Non-blocking exit check.
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        self.child.as_mut()?.try_wait().ok().flatten()
    }

    /// SIGTERM the group, wait `grace`, then SIGKILL.  Always reaps the child.
    pub async fn shutdown(mut self, grace: Duration) -> (Teardown, CapturedOutput) {
        let teardown = match self.child.take() {
            None => Teardown::AlreadyExited { status: "not running".into() },
            Some(mut child) => {
                let teardown = match child.try_wait() {
                    Ok(Some(status)) => Teardown::AlreadyExited { status: status.to_string() },
                    _ => {
                        signal_group(self.pid, GroupSignal::Terminate);
                        #[cfg(not(unix))]
                        let _ = child.start_kill();
                        match tokio::time::timeout(grace, child.wait()).await {
                            Ok(_) => Teardown::Terminated,
                            Err(_) => {
                                warn!(pid = ?self.pid, grace_ms = grace.as_millis() as u64, "shadow ignored SIGTERM; killing");
                                signal_group(self.pid, GroupSignal::Kill);
                                let _ = child.kill().await;
                                Teardown::Killed
                            }
                        }
                    }
                };
                // Descendants may outlive the leader; the group goes either way.
                signal_group(self.pid, GroupSignal::Kill);
                teardown
            }
        };

        let output = CapturedOutput {
            stdout: drain(self.stdout.take()).await,
            stderr: drain(self.stderr.take()).await,
        };
        debug!(pid = ?self.pid, teardown = ?teardown, "shadow torn down");
        (teardown, output)
    }
}

impl Drop for ShadowProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            signal_group(self.pid, GroupSignal::Kill);
            let _ = child.start_kill();
        }
        if let Some(h) = self.stdout.take() {
            h.abort();
        }
        if let Some(h) = self.stderr.take() {
            h.abort();
        }
    }
}

enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, sig: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let sig = match sig {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    // ESRCH just means the group is already gone.
    let _ = killpg(Pid::from_raw(pid), sig);
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _sig: GroupSignal) {}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > OUTPUT_TAIL_BYTES {
                    let excess = tail.len() - OUTPUT_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    tail
}

async fn drain(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

// ---------------------------------------------------------------------------
// The harness
// ---------------------------------------------------------------------------

/// Run the full shadow test against `workspace`.
pub async fn run_shadow_test(workspace: &Path, cfg: &ShadowConfig) -> ShadowReport {
    let started = Instant::now();

    let port = match allocate_port() {
        Ok(p) => p,
        Err(e) => return ShadowReport::spawn_failed(None, format!("port allocation: {e}"), started),
    };

    let mut process = match ShadowProcess::spawn(cfg, workspace, port) {
        Ok(p) => p,
        Err(e) => {
            warn!(program = %cfg.program, error = %e, "shadow: spawn failed");
            return ShadowReport::spawn_failed(
                Some(port),
                format!("{}: {e}", cfg.program),
                started,
            );
        }
    };
    let pid = process.pid();
    info!(port, pid = ?pid, workspace = %workspace.display(), "shadow: spawned");

    let mut outcome = exercise(&mut process, cfg, port).await;
    let (teardown, output) = process.shutdown(cfg.grace()).await;

    if let Err(ShadowFailure::StartupCrash { stderr, .. }) = &mut outcome {
        *stderr = truncate_detail(&output.stderr, cfg.detail_limit);
    }
    match &outcome {
        Ok(_) => info!(port, pid = ?pid, "shadow: passed"),
        Err(f) => warn!(port, pid = ?pid, kind = f.kind(), failure = %f, "shadow: failed"),
    }

    ShadowReport {
        port: Some(port),
        pid,
        outcome,
        teardown: Some(teardown),
        stdout_tail: truncate_detail(&output.stdout, cfg.detail_limit),
        stderr_tail: truncate_detail(&output.stderr, cfg.detail_limit),
        duration: started.elapsed(),
    }
}

async fn exercise(
    process: &mut ShadowProcess,
    cfg: &ShadowConfig,
    port: u16,
) -> Result<String, ShadowFailure> {
    if let Some(status) = process.exited_within(cfg.warmup()).await {
        return Err(ShadowFailure::StartupCrash { status: status.to_string(), stderr: String::new() });
    }

    // Loopback only; environment proxies must not intercept it.
    let client = reqwest::Client::builder()
        .no_proxy()
        .build()
        .map_err(|e| ShadowFailure::Spawn { detail: format!("http client: {e}") })?;
    let base = format!("http://127.0.0.1:{port}");

    probe_health(process, &client, &format!("{base}{}", cfg.health_path), cfg.health_timeout()).await?;
    debug!(port, "shadow: health ok");
    run_task(&client, &format!("{base}{}", cfg.task_path), cfg).await
}

async fn probe_health(
    process: &mut ShadowProcess,
    client: &reqwest::Client,
    url: &str,
    budget: Duration,
) -> Result<(), ShadowFailure> {
    let deadline = Instant::now() + budget;
    loop {
        if let Some(status) = process.try_exited() {
            return Err(ShadowFailure::StartupCrash {
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ShadowFailure::ProbeFailure {
                detail: format!("no answer from {url} within {}ms", budget.as_millis()),
            });
        }
        match client.get(url).timeout(remaining).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => {
                return Err(ShadowFailure::ProbeFailure {
                    detail: format!("{url} returned {}", resp.status()),
                })
            }
            // Listener not bound yet: retry inside the same budget.
            Err(e) if e.is_connect() => {
                tokio::time::sleep(PROBE_RETRY_INTERVAL.min(remaining)).await;
            }
            Err(e) if e.is_timeout() => {
                return Err(ShadowFailure::ProbeFailure {
                    detail: format!("{url} timed out after {}ms", budget.as_millis()),
                })
            }
            Err(e) => return Err(ShadowFailure::ProbeFailure { detail: e.to_string() }),
        }
    }
}

async fn run_task(
    client: &reqwest::Client,
    url: &str,
    cfg: &ShadowConfig,
) -> Result<String, ShadowFailure> {
    let fail = |detail: String| ShadowFailure::TaskFailure { detail };
    let resp = client
        .post(url)
        .json(&cfg.task_body)
        .timeout(cfg.task_timeout())
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                fail(format!("{url} timed out after {}ms", cfg.task_timeout_ms))
            } else {
                fail(e.to_string())
            }
        })?;

    let status = resp.status();
    let body = resp.text().await.map_err(|e| fail(format!("reading body: {e}")))?;
    let snippet = truncate_detail(&body, cfg.detail_limit);
    if !status.is_success() {
        return Err(fail(format!("{url} returned {status}: {snippet}")));
    }

    let value: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| fail(format!("malformed response body ({e}): {snippet}")))?;
    match value.get("result") {
        Some(serde_json::Value::String(s)) => Ok(truncate_detail(s, cfg.detail_limit)),
        Some(other) => Ok(truncate_detail(&other.to_string(), cfg.detail_limit)),
        None => Err(fail(format!("response has no `result` field: {snippet}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ShadowConfig {
        ShadowConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            module_path_var: None,
            warmup_ms: 300,
            health_timeout_ms: 500,
            task_timeout_ms: 500,
            grace_ms: 500,
            ..ShadowConfig::default()
        }
    }

    #[test]
    fn test_allocate_port_returns_nonzero_bindable_port() {
        let port = allocate_port().unwrap();
        assert_ne!(port, 0);
        // Released: binding it again succeeds (barring the documented race).
        let again = std::net::TcpListener::bind(("127.0.0.1", port));
        assert!(again.is_ok());
    }

    #[test]
    fn test_failure_display_variants() {
        let crash = ShadowFailure::StartupCrash { status: "exit status: 1".into(), stderr: String::new() };
        assert_eq!(crash.to_string(), "shadow crashed at startup (exit status: 1)");
        let crash = ShadowFailure::StartupCrash { status: "exit status: 1".into(), stderr: "boom".into() };
        assert!(crash.to_string().ends_with(": boom"));
        assert!(ShadowFailure::ProbeFailure { detail: "x".into() }
            .to_string()
            .starts_with("health check failed"));
        assert_eq!(ShadowFailure::TaskFailure { detail: "x".into() }.kind(), "task_failure");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ShadowConfig {
            program: "definitely-not-a-real-service-binary".into(),
            ..sh("")
        };
        let report = run_shadow_test(dir.path(), &cfg).await;
        assert!(!report.passed());
        assert!(matches!(report.failure(), Some(ShadowFailure::Spawn { .. })));
        assert!(report.pid.is_none());
    }

    #[tokio::test]
    async fn test_startup_crash_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_shadow_test(dir.path(), &sh("echo 'ImportError: no module' >&2; exit 3")).await;
        match report.failure() {
            Some(ShadowFailure::StartupCrash { stderr, .. }) => {
                assert!(stderr.contains("ImportError"), "stderr: {stderr}")
            }
            other => panic!("expected startup crash, got {other:?}"),
        }
        assert!(matches!(report.teardown, Some(Teardown::AlreadyExited { .. })));
        assert!(report.summary().contains("crashed at startup"));
    }

    #[tokio::test]
    async fn test_silent_process_fails_probe_and_is_terminated() {
        let dir = tempfile::tempdir().unwrap();
        // Stays alive but never listens.
        let report = run_shadow_test(dir.path(), &sh("sleep 30")).await;
        assert!(matches!(report.failure(), Some(ShadowFailure::ProbeFailure { .. })));
        assert_eq!(report.teardown, Some(Teardown::Terminated));
    }

    #[tokio::test]
    async fn test_sigterm_ignoring_process_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_shadow_test(dir.path(), &sh("trap '' TERM; while true; do sleep 0.1; done")).await;
        assert!(!report.passed());
        assert_eq!(report.teardown, Some(Teardown::Killed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_run_still_kills_shadow() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let dir = tempfile::tempdir().unwrap();
        let cfg = ShadowConfig { warmup_ms: 5_000, ..sh("echo $$ > shadow.pid; exec sleep 30") };
        let run = run_shadow_test(dir.path(), &cfg);
        assert!(tokio::time::timeout(Duration::from_millis(500), run).await.is_err());

        let pid: i32 = std::fs::read_to_string(dir.path().join("shadow.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // Reaping happens on the runtime's SIGCHLD handling; give it a moment.
        let mut gone = false;
        for _ in 0..40 {
            if kill(Pid::from_raw(pid), None).is_err() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "pid {pid} still alive after the caller's timeout fired");
    }

    #[tokio::test]
    async fn test_workspace_is_working_directory_and_module_path() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ShadowConfig {
            module_path_var: Some("SHADOW_MODULE_PATH".into()),
            ..sh("pwd; echo \"mp=$SHADOW_MODULE_PATH\"; exit 1")
        };
        let report = run_shadow_test(dir.path(), &cfg).await;
        let ws = dir.path().canonicalize().unwrap();
        let name = ws.file_name().unwrap().to_string_lossy().to_string();
        assert!(report.stdout_tail.contains(&name), "stdout: {}", report.stdout_tail);
        assert!(report.stdout_tail.contains("mp="), "stdout: {}", report.stdout_tail);
    }
}
