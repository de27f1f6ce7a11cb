//! # Stage: Session Manager
//!
//! ## Responsibility
//! The handle the agent loop holds for one modification session.  It wires the
//! other stages together in order and owns the audit trail:
//!
//! ```text
//! start -> modify* -> run_syntax_check / run_shadow_test -> apply | rollback
//!       -> request_restart -> end
//! ```
//!
//! ## State machine
//! | operation            | allowed from                      | moves to            |
//! |----------------------|-----------------------------------|---------------------|
//! | `modify`             | Started, Modified                 | Modified            |
//! | checks               | Started, Modified, Validated      | Validated / Modified|
//! | `apply`              | Started, Modified, Validated      | Applied / Failed    |
//! | `rollback`           | any but Ended                     | RolledBack / Failed |
//! | `end`                | any but Ended                     | Ended               |
//!
//! A session is Validated once the gate would approve its current revision.
//!
//! ## Guarantees
//! - Only `apply` and `rollback` write to the live tree.
//! - `end` always keeps the backup and writes a manifest into it.
//! - The registry slot is freed on `end` or drop.

use std::path::Path;
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::{SandboxConfig, WORKSPACE_PLACEHOLDER};
use crate::error::{Result, SandboxError};
use crate::self_modify::apply::{apply_files, restore_from_backup, RollbackReport, MANIFEST_FILE};
use crate::self_modify::gate::{ApplyGate, GateDecision};
use crate::self_modify::record::{
    now_ms, truncate_detail, FileModification, SessionState, TestKind, TestResult,
};
use crate::self_modify::registry::{Lease, SessionRegistry};
use crate::self_modify::restart::{RestartRequest, RestartSignal};
use crate::self_modify::shadow::{run_shadow_test, ShadowReport};
use crate::self_modify::syntax::{run_syntax_check, SyntaxReport};
use crate::self_modify::workspace::{validate_relative, TrackedFiles, Workspace};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Snapshot returned by [`Session::status`] and written as the manifest.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub active: bool,
    pub state: SessionState,
    pub workspace_path: String,
    pub backup_path: String,
    pub modifications: Vec<FileModification>,
    pub test_results: Vec<TestResult>,
}

/// What a successful `apply` did.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub decision: GateDecision,
    /// Files written to the live tree, in order.
    pub applied: Vec<String>,
    /// Subset of `applied` that did not exist in the live tree before.
    pub created: Vec<String>,
    /// Always true after an apply; the caller raises it via `request_restart`.
    pub restart_required: bool,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One self-modification session.  Obtain through [`Session::start`] or
/// [`SessionRegistry::start`].
#[derive(Debug)]
pub struct Session {
    session_id: String,
    config: SandboxConfig,
    workspace: Workspace,
    gate: ApplyGate,
    restart: RestartSignal,
    modifications: Vec<FileModification>,
    test_results: Vec<TestResult>,
    state: SessionState,
    /// Live files that `apply` created; removed again by `rollback`.
    created: Vec<String>,
    lease: Option<Lease>,
}

impl Session {
    /// Start a session in the process-wide registry.
    pub fn start(config: SandboxConfig) -> Result<Self> {
        SessionRegistry::global().start(config)
    }

    pub(crate) fn open(config: SandboxConfig, session_id: String, lease: Lease) -> Result<Self> {
        config.validate()?;
        let tracked = TrackedFiles::from_config(&config)?;
        let workspace = Workspace::create(
            &session_id,
            &config.live_root,
            &config.scratch_root(),
            &config.backup_root(),
            tracked,
        )?;
        info!(
            session_id = %session_id,
            live_root = %config.live_root.display(),
            core = workspace.tracked().core.len(),
            "session started"
        );
        Ok(Self {
            gate: ApplyGate::new(config.gate.clone()),
            restart: RestartSignal::new(config.restart_flag()),
            session_id,
            config,
            workspace,
            modifications: Vec::new(),
            test_results: Vec::new(),
            state: SessionState::Started,
            created: Vec::new(),
            lease: Some(lease),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn modifications(&self) -> &[FileModification] {
        &self.modifications
    }

    pub fn test_results(&self) -> &[TestResult] {
        &self.test_results
    }

    pub fn workspace_path(&self) -> &Path {
        self.workspace.workspace_path()
    }

    pub fn backup_path(&self) -> &Path {
        self.workspace.backup_path()
    }

    pub fn live_root(&self) -> &Path {
        self.workspace.live_root()
    }

    pub fn restart_signal(&self) -> &RestartSignal {
        &self.restart
    }

    /// Number of edits so far.  Test results are tagged with it.
    pub fn revision(&self) -> u64 {
        self.modifications.len() as u64
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            active: !matches!(self.state, SessionState::Ended | SessionState::Uninitialized),
            state: self.state,
            workspace_path: self.workspace.workspace_path().display().to_string(),
            backup_path: self.workspace.backup_path().display().to_string(),
            modifications: self.modifications.clone(),
            test_results: self.test_results.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Editing
    // -----------------------------------------------------------------------

    /// Write `content` to the workspace copy of `filename`.  No validation.
    pub fn modify(&mut self, filename: &str, content: &str) -> Result<()> {
        self.require("modify", SessionState::accepts_edits)?;
        let name = normalise(filename)?;
        if self.workspace.back_up_untracked(&name)? {
            info!(session_id = %self.session_id, file = %name, "untracked live file backed up before first edit");
        }
        self.workspace.write_file(&name, content)?;
        self.modifications.push(FileModification { filename: name.clone(), timestamp_ms: now_ms() });
        self.state = SessionState::Modified;
        info!(
            session_id = %self.session_id,
            file = %name,
            bytes = content.len(),
            revision = self.revision(),
            "workspace file modified"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checks
    // -----------------------------------------------------------------------

    /// Syntax-check every core file plus every file created by `modify`.
    pub async fn run_syntax_check(&mut self) -> Result<SyntaxReport> {
        self.require("run_syntax_check", SessionState::accepts_checks)?;
        let files = self.files_to_check();
        let report =
            run_syntax_check(self.workspace.workspace_path(), &files, &self.config.syntax).await;
        let result = TestResult::new(TestKind::SyntaxCheck, report.all_passed, report.summary())
            .at_revision(self.revision())
            .with_failures(report.failed_files());
        self.record(result);
        Ok(report)
    }

    /// Boot a shadow instance from the workspace and exercise it.
    pub async fn run_shadow_test(&mut self) -> Result<ShadowReport> {
        self.require("run_shadow_test", SessionState::accepts_checks)?;
        let copied = self.workspace.copy_runtime_config(&self.config.runtime_config_files)?;
        if copied > 0 {
            info!(session_id = %self.session_id, files = copied, "runtime config copied into workspace");
        }
        let report = run_shadow_test(self.workspace.workspace_path(), &self.config.shadow).await;
        let failures = report.failure().map(|f| vec![f.kind().to_string()]).unwrap_or_default();
        let result = TestResult::new(TestKind::ShadowTest, report.passed(), report.summary())
            .at_revision(self.revision())
            .with_failures(failures);
        self.record(result);
        Ok(report)
    }

    /// Run `program args..` with the workspace as working directory.
    ///
    /// `{workspace}` in `args` is substituted.  Bounded by the smoke-task
    /// timeout.  Exit status 0 passes.
    pub async fn run_custom_test(&mut self, name: &str, program: &str, args: &[String]) -> Result<TestResult> {
        self.require("run_custom_test", SessionState::accepts_checks)?;
        let ws = self.workspace.workspace_path();
        let ws_arg = ws.display().to_string();
        let args: Vec<String> = args.iter().map(|a| a.replace(WORKSPACE_PLACEHOLDER, &ws_arg)).collect();
        let limit = self.config.shadow.detail_limit;
        let timeout = self.config.shadow.task_timeout();

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .current_dir(ws)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(var) = &self.config.shadow.module_path_var {
            cmd.env(var, ws);
        }

        let (passed, detail) = match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => (false, format!("custom test '{name}' timed out after {}ms", timeout.as_millis())),
            Ok(Err(e)) => (false, format!("custom test '{name}' could not run {program}: {e}")),
            Ok(Ok(out)) if out.status.success() => (true, format!("custom test '{name}' passed")),
            Ok(Ok(out)) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let stdout = String::from_utf8_lossy(&out.stdout);
                let text = if stderr.trim().is_empty() { stdout } else { stderr };
                (
                    false,
                    format!("custom test '{name}' failed ({}): {}", out.status, truncate_detail(&text, limit)),
                )
            }
        };
        let failures = if passed { Vec::new() } else { vec![name.to_string()] };
        let result = TestResult::new(TestKind::CustomTest, passed, detail)
            .at_revision(self.revision())
            .with_failures(failures);
        self.record(result.clone());
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Live tree
    // -----------------------------------------------------------------------

    /// Copy every modified file onto the live tree if the gate allows it.
    ///
    /// `force` bypasses failed or missing checks but never the
    /// "no modifications" refusal.
    pub fn apply(&mut self, force: bool) -> Result<ApplyReport> {
        self.require("apply", SessionState::accepts_checks)?;

        let decision = self.gate.evaluate(self.revision(), &self.test_results, force);
        match &decision {
            GateDecision::Refused(reason) => {
                warn!(session_id = %self.session_id, reason = %reason, "apply refused");
                return Err(SandboxError::ApplyRefused(reason.clone()));
            }
            GateDecision::Forced { bypassed } => {
                let bypassed: Vec<String> = bypassed.iter().map(|r| r.to_string()).collect();
                warn!(
                    session_id = %self.session_id,
                    bypassed = %bypassed.join("; "),
                    "FORCED apply: safety gates overridden"
                );
            }
            GateDecision::Approved => {}
        }

        let files = self.modified_files();
        let live_root = self.workspace.live_root();
        let new_files: Vec<String> = files
            .iter()
            .filter(|f| !self.workspace.in_snapshot(f) && !live_root.join(f).exists())
            .cloned()
            .collect();

        match apply_files(self.workspace.workspace_path(), live_root, &files) {
            Ok(applied) => {
                self.created.extend(new_files.iter().cloned());
                self.state = SessionState::Applied;
                info!(
                    session_id = %self.session_id,
                    files = applied.len(),
                    created = new_files.len(),
                    decision = %decision,
                    "applied to live tree; restart required"
                );
                Ok(ApplyReport { decision, applied, created: new_files, restart_required: true })
            }
            Err(e) => {
                if let SandboxError::ApplyPartialFailure { applied, .. } = &e {
                    self.created.extend(new_files.into_iter().filter(|f| applied.contains(f)));
                }
                self.state = SessionState::Failed;
                error!(session_id = %self.session_id, error = %e, "apply failed; rollback required");
                Err(e)
            }
        }
    }

    /// Restore the live tree from the backup.  Safe to call repeatedly.
    pub fn rollback(&mut self) -> Result<RollbackReport> {
        self.require("rollback", |s| !s.is_terminal())?;
        match restore_from_backup(self.workspace.backup_path(), self.workspace.live_root(), &self.created) {
            Ok(report) => {
                self.state = SessionState::RolledBack;
                warn!(
                    session_id = %self.session_id,
                    restored = report.restored.len(),
                    removed = report.removed.len(),
                    "live tree rolled back"
                );
                Ok(report)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                error!(session_id = %self.session_id, error = %e, "rollback failed; operator action required");
                Err(e)
            }
        }
    }

    /// Raise the restart sentinel for the external supervisor.
    pub fn request_restart(&self) -> Result<RestartRequest> {
        self.restart.request(&self.session_id)
    }

    /// Finish the session.  The backup is always kept; the workspace is
    /// deleted when `cleanup` is true.
    pub fn end(&mut self, cleanup: bool) -> Result<SessionStatus> {
        self.require("end", |s| !s.is_terminal())?;
        self.state = SessionState::Ended;
        self.lease.take();

        let status = self.status();
        let manifest = self.write_manifest(&status);
        let removed = if cleanup { self.workspace.remove_workspace() } else { Ok(()) };
        info!(
            session_id = %self.session_id,
            cleanup,
            backup = %self.workspace.backup_path().display(),
            "session ended"
        );
        manifest?;
        removed?;
        Ok(status)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn require(&self, operation: &'static str, allowed: impl Fn(SessionState) -> bool) -> Result<()> {
        if allowed(self.state) {
            Ok(())
        } else {
            Err(SandboxError::SessionNotActive { operation, state: self.state })
        }
    }

    /// Append a result and move between Modified and Validated.
    fn record(&mut self, result: TestResult) {
        info!(
            session_id = %self.session_id,
            kind = %result.kind,
            passed = result.passed,
            revision = result.revision,
            "check recorded"
        );
        self.test_results.push(result);
        if self.revision() == 0 {
            return;
        }
        let approved = self.gate.evaluate(self.revision(), &self.test_results, false) == GateDecision::Approved;
        self.state = if approved { SessionState::Validated } else { SessionState::Modified };
    }

    /// Unique modified files, in order of first edit.
    fn modified_files(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for m in &self.modifications {
            if !out.contains(&m.filename) {
                out.push(m.filename.clone());
            }
        }
        out
    }

    fn files_to_check(&self) -> Vec<String> {
        let mut files = self.workspace.tracked().core.clone();
        for f in self.modified_files() {
            if !files.contains(&f) {
                files.push(f);
            }
        }
        files
    }

    fn write_manifest(&self, status: &SessionStatus) -> Result<()> {
        let path = self.workspace.backup_path().join(MANIFEST_FILE);
        let body = serde_json::to_vec_pretty(status)
            .map_err(|e| SandboxError::workspace(&path, std::io::Error::other(e)))?;
        std::fs::write(&path, body).map_err(|e| SandboxError::workspace(&path, e))
    }
}

/// Canonical `/`-separated form of a caller-supplied relative name.
fn normalise(filename: &str) -> Result<String> {
    let rel = validate_relative(filename)?;
    let parts: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    Ok(parts.join("/"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
