//! # Stage: Static Validator
//!
//! ## Responsibility
//! Runs each file type's own syntax-only check against the **workspace** copy
//! of every tracked file.  External checkers (e.g. `python3 -m py_compile`)
//! run with a per-file timeout; JSON and TOML are parsed in-process.
//!
//! ## Guarantees
//! - Never reads or writes the live tree.
//! - Files absent from the workspace, or with no registered checker, are skipped.
//! - `all_passed` is the AND over every file actually checked.
//! - A checker that cannot be launched or times out counts as a failure.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{CheckerSpec, SyntaxConfig, FILE_PLACEHOLDER};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Result of checking one file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCheck {
    pub file: String,
    /// Checker label (program name, `json` or `toml`).
    pub checker: String,
    pub passed: bool,
    /// Captured compiler output or parse error; empty on success.
    pub detail: String,
    pub duration: Duration,
}

/// Aggregate of one syntax-check run.
#[derive(Debug, Clone, Default)]
pub struct SyntaxReport {
    pub checks: Vec<FileCheck>,
    pub all_passed: bool,
}

impl SyntaxReport {
    pub fn failed_files(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.file.clone())
            .collect()
    }

    /// Text recorded in the session's `TestResult`.
    pub fn summary(&self) -> String {
        if self.all_passed {
            return format!("syntax check passed ({} file(s) checked)", self.checks.len());
        }
        let mut lines = vec![format!(
            "syntax check failed for {}",
            self.failed_files().join(", ")
        )];
        for c in self.checks.iter().filter(|c| !c.passed) {
            lines.push(format!("  {} [{}]: {}", c.file, c.checker, c.detail.trim()));
        }
        lines.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Checking
// ---------------------------------------------------------------------------

/// Check every file of `files` present in `workspace` that has a checker.
pub async fn run_syntax_check(workspace: &Path, files: &[String], cfg: &SyntaxConfig) -> SyntaxReport {
    let mut checks = Vec::new();
    for file in files {
        let path = workspace.join(file);
        if !path.is_file() {
            debug!(file = %file, "not in workspace; skipped");
            continue;
        }
        let Some(spec) = cfg.checker_for(file) else {
            debug!(file = %file, "no syntax checker registered; skipped");
            continue;
        };
        let check = check_file(&path, file, spec, cfg.timeout()).await;
        if check.passed {
            debug!(file = %file, checker = %check.checker, "syntax ok");
        } else {
            warn!(file = %file, checker = %check.checker, detail = %check.detail, "syntax error");
        }
        checks.push(check);
    }
    let all_passed = checks.iter().all(|c| c.passed);
    SyntaxReport { checks, all_passed }
}

/// Check a single file at `path` (reported as `file`).
pub async fn check_file(path: &Path, file: &str, spec: &CheckerSpec, timeout: Duration) -> FileCheck {
    let start = Instant::now();
    let outcome = match spec {
        CheckerSpec::Json { .. } => parse_in_process(path, |text| {
            serde_json::from_str::<serde_json::Value>(text)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }),
        CheckerSpec::Toml { .. } => parse_in_process(path, |text| {
            toml::from_str::<toml::Table>(text)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }),
        CheckerSpec::Command { program, args, .. } => {
            run_checker(path, program, args, timeout).await
        }
    };
    let (passed, detail) = match outcome {
        Ok(()) => (true, String::new()),
        Err(detail) => (false, detail),
    };
    FileCheck {
        file: file.to_string(),
        checker: spec.label(),
        passed,
        detail,
        duration: start.elapsed(),
    }
}

fn parse_in_process(
    path: &Path,
    parse: impl Fn(&str) -> Result<(), String>,
) -> Result<(), String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read file: {e}"))?;
    parse(&text)
}

async fn run_checker(
    path: &Path,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<(), String> {
    let file_arg = path.display().to_string();
    let args: Vec<String> = args.iter().map(|a| a.replace(FILE_PLACEHOLDER, &file_arg)).collect();
    let mut cmd = Command::new(program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = path.parent() {
        cmd.current_dir(dir);
    }

    match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => Err(format!("checker timed out after {}ms", timeout.as_millis())),
        Ok(Err(e)) => Err(format!("cannot run {program}: {e}")),
        Ok(Ok(out)) if out.status.success() => Ok(()),
        Ok(Ok(out)) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stdout = String::from_utf8_lossy(&out.stdout);
            let text = if stderr.trim().is_empty() { stdout } else { stderr };
            Err(format!("{} ({})", text.trim(), out.status))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn json_and_sh() -> SyntaxConfig {
        SyntaxConfig {
            timeout_ms: 5_000,
            checkers: vec![
                CheckerSpec::Json { extension: "json".into() },
                CheckerSpec::Toml { extension: "toml".into() },
                CheckerSpec::Command {
                    extension: "sh".into(),
                    program: "sh".into(),
                    args: vec!["-n".into(), FILE_PLACEHOLDER.into()],
                },
            ],
        }
    }

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_valid_files_pass() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"{"ok": true}"#).unwrap();
        std::fs::write(dir.path().join("b.toml"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("c.sh"), "echo hi\n").unwrap();
        let report =
            run_syntax_check(dir.path(), &files(&["a.json", "b.toml", "c.sh"]), &json_and_sh()).await;
        assert!(report.all_passed, "{}", report.summary());
        assert_eq!(report.checks.len(), 3);
        assert!(report.summary().starts_with("syntax check passed"));
    }

    #[tokio::test]
    async fn test_broken_json_fails_and_is_named() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("service.json"), r#"{"a": [1, 2"#).unwrap();
        let report = run_syntax_check(dir.path(), &files(&["service.json"]), &json_and_sh()).await;
        assert!(!report.all_passed);
        assert_eq!(report.failed_files(), vec!["service.json".to_string()]);
        assert!(report.summary().starts_with("syntax check failed for service.json"));
    }

    #[tokio::test]
    async fn test_broken_shell_fails_with_captured_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.sh"), "if then fi (\n").unwrap();
        let report = run_syntax_check(dir.path(), &files(&["run.sh"]), &json_and_sh()).await;
        assert!(!report.all_passed);
        let check = &report.checks[0];
        assert_eq!(check.checker, "sh");
        assert!(!check.detail.is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_fails_the_whole_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.json"), "[]").unwrap();
        std::fs::write(dir.path().join("bad.toml"), "x = = 1").unwrap();
        let report =
            run_syntax_check(dir.path(), &files(&["good.json", "bad.toml"]), &json_and_sh()).await;
        assert!(!report.all_passed);
        assert_eq!(report.failed_files(), vec!["bad.toml".to_string()]);
    }

    #[tokio::test]
    async fn test_absent_and_unchecked_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# (unbalanced").unwrap();
        let report =
            run_syntax_check(dir.path(), &files(&["README.md", "ghost.json"]), &json_and_sh()).await;
        assert!(report.all_passed);
        assert!(report.checks.is_empty());
    }

    #[tokio::test]
    async fn test_missing_checker_program_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.zz"), "anything").unwrap();
        let cfg = SyntaxConfig {
            timeout_ms: 1_000,
            checkers: vec![CheckerSpec::Command {
                extension: "zz".into(),
                program: "definitely-not-a-real-checker-binary".into(),
                args: vec![FILE_PLACEHOLDER.into()],
            }],
        };
        let report = run_syntax_check(dir.path(), &files(&["x.zz"]), &cfg).await;
        assert!(!report.all_passed);
        assert!(report.checks[0].detail.starts_with("cannot run"));
    }

    #[tokio::test]
    async fn test_slow_checker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.slow"), "").unwrap();
        let cfg = SyntaxConfig {
            timeout_ms: 200,
            checkers: vec![CheckerSpec::Command {
                extension: "slow".into(),
                program: "sleep".into(),
                args: vec!["5".into()],
            }],
        };
        let report = run_syntax_check(dir.path(), &files(&["x.slow"]), &cfg).await;
        assert!(!report.all_passed);
        assert!(report.checks[0].detail.contains("timed out"));
    }
}
