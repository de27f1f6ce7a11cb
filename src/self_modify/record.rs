//! Audit-trail records and the session state enum.
//!
//! Records are append-only: once pushed onto a session they are never edited.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Lifecycle position of a modification session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Started,
    Modified,
    Validated,
    Applied,
    RolledBack,
    Ended,
    Failed,
}

impl SessionState {
    /// States in which the workspace may still be edited.
    pub fn accepts_edits(self) -> bool {
        matches!(self, SessionState::Started | SessionState::Modified)
    }

    /// States in which checks may run against the workspace.
    pub fn accepts_checks(self) -> bool {
        matches!(
            self,
            SessionState::Started | SessionState::Modified | SessionState::Validated
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Started => "started",
            SessionState::Modified => "modified",
            SessionState::Validated => "validated",
            SessionState::Applied => "applied",
            SessionState::RolledBack => "rolled_back",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// FileModification
// ---------------------------------------------------------------------------

/// One successful write to a workspace file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileModification {
    /// Path relative to the tracked root.
    pub filename: String,
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// TestResult
// ---------------------------------------------------------------------------

/// Which check produced a [`TestResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    SyntaxCheck,
    ShadowTest,
    CustomTest,
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestKind::SyntaxCheck => write!(f, "syntax_check"),
            TestKind::ShadowTest => write!(f, "shadow_test"),
            TestKind::CustomTest => write!(f, "custom_test"),
        }
    }
}

/// Outcome of one check run against the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub kind: TestKind,
    pub passed: bool,
    pub timestamp_ms: u64,
    pub detail: String,
    /// Workspace revision (number of edits so far) the check ran against.
    #[serde(default)]
    pub revision: u64,
    /// Failing files or failure kinds, for precise refusal messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl TestResult {
    pub fn new(kind: TestKind, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            kind,
            passed,
            timestamp_ms: now_ms(),
            detail: detail.into(),
            revision: 0,
            failures: Vec::new(),
        }
    }

    pub fn at_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_failures(mut self, failures: Vec<String>) -> Self {
        self.failures = failures;
        self
    }
}

/// The most recent result of `kind`, if any.
pub fn latest_of(results: &[TestResult], kind: TestKind) -> Option<&TestResult> {
    results.iter().rev().find(|r| r.kind == kind)
}

/// Cut `s` to at most `limit` characters, marking the cut.
pub fn truncate_detail(s: &str, limit: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= limit {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(limit).collect();
        format!("{head}...")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_reasonable() {
        assert!(now_ms() > 1_700_000_000_000);
    }

    #[test]
    fn test_only_started_and_modified_accept_edits() {
        assert!(SessionState::Started.accepts_edits());
        assert!(SessionState::Modified.accepts_edits());
        assert!(!SessionState::Validated.accepts_edits());
        assert!(!SessionState::Applied.accepts_edits());
        assert!(!SessionState::Ended.accepts_edits());
    }

    #[test]
    fn test_validated_still_accepts_checks() {
        assert!(SessionState::Validated.accepts_checks());
        assert!(!SessionState::RolledBack.accepts_checks());
        assert!(!SessionState::Failed.accepts_checks());
    }

    #[test]
    fn test_state_display_is_snake_case() {
        assert_eq!(SessionState::RolledBack.to_string(), "rolled_back");
        assert_eq!(
            serde_json::to_string(&SessionState::RolledBack).unwrap(),
            "\"rolled_back\""
        );
    }

    #[test]
    fn test_latest_of_picks_most_recent_of_kind() {
        let results = vec![
            TestResult::new(TestKind::SyntaxCheck, false, "first"),
            TestResult::new(TestKind::ShadowTest, true, "shadow"),
            TestResult::new(TestKind::SyntaxCheck, true, "second"),
        ];
        assert_eq!(latest_of(&results, TestKind::SyntaxCheck).unwrap().detail, "second");
        assert_eq!(latest_of(&results, TestKind::ShadowTest).unwrap().detail, "shadow");
        assert!(latest_of(&results, TestKind::CustomTest).is_none());
    }

    #[test]
    fn test_truncate_detail_marks_cut() {
        assert_eq!(truncate_detail("  short  ", 10), "short");
        assert_eq!(truncate_detail("abcdefghij", 4), "abcd...");
    }

    #[test]
    fn test_truncate_detail_respects_char_boundaries() {
        let s = "响应响应响应";
        assert_eq!(truncate_detail(s, 2), "响应...");
    }
}
