//! # Stage: Apply Gate
//!
//! ## Responsibility
//! Decides whether the workspace may be copied onto the live tree.  Reads the
//! session's audit trail and checks, in order:
//! 1. at least one modification exists (required even with `force`)
//! 2. latest syntax check passed, and ran against the current revision
//! 3. latest shadow test passed, and ran against the current revision
//! 4. latest custom test, if any ran, passed
//!
//! Custom results carry no revision check.  A failed custom test keeps
//! refusing until the same kind of test is run again and passes, even after
//! the files it complained about were fixed.
//!
//! Each check can be disabled through [`GateConfig`].  `force` turns every
//! refusal except (1) into a [`GateDecision::Forced`] that lists what was
//! bypassed, so it can be logged apart from a clean pass.
//!
//! ## Guarantees
//! - Pure: no I/O, deterministic for a given trail.
//! - Specific: a refusal names the failing check and, for syntax, the files.

use crate::config::GateConfig;
use crate::self_modify::record::{latest_of, TestKind, TestResult};

// ---------------------------------------------------------------------------
// GateRefusal
// ---------------------------------------------------------------------------

/// Why `apply` would not proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRefusal {
    NoModifications,
    SyntaxNotRun,
    SyntaxStale,
    SyntaxFailed { files: Vec<String> },
    ShadowNotRun,
    ShadowStale,
    ShadowFailed { reason: String },
    CustomFailed { detail: String },
}

impl GateRefusal {
    /// Refusals that `force` cannot override.
    pub fn is_absolute(&self) -> bool {
        matches!(self, GateRefusal::NoModifications)
    }
}

impl std::fmt::Display for GateRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateRefusal::NoModifications => write!(f, "nothing to apply: no modifications recorded"),
            GateRefusal::SyntaxNotRun => write!(f, "syntax check has not been run"),
            GateRefusal::SyntaxStale => {
                write!(f, "syntax check is stale: workspace changed after it ran")
            }
            GateRefusal::SyntaxFailed { files } if files.is_empty() => {
                write!(f, "syntax check failed")
            }
            GateRefusal::SyntaxFailed { files } => {
                write!(f, "syntax check failed for {}", files.join(", "))
            }
            GateRefusal::ShadowNotRun => write!(f, "shadow test has not been run"),
            GateRefusal::ShadowStale => {
                write!(f, "shadow test is stale: workspace changed after it ran")
            }
            GateRefusal::ShadowFailed { reason } => write!(f, "shadow test failed: {reason}"),
            GateRefusal::CustomFailed { detail } => write!(f, "custom test failed: {detail}"),
        }
    }
}

// ---------------------------------------------------------------------------
// GateDecision
// ---------------------------------------------------------------------------

/// Outcome of evaluating the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Every enabled check passed.
    Approved,
    /// One or more checks did not pass but `force` overrode them.
    Forced { bypassed: Vec<GateRefusal> },
    /// Apply must not proceed.
    Refused(GateRefusal),
}

impl GateDecision {
    pub fn may_apply(&self) -> bool {
        !matches!(self, GateDecision::Refused(_))
    }
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateDecision::Approved => write!(f, "approved"),
            GateDecision::Forced { bypassed } if bypassed.is_empty() => {
                write!(f, "forced (all checks passed)")
            }
            GateDecision::Forced { bypassed } => {
                let reasons: Vec<String> = bypassed.iter().map(|r| r.to_string()).collect();
                write!(f, "forced past: {}", reasons.join("; "))
            }
            GateDecision::Refused(r) => write!(f, "refused: {r}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ApplyGate
// ---------------------------------------------------------------------------

/// Evaluates apply preconditions from a session's audit trail.
#[derive(Debug, Clone)]
pub struct ApplyGate {
    config: GateConfig,
}

impl ApplyGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Every refusal that currently applies, in check order.
    pub fn refusals(&self, revision: u64, results: &[TestResult]) -> Vec<GateRefusal> {
        let mut out = Vec::new();
        if revision == 0 {
            out.push(GateRefusal::NoModifications);
        }

        if self.config.require_syntax {
            match latest_of(results, TestKind::SyntaxCheck) {
                None => out.push(GateRefusal::SyntaxNotRun),
                Some(r) if !r.passed => {
                    out.push(GateRefusal::SyntaxFailed { files: r.failures.clone() })
                }
                Some(r) if r.revision < revision => out.push(GateRefusal::SyntaxStale),
                Some(_) => {}
            }
        }

        if self.config.require_shadow {
            match latest_of(results, TestKind::ShadowTest) {
                None => out.push(GateRefusal::ShadowNotRun),
                Some(r) if !r.passed => out.push(GateRefusal::ShadowFailed {
                    reason: r.detail.clone(),
                }),
                Some(r) if r.revision < revision => out.push(GateRefusal::ShadowStale),
                Some(_) => {}
            }
        }

        if let Some(r) = latest_of(results, TestKind::CustomTest) {
            if !r.passed {
                out.push(GateRefusal::CustomFailed { detail: r.detail.clone() });
            }
        }
        out
    }

    /// `revision` is the number of edits recorded so far.
    pub fn evaluate(&self, revision: u64, results: &[TestResult], force: bool) -> GateDecision {
        let mut refusals = self.refusals(revision, results);
        if let Some(pos) = refusals.iter().position(GateRefusal::is_absolute) {
            return GateDecision::Refused(refusals.swap_remove(pos));
        }
        if force {
            return GateDecision::Forced { bypassed: refusals };
        }
        match refusals.into_iter().next() {
            None => GateDecision::Approved,
            Some(first) => GateDecision::Refused(first),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ApplyGate {
        ApplyGate::new(GateConfig::default())
    }

    fn syntax(passed: bool, rev: u64) -> TestResult {
        let r = TestResult::new(TestKind::SyntaxCheck, passed, "syntax").at_revision(rev);
        if passed {
            r
        } else {
            r.with_failures(vec!["service.py".into()])
        }
    }

    fn shadow(passed: bool, rev: u64) -> TestResult {
        TestResult::new(TestKind::ShadowTest, passed, "shadow crashed at startup").at_revision(rev)
    }

    // -------------------------------------------------------------------
    // Approve
    // -------------------------------------------------------------------

    #[test]
    fn test_gate_all_current_and_passing_approves() {
        let results = vec![syntax(true, 2), shadow(true, 2)];
        assert_eq!(gate().evaluate(2, &results, false), GateDecision::Approved);
    }

    #[test]
    fn test_gate_latest_result_wins() {
        let results = vec![syntax(false, 1), shadow(true, 1), syntax(true, 1)];
        assert_eq!(gate().evaluate(1, &results, false), GateDecision::Approved);
    }

    // -------------------------------------------------------------------
    // Refuse
    // -------------------------------------------------------------------

    #[test]
    fn test_gate_no_modifications_refused_even_when_forced() {
        let results = vec![syntax(true, 0), shadow(true, 0)];
        assert_eq!(
            gate().evaluate(0, &results, true),
            GateDecision::Refused(GateRefusal::NoModifications)
        );
    }

    #[test]
    fn test_gate_syntax_failure_names_files() {
        let results = vec![syntax(false, 1), shadow(true, 1)];
        let decision = gate().evaluate(1, &results, false);
        assert_eq!(
            decision,
            GateDecision::Refused(GateRefusal::SyntaxFailed { files: vec!["service.py".into()] })
        );
        assert_eq!(decision.to_string(), "refused: syntax check failed for service.py");
    }

    #[test]
    fn test_gate_missing_checks_refused() {
        assert_eq!(
            gate().evaluate(1, &[], false),
            GateDecision::Refused(GateRefusal::SyntaxNotRun)
        );
        assert_eq!(
            gate().evaluate(1, &[syntax(true, 1)], false),
            GateDecision::Refused(GateRefusal::ShadowNotRun)
        );
    }

    #[test]
    fn test_gate_stale_results_refused() {
        let results = vec![syntax(true, 1), shadow(true, 1)];
        assert_eq!(
            gate().evaluate(2, &results, false),
            GateDecision::Refused(GateRefusal::SyntaxStale)
        );
    }

    #[test]
    fn test_gate_shadow_failure_carries_reason() {
        let results = vec![syntax(true, 1), shadow(false, 1)];
        match gate().evaluate(1, &results, false) {
            GateDecision::Refused(GateRefusal::ShadowFailed { reason }) => {
                assert!(reason.contains("crashed at startup"))
            }
            other => panic!("expected shadow refusal, got {other:?}"),
        }
    }

    #[test]
    fn test_gate_failed_custom_test_refused() {
        let results = vec![
            syntax(true, 1),
            shadow(true, 1),
            TestResult::new(TestKind::CustomTest, false, "pytest: 2 failed").at_revision(1),
        ];
        assert!(matches!(
            gate().evaluate(1, &results, false),
            GateDecision::Refused(GateRefusal::CustomFailed { .. })
        ));
    }

    #[test]
    fn test_gate_failed_custom_test_sticks_until_rerun_passes() {
        let failed = TestResult::new(TestKind::CustomTest, false, "pytest: 2 failed").at_revision(1);
        let mut results = vec![syntax(true, 1), shadow(true, 1), failed];
        // fresh syntax and shadow passes do not clear it
        results.push(syntax(true, 1));
        results.push(shadow(true, 1));
        assert!(matches!(
            gate().evaluate(1, &results, false),
            GateDecision::Refused(GateRefusal::CustomFailed { .. })
        ));

        results.push(TestResult::new(TestKind::CustomTest, true, "pytest: ok").at_revision(1));
        assert_eq!(gate().evaluate(1, &results, false), GateDecision::Approved);
    }

    // -------------------------------------------------------------------
    // Force
    // -------------------------------------------------------------------

    #[test]
    fn test_gate_force_lists_bypassed_checks() {
        let results = vec![syntax(false, 1)];
        match gate().evaluate(1, &results, true) {
            GateDecision::Forced { bypassed } => {
                assert_eq!(bypassed.len(), 2);
                assert!(matches!(bypassed[0], GateRefusal::SyntaxFailed { .. }));
                assert_eq!(bypassed[1], GateRefusal::ShadowNotRun);
            }
            other => panic!("expected forced, got {other:?}"),
        }
    }

    #[test]
    fn test_gate_force_with_clean_trail_is_still_forced() {
        let results = vec![syntax(true, 1), shadow(true, 1)];
        let decision = gate().evaluate(1, &results, true);
        assert_eq!(decision, GateDecision::Forced { bypassed: vec![] });
        assert!(decision.may_apply());
    }

    // -------------------------------------------------------------------
    // Config
    // -------------------------------------------------------------------

    #[test]
    fn test_gate_disabled_shadow_requirement() {
        let gate = ApplyGate::new(GateConfig { require_shadow: false, ..GateConfig::default() });
        assert_eq!(gate.evaluate(1, &[syntax(true, 1)], false), GateDecision::Approved);
        assert!(!gate.config().require_shadow);
    }

    #[test]
    fn test_refusal_display_is_specific() {
        assert_eq!(
            GateRefusal::SyntaxFailed { files: vec!["a.py".into(), "b.py".into()] }.to_string(),
            "syntax check failed for a.py, b.py"
        );
        assert!(GateRefusal::NoModifications.to_string().contains("nothing to apply"));
    }
}
