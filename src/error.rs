//! Crate-level error type.
//!
//! Only conditions that stop an operation are errors.  A syntax failure or a
//! failed shadow run is a *result* (see [`crate::self_modify::syntax::SyntaxReport`]
//! and [`crate::self_modify::shadow::ShadowReport`]) and is recorded in the
//! session's audit trail instead.

use std::path::PathBuf;

use crate::self_modify::gate::GateRefusal;
use crate::self_modify::record::SessionState;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Every way a sandbox operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Scratch or backup directory could not be created or populated.
    /// Fatal for the session being started.
    #[error("workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A caller-supplied file name escapes the tracked tree.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// The operation is not allowed in the session's current state.
    #[error("session not active for {operation} (state: {state})")]
    SessionNotActive {
        operation: &'static str,
        state: SessionState,
    },

    /// Another session already holds the process-wide slot.
    #[error("session {session_id} is already active; end or clear it first")]
    SessionAlreadyActive { session_id: String },

    /// `apply(force = false)` was refused by the gate.
    #[error("apply refused: {0}")]
    ApplyRefused(GateRefusal),

    /// Some files reached the live tree before a copy failed.  The live tree
    /// is now mixed; call `rollback` immediately.
    #[error("apply failed on '{failed}' after {} file(s) were written: {source}", applied.len())]
    ApplyPartialFailure {
        applied: Vec<String>,
        failed: String,
        #[source]
        source: std::io::Error,
    },

    /// Backup missing or unreadable, or a restore copy failed.  No automatic
    /// recovery remains; a human operator must intervene.
    #[error("rollback failed: {detail}")]
    Rollback { detail: String },

    /// The restart sentinel could not be written or removed.
    #[error("restart signal at {} failed: {source}", path.display())]
    RestartSignal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be read, parsed or validated.
    #[error("config error: {detail}")]
    Config { detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SandboxError::Workspace { path: path.into(), source }
    }

    /// True for errors after which the live tree may be inconsistent.
    pub fn requires_operator(&self) -> bool {
        matches!(self, SandboxError::Rollback { .. })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
