//! # Stage: Restart Coordinator
//!
//! ## Responsibility
//! Raises a flag for an external supervisor that the live process must be
//! restarted to pick up applied files.  The flag is a small JSON file:
//!
//! ```json
//! {"requested_at_ms": 1760000000000, "session_id": "1760000000000_3fa2c1d9"}
//! ```
//!
//! The supervisor side ([`RestartSignal::is_pending`], [`RestartSignal::clear`])
//! lives here too so both ends agree on the format.
//!
//! ## NOT Responsible For
//! - Restarting anything.  A process restarting itself mid-response is unsafe.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SandboxError};
use crate::self_modify::record::now_ms;

/// Body of the sentinel file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartRequest {
    pub requested_at_ms: u64,
    pub session_id: String,
}

/// Handle on the sentinel path.
#[derive(Debug, Clone)]
pub struct RestartSignal {
    path: PathBuf,
}

impl RestartSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write (or overwrite) the sentinel.
    pub fn request(&self, session_id: &str) -> Result<RestartRequest> {
        let req = RestartRequest { requested_at_ms: now_ms(), session_id: session_id.to_string() };
        let fail = |source: io::Error| SandboxError::RestartSignal { path: self.path.clone(), source };
        let body = serde_json::to_vec_pretty(&req).map_err(|e| fail(io::Error::other(e)))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(fail)?;
        }
        fs::write(&self.path, body).map_err(fail)?;
        info!(session_id, flag = %self.path.display(), "restart requested");
        Ok(req)
    }

    pub fn is_pending(&self) -> bool {
        self.path.is_file()
    }

    /// The pending request, if the flag exists and parses.
    pub fn pending(&self) -> Option<RestartRequest> {
        let text = fs::read(&self.path).ok()?;
        serde_json::from_slice(&text).ok()
    }

    /// Remove the sentinel.  Clearing an absent flag is not an error.
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(SandboxError::RestartSignal { path: self.path.clone(), source }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
