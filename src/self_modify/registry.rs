//! # Stage: Session Registry
//!
//! ## Responsibility
//! Enforces "one active session per process".  [`SessionRegistry::start`]
//! reserves the single slot, builds the [`Session`], and hands it a lease that
//! frees the slot when the session ends or is dropped.
//!
//! ## Guarantees
//! - A second `start` while a session holds the slot fails with
//!   [`SandboxError::SessionAlreadyActive`]; it never returns the other
//!   session's handle.
//! - A failed start leaves the slot free.
//! - [`SessionRegistry::clear`] force-releases the slot.  The old session's
//!   lease will not free a slot since taken by someone else.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::self_modify::record::now_ms;
use crate::self_modify::session::Session;

type Slot = Arc<Mutex<Option<String>>>;

static GLOBAL: Lazy<SessionRegistry> = Lazy::new(SessionRegistry::new);

fn lock(slot: &Slot) -> MutexGuard<'_, Option<String>> {
    // The slot only holds an id; a panic elsewhere cannot leave it torn.
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `<epoch ms>_<8 hex chars>`: sorts by start time, unique within a millisecond.
pub fn new_session_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}_{}", now_ms(), &uuid[..8])
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Proof that a session owns the registry slot.  Dropping it frees the slot.
#[derive(Debug)]
pub(crate) struct Lease {
    slot: Slot,
    session_id: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut guard = lock(&self.slot);
        if guard.as_deref() == Some(self.session_id.as_str()) {
            *guard = None;
        }
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Owner of the single active-session slot.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    slot: Slot,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`Session::start`].
    pub fn global() -> &'static SessionRegistry {
        &GLOBAL
    }

    /// Reserve the slot and start a session for `config`.
    pub fn start(&self, config: SandboxConfig) -> Result<Session> {
        let session_id = new_session_id();
        {
            let mut guard = lock(&self.slot);
            if let Some(active) = guard.as_ref() {
                warn!(active = %active, "start refused: a session is already active");
                return Err(SandboxError::SessionAlreadyActive { session_id: active.clone() });
            }
            *guard = Some(session_id.clone());
        }
        // From here the lease frees the slot if the session cannot be built.
        let lease = Lease { slot: Arc::clone(&self.slot), session_id: session_id.clone() };
        Session::open(config, session_id, lease)
    }

    pub fn active_session_id(&self) -> Option<String> {
        lock(&self.slot).clone()
    }

    /// Force-release the slot.  Returns the id that held it, if any.
    pub fn clear(&self) -> Option<String> {
        let previous = lock(&self.slot).take();
        if let Some(id) = &previous {
            info!(session_id = %id, "session slot cleared");
        }
        previous
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(tmp: &tempfile::TempDir) -> SandboxConfig {
        let live = tmp.path().join("live");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("service.py"), "x = 1\n").unwrap();
        let mut cfg = SandboxConfig::for_root(&live);
        cfg.scratch_root = Some(tmp.path().join("scratch"));
        cfg
    }

    #[test]
    fn test_session_ids_are_distinct() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert_eq!(a.split('_').nth(1).map(str::len), Some(8));
    }

    #[test]
    fn test_second_start_refused_while_active() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let first = registry.start(config(&tmp)).unwrap();
        assert_eq!(registry.active_session_id().as_deref(), Some(first.session_id()));

        match registry.start(config(&tmp)) {
            Err(SandboxError::SessionAlreadyActive { session_id }) => {
                assert_eq!(session_id, first.session_id())
            }
            other => panic!("expected SessionAlreadyActive, got {other:?}"),
        }
    }

    #[test]
    fn test_dropping_session_frees_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let session = registry.start(config(&tmp)).unwrap();
        drop(session);
        assert!(registry.active_session_id().is_none());
        assert!(registry.start(config(&tmp)).is_ok());
    }

    #[test]
    fn test_failed_start_leaves_slot_free() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let mut cfg = config(&tmp);
        cfg.shadow.program = String::new();
        assert!(registry.start(cfg).is_err());
        assert!(registry.active_session_id().is_none());
    }

    #[test]
    fn test_clear_releases_and_old_lease_does_not_steal_new_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let old = registry.start(config(&tmp)).unwrap();
        let old_id = old.session_id().to_string();

        assert_eq!(registry.clear(), Some(old_id));
        let new = registry.start(config(&tmp)).unwrap();
        drop(old);
        assert_eq!(registry.active_session_id().as_deref(), Some(new.session_id()));
    }

    #[test]
    fn test_registries_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let a = SessionRegistry::new();
        let b = SessionRegistry::new();
        let _sa = a.start(config(&tmp)).unwrap();
        assert!(b.start(config(&tmp)).is_ok());
    }
}
