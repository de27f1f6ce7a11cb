//! # Module: self_modify
//!
//! Safe self-modification: edits land in a scratch copy of the service, are
//! syntax-checked and exercised in a disposable shadow instance, and only then
//! reach the live tree.  A backup taken at session start makes every apply
//! reversible.
//!
//! ## Sub-modules
//! - [`record`]    - audit-trail records and [`record::SessionState`]
//! - [`workspace`] - workspace + backup isolation, path safety, file edits
//! - [`syntax`]    - per-extension syntax-only checks
//! - [`shadow`]    - shadow instance spawn, probe, smoke task, teardown
//! - [`gate`]      - apply preconditions evaluated from the audit trail
//! - [`apply`]     - copy workspace onto live; restore from backup
//! - [`restart`]   - restart sentinel for an external supervisor
//! - [`session`]   - the [`session::Session`] handle and state machine
//! - [`registry`]  - one active session per process

pub mod record;
pub mod workspace;
pub mod syntax;
pub mod shadow;
pub mod gate;
pub mod apply;
pub mod restart;
pub mod session;
pub mod registry;

pub use gate::{GateDecision, GateRefusal};
pub use registry::SessionRegistry;
pub use session::{ApplyReport, Session, SessionStatus};
