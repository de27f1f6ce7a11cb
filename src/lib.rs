//! Safe self-modification sandbox for long-running services.
//!
//! ```no_run
//! # async fn demo() -> self_modify_sandbox::Result<()> {
//! use self_modify_sandbox::{SandboxConfig, Session};
//!
//! let mut session = Session::start(SandboxConfig::for_root("/srv/agent"))?;
//! session.modify("service.py", "print('v2')\n")?;
//! session.run_syntax_check().await?;
//! session.run_shadow_test().await?;
//! match session.apply(false) {
//!     Ok(_) => {
//!         session.request_restart()?;
//!     }
//!     Err(e) => {
//!         tracing::warn!(error = %e, "not applied");
//!         session.rollback()?;
//!     }
//! }
//! session.end(true)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod self_modify;

pub use config::{CheckerSpec, GateConfig, SandboxConfig, ShadowConfig, SyntaxConfig};
pub use error::{Result, SandboxError};
pub use self_modify::{ApplyReport, GateDecision, GateRefusal, Session, SessionRegistry, SessionStatus};
