//! # Stage: Atomic Applier and Rollback
//!
//! ## Responsibility
//! The only code that writes to the live tree.
//! - [`apply_files`] copies workspace files over their live counterparts.
//! - [`restore_from_backup`] copies every backed-up file back and removes
//!   files that an apply created.
//!
//! ## Guarantees
//! - Atomic per file: each file is written to a sibling temp file and renamed
//!   into place, so a reader never sees a half-written file.
//! - NOT transactional across files: if file N fails, files 1..N-1 are already
//!   live.  [`SandboxError::ApplyPartialFailure`] lists them; restore next.
//! - Restore is idempotent: running it twice leaves the same tree as once.
//!
//! ## NOT Responsible For
//! - Deciding whether apply is allowed (see `gate`).
//! - Restarting the service (see `restart`).

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, error, info};

use crate::error::{Result, SandboxError};
use crate::self_modify::workspace::{copy_file, list_files, validate_relative};

/// Written into the backup directory by `end`; never restored.
pub const MANIFEST_FILE: &str = ".session_manifest.json";

// ---------------------------------------------------------------------------
// Per-file replace
// ---------------------------------------------------------------------------

/// Replace `dst` with the contents of `src` via temp file + rename.
pub(crate) fn replace_file(src: &Path, dst: &Path) -> io::Result<()> {
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.swap-{}", std::process::id()));
    if let Err(e) = copy_file(src, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, dst).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Copy each of `files` from `workspace` onto `live_root`, in order.
///
/// Returns the files written.  Stops at the first failure.
pub fn apply_files(workspace: &Path, live_root: &Path, files: &[String]) -> Result<Vec<String>> {
    let mut applied = Vec::with_capacity(files.len());
    for name in files {
        let rel = validate_relative(name)?;
        let src = workspace.join(&rel);
        let dst = live_root.join(&rel);
        if let Err(source) = replace_file(&src, &dst) {
            error!(file = %name, applied = applied.len(), error = %source, "apply stopped part-way; live tree is mixed");
            return Err(SandboxError::ApplyPartialFailure {
                applied,
                failed: name.clone(),
                source,
            });
        }
        debug!(file = %name, "applied");
        applied.push(name.clone());
    }
    info!(files = applied.len(), "workspace applied to live tree");
    Ok(applied)
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// What a restore changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Files copied from the backup onto the live tree.
    pub restored: Vec<String>,
    /// Files removed from the live tree because the session created them.
    pub removed: Vec<String>,
}

/// Copy every file in `backup` onto `live_root`, then delete each of
/// `created` from the live tree.
pub fn restore_from_backup(backup: &Path, live_root: &Path, created: &[String]) -> Result<RollbackReport> {
    if !backup.is_dir() {
        return Err(SandboxError::Rollback {
            detail: format!("backup directory {} is missing", backup.display()),
        });
    }
    let files = list_files(backup).map_err(|e| SandboxError::Rollback {
        detail: format!("cannot read backup {}: {e}", backup.display()),
    })?;

    let mut report = RollbackReport::default();
    for rel in files {
        if rel.as_os_str() == MANIFEST_FILE {
            continue;
        }
        let name = rel.to_string_lossy().into_owned();
        replace_file(&backup.join(&rel), &live_root.join(&rel)).map_err(|e| {
            SandboxError::Rollback { detail: format!("restoring {name}: {e}") }
        })?;
        report.restored.push(name);
    }

    for name in created {
        let rel = validate_relative(name)?;
        let path = live_root.join(rel);
        match fs::remove_file(&path) {
            Ok(()) => report.removed.push(name.clone()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SandboxError::Rollback {
                    detail: format!("removing created file {name}: {e}"),
                })
            }
        }
    }

    info!(
        restored = report.restored.len(),
        removed = report.removed.len(),
        "live tree restored from backup"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Dirs {
        _tmp: tempfile::TempDir,
        ws: PathBuf,
        live: PathBuf,
        backup: PathBuf,
    }

    fn dirs() -> Dirs {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        let live = tmp.path().join("live");
        let backup = tmp.path().join("backup");
        for d in [&ws, &live, &backup] {
            fs::create_dir_all(d).unwrap();
        }
        Dirs { _tmp: tmp, ws, live, backup }
    }

    fn read(p: &Path) -> String {
        fs::read_to_string(p).unwrap()
    }

    #[test]
    fn test_apply_copies_listed_files_only() {
        let d = dirs();
        fs::write(d.ws.join("a.py"), "new a").unwrap();
        fs::write(d.ws.join("b.py"), "new b").unwrap();
        fs::write(d.live.join("a.py"), "old a").unwrap();
        fs::write(d.live.join("b.py"), "old b").unwrap();

        let applied = apply_files(&d.ws, &d.live, &["a.py".to_string()]).unwrap();
        assert_eq!(applied, vec!["a.py".to_string()]);
        assert_eq!(read(&d.live.join("a.py")), "new a");
        assert_eq!(read(&d.live.join("b.py")), "old b");
    }

    #[test]
    fn test_apply_creates_nested_live_files_and_leaves_no_temp() {
        let d = dirs();
        fs::create_dir_all(d.ws.join("pkg")).unwrap();
        fs::write(d.ws.join("pkg/new.py"), "x").unwrap();
        apply_files(&d.ws, &d.live, &["pkg/new.py".to_string()]).unwrap();
        assert_eq!(read(&d.live.join("pkg/new.py")), "x");
        let leftovers: Vec<_> = fs::read_dir(d.live.join("pkg"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["new.py".to_string()]);
    }

    #[test]
    fn test_apply_partial_failure_reports_what_landed() {
        let d = dirs();
        fs::write(d.ws.join("a.py"), "new a").unwrap();
        // b.py missing from the workspace: the copy fails
        let err = apply_files(&d.ws, &d.live, &["a.py".to_string(), "b.py".to_string()]).unwrap_err();
        match err {
            SandboxError::ApplyPartialFailure { applied, failed, .. } => {
                assert_eq!(applied, vec!["a.py".to_string()]);
                assert_eq!(failed, "b.py");
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
        assert_eq!(read(&d.live.join("a.py")), "new a");
    }

    #[test]
    fn test_restore_copies_backup_and_removes_created() {
        let d = dirs();
        fs::write(d.backup.join("a.py"), "orig").unwrap();
        fs::write(d.backup.join(MANIFEST_FILE), "{}").unwrap();
        fs::write(d.live.join("a.py"), "changed").unwrap();
        fs::write(d.live.join("extra.py"), "created by apply").unwrap();

        let report = restore_from_backup(&d.backup, &d.live, &["extra.py".to_string()]).unwrap();
        assert_eq!(report.restored, vec!["a.py".to_string()]);
        assert_eq!(report.removed, vec!["extra.py".to_string()]);
        assert_eq!(read(&d.live.join("a.py")), "orig");
        assert!(!d.live.join("extra.py").exists());
        assert!(!d.live.join(MANIFEST_FILE).exists());
    }

    #[test]
    fn test_restore_twice_equals_once() {
        let d = dirs();
        fs::write(d.backup.join("a.py"), "orig").unwrap();
        fs::write(d.live.join("a.py"), "changed").unwrap();
        fs::write(d.live.join("extra.py"), "x").unwrap();
        let created = vec!["extra.py".to_string()];

        restore_from_backup(&d.backup, &d.live, &created).unwrap();
        let once = list_files(&d.live).unwrap();
        let second = restore_from_backup(&d.backup, &d.live, &created).unwrap();
        assert_eq!(list_files(&d.live).unwrap(), once);
        assert_eq!(read(&d.live.join("a.py")), "orig");
        assert!(second.removed.is_empty());
    }

    #[test]
    fn test_restore_without_backup_is_rollback_error() {
        let d = dirs();
        let err = restore_from_backup(&d.backup.join("gone"), &d.live, &[]).unwrap_err();
        assert!(matches!(err, SandboxError::Rollback { .. }));
        assert!(err.requires_operator());
    }
}
