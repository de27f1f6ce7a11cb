//! # Stage: Workspace Isolator
//!
//! ## Responsibility
//! Creates the two directories a session owns: an editable *workspace* copy of
//! the core files and an untouched *backup* of core + config files, both taken
//! at the same instant.  Edits land in the workspace only.
//!
//! ## Guarantees
//! - All-or-nothing: if either directory cannot be created or populated,
//!   whatever was created is removed and `SandboxError::Workspace` is returned.
//! - Contained: every caller-supplied name is checked to stay inside the tree.
//! - Never writes to the live tree.
//!
//! ## NOT Responsible For
//! - Deciding when an edit is allowed (that is the session state machine).
//! - Copying back to the live tree (see `apply`).

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};

// ---------------------------------------------------------------------------
// Path safety
// ---------------------------------------------------------------------------

/// Normalise `name` into a relative path that cannot leave its root.
///
/// Rejects empty names, absolute paths and any `..` component.  `.` components
/// are dropped.
pub fn validate_relative(name: &str) -> Result<PathBuf> {
    let invalid = |reason: &str| SandboxError::InvalidPath {
        path: name.to_string(),
        reason: reason.to_string(),
    };
    if name.trim().is_empty() {
        return Err(invalid("empty file name"));
    }
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("parent directory components are not allowed")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("absolute paths are not allowed"))
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(invalid("path resolves to the root itself"));
    }
    Ok(out)
}

/// Copy `src` to `dst`, creating `dst`'s parent directories.
pub(crate) fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)
}

/// Relative paths of every regular file under `root`, sorted.
pub(crate) fn list_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let ty = entry.file_type()?;
            if ty.is_dir() {
                walk(root, &path, out)?;
            } else if ty.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_path_buf());
                }
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    out.sort();
    Ok(out)
}

// ---------------------------------------------------------------------------
// TrackedFiles
// ---------------------------------------------------------------------------

/// The file set a session protects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedFiles {
    /// Editable source files, relative to the live root.
    pub core: Vec<String>,
    /// Backed up only.
    pub config: Vec<String>,
}

impl TrackedFiles {
    pub fn new(core: Vec<String>, config: Vec<String>) -> Self {
        Self { core, config }
    }

    /// Top-level files of `live_root` whose extension is in `extensions`,
    /// skipping names that start with `_` or `.`.
    pub fn discover(live_root: &Path, extensions: &[String]) -> io::Result<Vec<String>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(live_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('_') || name.starts_with('.') {
                continue;
            }
            let matches = Path::new(&name)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| extensions.iter().any(|x| x == e));
            if matches {
                found.push(name);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Explicit `core_files` from `cfg`, or discovery when that list is empty.
    pub fn from_config(cfg: &SandboxConfig) -> Result<Self> {
        let core = if cfg.core_files.is_empty() {
            Self::discover(&cfg.live_root, &cfg.core_extensions)
                .map_err(|e| SandboxError::workspace(&cfg.live_root, e))?
        } else {
            cfg.core_files.clone()
        };
        Ok(Self::new(core, cfg.config_files.clone()))
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// The workspace/backup pair owned by one session.
#[derive(Debug)]
pub struct Workspace {
    live_root: PathBuf,
    workspace: PathBuf,
    backup: PathBuf,
    tracked: TrackedFiles,
    /// Files held in the backup: core and config files present at creation,
    /// plus untracked live files backed up on first edit.
    snapshot: BTreeSet<String>,
}

impl Workspace {
    /// Create `<scratch_root>/self_modify_<id>` and `<backup_root>/backup_<id>`
    /// and populate them from `live_root`.
    pub fn create(
        session_id: &str,
        live_root: &Path,
        scratch_root: &Path,
        backup_root: &Path,
        tracked: TrackedFiles,
    ) -> Result<Self> {
        for name in tracked.core.iter().chain(tracked.config.iter()) {
            validate_relative(name)?;
        }

        let workspace = scratch_root.join(format!("self_modify_{session_id}"));
        let backup = backup_root.join(format!("backup_{session_id}"));

        make_fresh_dir(&workspace)?;
        if let Err(e) = make_fresh_dir(&backup) {
            let _ = fs::remove_dir_all(&workspace);
            return Err(e);
        }

        let mut ws = Self {
            live_root: live_root.to_path_buf(),
            workspace,
            backup,
            tracked,
            snapshot: BTreeSet::new(),
        };

        if let Err(e) = ws.populate() {
            let _ = fs::remove_dir_all(&ws.workspace);
            let _ = fs::remove_dir_all(&ws.backup);
            return Err(e);
        }

        info!(
            session_id,
            workspace = %ws.workspace.display(),
            backup = %ws.backup.display(),
            files = ws.snapshot.len(),
            "workspace isolated"
        );
        Ok(ws)
    }

    fn populate(&mut self) -> Result<()> {
        for name in &self.tracked.core {
            let src = self.live_root.join(name);
            if !src.is_file() {
                debug!(file = %name, "core file absent from live tree; not copied");
                continue;
            }
            let to_ws = self.workspace.join(name);
            copy_file(&src, &to_ws).map_err(|e| SandboxError::workspace(&to_ws, e))?;
            let to_backup = self.backup.join(name);
            copy_file(&src, &to_backup).map_err(|e| SandboxError::workspace(&to_backup, e))?;
            self.snapshot.insert(name.clone());
        }
        for name in &self.tracked.config {
            let src = self.live_root.join(name);
            if !src.is_file() {
                continue;
            }
            let to_backup = self.backup.join(name);
            copy_file(&src, &to_backup).map_err(|e| SandboxError::workspace(&to_backup, e))?;
            self.snapshot.insert(name.clone());
        }
        Ok(())
    }

    /// Write `content` to the workspace copy of `filename`.
    pub fn write_file(&self, filename: &str, content: &str) -> Result<PathBuf> {
        let rel = validate_relative(filename)?;
        let path = self.workspace.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SandboxError::workspace(parent, e))?;
        }
        fs::write(&path, content).map_err(|e| SandboxError::workspace(&path, e))?;
        Ok(path)
    }

    /// Add a live file outside the start-time snapshot to the backup, so
    /// rollback can restore it.  Returns whether a copy was made: `false`
    /// when `filename` is already in the snapshot or absent from the live tree.
    pub fn back_up_untracked(&mut self, filename: &str) -> Result<bool> {
        let rel = validate_relative(filename)?;
        let name = filename.to_string();
        if self.snapshot.contains(&name) {
            return Ok(false);
        }
        let src = self.live_root.join(&rel);
        if !src.is_file() {
            return Ok(false);
        }
        let dst = self.backup.join(&rel);
        copy_file(&src, &dst).map_err(|e| SandboxError::workspace(&dst, e))?;
        self.snapshot.insert(name);
        debug!(file = filename, "untracked live file added to backup");
        Ok(true)
    }

    /// Copy each of `files` from the live tree into the workspace unless the
    /// workspace already has it.  Returns how many were copied.
    pub fn copy_runtime_config(&self, files: &[String]) -> Result<usize> {
        let mut copied = 0;
        for name in files {
            let rel = validate_relative(name)?;
            let src = self.live_root.join(&rel);
            let dst = self.workspace.join(&rel);
            if !src.is_file() || dst.exists() {
                continue;
            }
            copy_file(&src, &dst).map_err(|e| SandboxError::workspace(&dst, e))?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Delete the workspace directory.  The backup is never touched here.
    pub fn remove_workspace(&self) -> Result<()> {
        if self.workspace.exists() {
            fs::remove_dir_all(&self.workspace)
                .map_err(|e| SandboxError::workspace(&self.workspace, e))?;
        }
        Ok(())
    }

    pub fn live_root(&self) -> &Path {
        &self.live_root
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn tracked(&self) -> &TrackedFiles {
        &self.tracked
    }

    /// Whether `name` is held in the backup: it existed in the live tree at
    /// start, or was added by [`Workspace::back_up_untracked`].
    pub fn in_snapshot(&self, name: &str) -> bool {
        self.snapshot.contains(name)
    }
}

fn make_fresh_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SandboxError::workspace(parent, e))?;
    }
    // create_dir (not _all) so an existing directory is an error.
    fs::create_dir(path).map_err(|e| SandboxError::workspace(path, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
