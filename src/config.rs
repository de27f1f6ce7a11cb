//! # Sandbox configuration
//!
//! Every knob the self-modification pipeline reads, with defaults that match a
//! Python service launched through uvicorn.  All sections are optional in
//! TOML; missing fields fall back to [`Default`].
//!
//! ```toml
//! live_root = "/srv/agent"
//! core_extensions = ["py"]
//!
//! [syntax]
//! timeout_ms = 10000
//!
//! [shadow]
//! program = "python3"
//! args = ["-m", "uvicorn", "server:app", "--host", "127.0.0.1", "--port", "{port}"]
//! warmup_ms = 5000
//!
//! [gate]
//! require_shadow = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Placeholder replaced by the allocated shadow port.
pub const PORT_PLACEHOLDER: &str = "{port}";
/// Placeholder replaced by the absolute workspace path.
pub const WORKSPACE_PLACEHOLDER: &str = "{workspace}";
/// Placeholder replaced by the file under syntax check.
pub const FILE_PLACEHOLDER: &str = "{file}";

// ---------------------------------------------------------------------------
// SandboxConfig
// ---------------------------------------------------------------------------

/// Top-level configuration for one live tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory the live service runs from.
    pub live_root: PathBuf,
    /// Explicit core set, relative to `live_root`.  Empty means discover.
    pub core_files: Vec<String>,
    /// Extensions used by discovery when `core_files` is empty.
    pub core_extensions: Vec<String>,
    /// Backed up at session start but never edited.
    pub config_files: Vec<String>,
    /// Copied into the workspace before a shadow run so the service can boot.
    pub runtime_config_files: Vec<String>,
    /// Parent of `backup_<session_id>` directories.  Defaults to `<live_root>/.backups`.
    pub backup_root: Option<PathBuf>,
    /// Parent of workspace directories.  Defaults to the OS temp dir.
    pub scratch_root: Option<PathBuf>,
    /// Restart sentinel.  Defaults to `<live_root>/.restart_requested`.
    pub restart_flag: Option<PathBuf>,
    pub syntax: SyntaxConfig,
    pub shadow: ShadowConfig,
    pub gate: GateConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            live_root: PathBuf::from("."),
            core_files: Vec::new(),
            core_extensions: vec!["py".into()],
            config_files: [
                "SCAN_RULES.json",
                "STATE.json",
                "PLAN.json",
                "EVENTS.json",
                "ERRORS.json",
                "PROJECT_ROOT.txt",
                "secrets.json",
                "VERSION.json",
                "README.md",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            runtime_config_files: ["PROJECT_ROOT.txt", "SCAN_RULES.json", "STATE.json", "secrets.json"]
                .into_iter()
                .map(String::from)
                .collect(),
            backup_root: None,
            scratch_root: None,
            restart_flag: None,
            syntax: SyntaxConfig::default(),
            shadow: ShadowConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Defaults rooted at `live_root`.
    pub fn for_root(live_root: impl Into<PathBuf>) -> Self {
        Self { live_root: live_root.into(), ..Self::default() }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: SandboxConfig =
            toml::from_str(s).map_err(|e| SandboxError::Config { detail: e.to_string() })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SandboxError::Config {
            detail: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values that would make a gate meaningless.
    pub fn validate(&self) -> Result<()> {
        let bad = |detail: &str| -> Result<()> {
            Err(SandboxError::Config { detail: detail.to_string() })
        };
        if self.shadow.program.trim().is_empty() {
            return bad("shadow.program must not be empty");
        }
        if self.syntax.timeout_ms == 0 {
            return bad("syntax.timeout_ms must be > 0");
        }
        if self.shadow.health_timeout_ms == 0 || self.shadow.task_timeout_ms == 0 {
            return bad("shadow probe and task timeouts must be > 0");
        }
        if !self.shadow.health_path.starts_with('/') || !self.shadow.task_path.starts_with('/') {
            return bad("shadow.health_path and shadow.task_path must start with '/'");
        }
        if self.core_files.is_empty() && self.core_extensions.is_empty() {
            return bad("either core_files or core_extensions must be set");
        }
        Ok(())
    }

    pub fn backup_root(&self) -> PathBuf {
        self.backup_root
            .clone()
            .unwrap_or_else(|| self.live_root.join(".backups"))
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn restart_flag(&self) -> PathBuf {
        self.restart_flag
            .clone()
            .unwrap_or_else(|| self.live_root.join(".restart_requested"))
    }
}

// ---------------------------------------------------------------------------
// SyntaxConfig
// ---------------------------------------------------------------------------

/// How each file type is syntax-checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntaxConfig {
    /// Per-file timeout for external checkers.
    pub timeout_ms: u64,
    pub checkers: Vec<CheckerSpec>,
}

impl Default for SyntaxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            checkers: vec![
                CheckerSpec::Command {
                    extension: "py".into(),
                    program: "python3".into(),
                    args: vec!["-m".into(), "py_compile".into(), FILE_PLACEHOLDER.into()],
                },
                CheckerSpec::Command {
                    extension: "sh".into(),
                    program: "sh".into(),
                    args: vec!["-n".into(), FILE_PLACEHOLDER.into()],
                },
                CheckerSpec::Json { extension: "json".into() },
                CheckerSpec::Toml { extension: "toml".into() },
            ],
        }
    }
}

impl SyntaxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The checker registered for `file`'s extension, if any.
    pub fn checker_for(&self, file: &str) -> Option<&CheckerSpec> {
        let ext = Path::new(file).extension()?.to_str()?;
        self.checkers.iter().find(|c| c.extension() == ext)
    }
}

/// One syntax-only check, keyed by file extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckerSpec {
    /// Run an external compiler/parser; exit status 0 means valid.
    /// `{file}` in `args` is replaced with the workspace file path.
    Command {
        extension: String,
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Parse in-process as JSON.
    Json { extension: String },
    /// Parse in-process as TOML.
    Toml { extension: String },
}

impl CheckerSpec {
    pub fn extension(&self) -> &str {
        match self {
            CheckerSpec::Command { extension, .. }
            | CheckerSpec::Json { extension }
            | CheckerSpec::Toml { extension } => extension,
        }
    }

    /// Short label for reports.
    pub fn label(&self) -> String {
        match self {
            CheckerSpec::Command { program, .. } => program.clone(),
            CheckerSpec::Json { .. } => "json".into(),
            CheckerSpec::Toml { .. } => "toml".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ShadowConfig
// ---------------------------------------------------------------------------

/// How the shadow instance is launched and exercised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub program: String,
    /// `{port}` and `{workspace}` are substituted before spawn.
    pub args: Vec<String>,
    /// Environment variable pointed at the workspace (module search path).
    pub module_path_var: Option<String>,
    pub env: BTreeMap<String, String>,
    pub warmup_ms: u64,
    pub health_path: String,
    pub health_timeout_ms: u64,
    pub task_path: String,
    pub task_timeout_ms: u64,
    pub task_body: serde_json::Value,
    /// Time between SIGTERM and SIGKILL during teardown.
    pub grace_ms: u64,
    /// Maximum characters of response body or stderr kept in reports.
    pub detail_limit: usize,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            program: "python3".into(),
            args: ["-m", "uvicorn", "server:app", "--host", "127.0.0.1", "--port", PORT_PLACEHOLDER]
                .into_iter()
                .map(String::from)
                .collect(),
            module_path_var: Some("PYTHONPATH".into()),
            env: BTreeMap::new(),
            warmup_ms: 5_000,
            health_path: "/health".into(),
            health_timeout_ms: 5_000,
            task_path: "/run".into(),
            task_timeout_ms: 60_000,
            task_body: serde_json::json!({
                "message": "list the files in the current directory and tell me the current time"
            }),
            grace_ms: 5_000,
            detail_limit: 200,
        }
    }
}

impl ShadowConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// `args` with placeholders filled in.
    pub fn render_args(&self, port: u16, workspace: &Path) -> Vec<String> {
        let port = port.to_string();
        let workspace = workspace.display().to_string();
        self.args
            .iter()
            .map(|a| {
                a.replace(PORT_PLACEHOLDER, &port)
                    .replace(WORKSPACE_PLACEHOLDER, &workspace)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// GateConfig
// ---------------------------------------------------------------------------

/// Which checks `apply(force = false)` insists on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub require_syntax: bool,
    pub require_shadow: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { require_syntax: true, require_shadow: true }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
