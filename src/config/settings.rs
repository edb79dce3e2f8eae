//! User settings
//!
//! Loads settings from `$XDG_CONFIG_HOME/boxi/config.toml` (falling back to
//! `~/.config`). A missing file means defaults; every key is optional.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration directory and file name
pub const CONFIG_DIR: &str = "boxi";
pub const CONFIG_FILE: &str = "config.toml";

/// Terminal type advertised to sessions unless overridden
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How agent workers are launched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Worker program on the host; defaults to the running executable
    pub program: Option<PathBuf>,
    /// Program name `flatpak-spawn --host` runs when sandboxed
    #[serde(default = "default_host_program")]
    pub host_program: String,
    /// Worker program inside containers; defaults to the host program under `/run/host`
    pub container_program: Option<PathBuf>,
    /// Container runtime used for `exec`
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    /// Settings file the worker is told to load, from `--config`
    #[serde(skip)]
    pub worker_config: Option<PathBuf>,
    /// Start the worker with `--verbose`
    #[serde(skip)]
    pub worker_verbose: bool,
}

fn default_host_program() -> String {
    "boxi".to_string()
}

fn default_container_runtime() -> String {
    "podman".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            program: None,
            host_program: default_host_program(),
            container_program: None,
            container_runtime: default_container_runtime(),
            worker_config: None,
            worker_verbose: false,
        }
    }
}

/// Defaults applied to every session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Environment sent with each start request
    #[serde(default = "default_session_env")]
    pub env: BTreeMap<String, String>,
}

fn default_session_env() -> BTreeMap<String, String> {
    BTreeMap::from([("TERM".to_string(), DEFAULT_TERM.to_string())])
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            env: default_session_env(),
        }
    }
}

/// Worker-side choices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Login shell override
    pub shell: Option<String>,
    /// Editor override for `_EDITOR`
    pub editor: Option<String>,
    /// Pager override for `_PAGER`
    pub pager: Option<String>,
    /// Initial terminal columns
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Initial terminal rows
    #[serde(default = "default_rows")]
    pub rows: u16,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            shell: None,
            editor: None,
            pager: None,
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// All settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
}

impl Settings {
    /// Load settings from a file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load from the default location
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// `$XDG_CONFIG_HOME/boxi/config.toml`, or `~/.config/boxi/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        config_path(
            std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
            std::env::var_os("HOME").map(PathBuf::from),
        )
    }
}

fn config_path(xdg_config_home: Option<PathBuf>, home: Option<PathBuf>) -> Option<PathBuf> {
    let base = xdg_config_home
        .filter(|dir| dir.is_absolute())
        .or_else(|| home.map(|home| home.join(".config")))?;
    Some(base.join(CONFIG_DIR).join(CONFIG_FILE))
}
