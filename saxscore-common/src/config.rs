//! Configuration loading and root folder resolution

use crate::models::ExportFormat;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "SAXSCORE_ROOT_FOLDER";

/// Environment variable naming the TOML config file
pub const CONFIG_FILE_ENV: &str = "SAXSCORE_CONFIG";

/// Contents of `config.toml`
///
/// Every field has a default, so an empty file (or no file) is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Folder holding the SQLite database
    pub root_folder: Option<PathBuf>,
    /// HTTP listen port
    pub port: Option<u16>,
    pub logging: LoggingConfig,
    pub worker: WorkerSection,
    pub backend: BackendSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Worker loop and pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Sleep between polls of an empty queue
    pub idle_interval_ms: u64,
    /// Per-stage limit on backend calls; unset means wait indefinitely
    pub stage_timeout_secs: Option<u64>,
    /// Formats rendered by the export stage, in order
    pub export_formats: Vec<ExportFormat>,
    /// Largest accepted upload
    pub max_upload_bytes: usize,
    /// Per-subscriber buffer of the job event bus
    pub event_capacity: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            idle_interval_ms: 500,
            stage_timeout_secs: None,
            export_formats: vec![ExportFormat::MusicXml, ExportFormat::Json],
            max_upload_bytes: 64 * 1024 * 1024,
            event_capacity: 100,
        }
    }
}

/// Which analysis backend implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// External analysis process (file-based JSON exchange)
    #[default]
    Process,
    /// In-process deterministic stand-in
    Stub,
}

/// Source separation strategy requested from the analysis process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeparationMode {
    Auto,
    Demucs,
    Spleeter,
    #[default]
    No,
}

impl SeparationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeparationMode::Auto => "auto",
            SeparationMode::Demucs => "demucs",
            SeparationMode::Spleeter => "spleeter",
            SeparationMode::No => "no",
        }
    }
}

/// Analysis backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub kind: BackendKind,
    /// Executable to spawn (e.g. `python3`)
    pub program: String,
    /// Arguments placed before the protocol flags (e.g. the script path)
    pub args: Vec<String>,
    pub separate: SeparationMode,
    /// Fixed tempo; unset lets the backend estimate it
    pub tempo: Option<u32>,
    /// Ask the backend for a MIDI rendering alongside MusicXML
    pub emit_midi: bool,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: BackendKind::Process,
            program: "python3".to_string(),
            args: vec!["worker/process.py".to_string()],
            separate: SeparationMode::No,
            tempo: None,
            emit_midi: false,
        }
    }
}

impl TomlConfig {
    /// Parse TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Load `explicit` if given, else the first platform config file found, else defaults
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match find_config_file() {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading config file");
                Self::load(&path)
            }
            None => {
                tracing::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.idle_interval_ms == 0 {
            return Err(Error::Config("worker.idle_interval_ms must be positive".to_string()));
        }
        if self.worker.stage_timeout_secs == Some(0) {
            return Err(Error::Config("worker.stage_timeout_secs must be positive".to_string()));
        }
        if self.worker.export_formats.is_empty() {
            return Err(Error::Config("worker.export_formats must not be empty".to_string()));
        }
        if self.worker.event_capacity == 0 {
            return Err(Error::Config("worker.event_capacity must be positive".to_string()));
        }
        if self.backend.kind == BackendKind::Process && self.backend.program.trim().is_empty() {
            return Err(Error::Config("backend.program must be set for the process backend".to_string()));
        }
        Ok(())
    }
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_config: Option<&TomlConfig>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(root_folder) = toml_config.and_then(|c| c.root_folder.as_ref()) {
        return root_folder.clone();
    }

    default_root_folder()
}

/// Create the root folder if missing and return the database path inside it
pub fn prepare_root_folder(root_folder: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(root_folder).map_err(|e| {
        Error::Config(format!(
            "Failed to create root folder {}: {}",
            root_folder.display(),
            e
        ))
    })?;
    Ok(root_folder.join("saxscore.db"))
}

/// First existing config file: `$SAXSCORE_CONFIG`, the user config dir, then `/etc` on Linux
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("saxscore").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/saxscore/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("saxscore"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/saxscore"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("saxscore"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/saxscore"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("saxscore"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\saxscore"))
    } else {
        PathBuf::from("./saxscore_data")
    }
}
