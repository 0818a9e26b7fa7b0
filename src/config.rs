use std::fs;
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::validator::ValidationPolicy;
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "sd_provisioner.json";

const DEFAULT_MAX_FILES: usize = 100;
const DEFAULT_MAX_DRIVE_GB: f64 = 5.0;

const KNOWN_KEYS: &[&str] = &[
    "source_dir",
    "allowed_extensions",
    "max_files",
    "auto_start",
    "allow_subdirs",
    "last_version",
    "max_drive_gb",
    "auto_format_corrupt",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub source_dir: String,
    pub allowed_extensions: Vec<String>,
    pub max_files: usize,
    pub auto_start: bool,
    pub allow_subdirs: bool,
    pub last_version: String,
    pub max_drive_gb: f64,
    pub auto_format_corrupt: bool,

    /// Keys written by other tools or newer versions, kept on save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source_dir: String::new(),
            allowed_extensions: vec![".bin".into(), ".hex".into(), ".dat".into()],
            max_files: DEFAULT_MAX_FILES,
            auto_start: false,
            allow_subdirs: false,
            last_version: String::new(),
            max_drive_gb: DEFAULT_MAX_DRIVE_GB,
            auto_format_corrupt: false,
            extra: Map::new(),
        }
    }
}

impl AppConfig {
    /// Load the config file merged over the defaults.
    ///
    /// A missing file yields the defaults. A file that cannot be parsed is
    /// logged and also yields the defaults. `SDPROV_<KEY>` environment
    /// variables override the file for the known keys.
    pub fn load(path: &Path) -> Self {
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed("SDPROV_").only(KNOWN_KEYS));

        let mut config = match figment.extract::<AppConfig>() {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Config unreadable, using defaults");
                AppConfig::default()
            }
        };

        // Never resume unattended writes from a previous session.
        config.auto_start = false;
        debug!(path = %path.display(), "Config loaded");
        config
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn source_root(&self) -> Option<PathBuf> {
        if self.source_dir.is_empty() {
            return None;
        }
        let path = PathBuf::from(&self.source_dir);
        path.is_dir().then_some(path)
    }

    /// Capacity limit in GB, `None` when disabled (zero or negative).
    pub fn max_capacity_gb(&self) -> Option<f64> {
        (self.max_drive_gb > 0.0).then_some(self.max_drive_gb)
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            allowed_extensions: self
                .allowed_extensions
                .iter()
                .map(|ext| ext.to_lowercase())
                .collect(),
            max_files: self.max_files,
            allow_subdirectories: self.allow_subdirs,
            max_capacity_gb: self.max_capacity_gb(),
        }
    }
}

/// A settings edit as entered by the user, applied field by field.
#[derive(Debug, Default, Clone)]
pub struct SettingsUpdate {
    pub source_dir: Option<String>,
    /// Comma separated, e.g. `"bin, .hex"`. An empty string allows all extensions.
    pub extensions: Option<String>,
    pub max_files: Option<String>,
    pub max_drive_gb: Option<String>,
    pub allow_subdirs: Option<bool>,
    pub auto_format_corrupt: Option<bool>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.source_dir.is_none()
            && self.extensions.is_none()
            && self.max_files.is_none()
            && self.max_drive_gb.is_none()
            && self.allow_subdirs.is_none()
            && self.auto_format_corrupt.is_none()
    }

    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.source_dir {
            config.source_dir = dir.clone();
        }
        if let Some(raw) = &self.extensions {
            config.allowed_extensions = parse_extensions(raw);
        }
        if let Some(raw) = &self.max_files {
            config.max_files = raw.trim().parse().unwrap_or(DEFAULT_MAX_FILES);
        }
        if let Some(raw) = &self.max_drive_gb {
            config.max_drive_gb = raw.trim().parse().unwrap_or(DEFAULT_MAX_DRIVE_GB);
        }
        if let Some(allow) = self.allow_subdirs {
            config.allow_subdirs = allow;
        }
        if let Some(auto) = self.auto_format_corrupt {
            config.auto_format_corrupt = auto;
        }
    }
}

pub fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ext| !ext.is_empty())
        .map(|ext| {
            if ext.starts_with('.') {
                ext.to_string()
            } else {
                format!(".{ext}")
            }
        })
        .collect()
}
