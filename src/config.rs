use crate::artifacts::persist::expand_home;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub limits: LimitsConfig,
    pub output: OutputConfig,
    pub libraries: LibrariesConfig,
}

/// Image budgets. Zero disables a budget.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_images: usize,
    pub max_total_image_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Base directory for per-run output folders.
    pub base_dir: Option<String>,
}

/// Optional snippet libraries. Only libraries compiled into the binary
/// can be switched on.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LibrariesConfig {
    pub array: bool,
    pub dataframe: bool,
    pub image: bool,
    pub plot: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_images: 16,
            max_total_image_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for LibrariesConfig {
    fn default() -> Self {
        Self {
            array: true,
            dataframe: true,
            image: true,
            plot: true,
        }
    }
}

impl Config {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// ~/.runlet/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".runlet").join("config.toml"))
    }

    /// Load config from ~/.runlet/config.toml, falling back to defaults.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(config_path: &Path) -> Self {
        if !config_path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(config_path) {
            Ok(contents) => match Self::from_toml(&contents) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}. Using defaults.",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read {}: {}. Using defaults.",
                    config_path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn output_base_dir(&self) -> Option<PathBuf> {
        self.output
            .base_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(|dir| PathBuf::from(expand_home(dir)))
    }
}
