//! TOML-based configuration.
//!
//! Supports a config file (tessera.toml) with environment variable
//! expansion.
//!
//! Example configuration:
//! ```toml
//! [cache]
//! retention_minutes = 30
//! sweep_interval_secs = 300
//! lock_stripes = 64
//! store_dir = "${TESSERA_CACHE_DIR}"
//!
//! [limits]
//! max_rows = 100000
//! formula_length_guard = 4096
//! rotation_fixup_columns = 250
//!
//! [selection]
//! association_mode = true
//! select_first_item = true
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub limits: LimitSettings,
    pub selection: SelectionSettings,
}

impl Settings {
    /// Load settings from a TOML file, expanding `${VAR}` references.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path)?;
        let expanded = expand_env_vars(&raw)?;
        Ok(toml::from_str(&expanded)?)
    }
}

/// Result-cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entries older than this are swept from the distributed tier.
    pub retention_minutes: u64,

    /// How often the cluster-singleton sweep runs.
    pub sweep_interval_secs: u64,

    /// Number of key-striped locks guarding cold loads.
    pub lock_stripes: usize,

    /// Directory for the durable store tier. Defaults to a per-user
    /// data directory.
    pub store_dir: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            retention_minutes: 30,
            sweep_interval_secs: 300,
            lock_stripes: 64,
            store_dir: None,
        }
    }
}

/// Row/expression guard rails.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Hard row cap applied to realized results. 0 disables the cap.
    pub max_rows: usize,

    /// Expressions longer than this are excluded from column
    /// reordering (deep parse recursion protection).
    pub formula_length_guard: usize,

    /// Column cap for the rotated-selection fix-up.
    pub rotation_fixup_columns: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_rows: 0,
            formula_length_guard: 4096,
            rotation_fixup_columns: 250,
        }
    }
}

/// Facet/selection behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectionSettings {
    /// Whether other facets' selections constrain this one.
    pub association_mode: bool,

    /// Auto-select the first compatible value in single-selection
    /// widgets with no current selection.
    pub select_first_item: bool,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            association_mode: true,
            select_first_item: true,
        }
    }
}

/// Expand `${VAR}` references from the process environment.
pub fn expand_env_vars(input: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match env::var(name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => return Err(SettingsError::MissingEnvVar(name.to_string())),
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    Ok(result)
}
