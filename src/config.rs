//! Runtime configuration for the reference tables and local frames
//!
//! Loaded from `vm-roots.toml`; every field has a default so partial files
//! are valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::logging::{self, LogConfig};
use crate::reference::Reference;
use crate::storage::RefBlock;

pub const CONFIG_FILE_NAME: &str = "vm-roots.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Initial slot count of the resizable global table, clamped to
    /// `global_max_size`
    #[serde(default = "default_global_initial")]
    pub global_initial_capacity: usize,

    #[serde(default = "default_global_max")]
    pub global_max_size: usize,

    /// Slot count of the fixed (address-stable) global table
    #[serde(default = "default_fixed_size")]
    pub global_fixed_size: usize,

    #[serde(default = "default_weak_initial")]
    pub weak_initial_capacity: usize,

    #[serde(default = "default_weak_max")]
    pub weak_max_size: usize,

    /// Block budget shared by all local frames of one thread
    #[serde(default = "default_max_local_blocks")]
    pub max_local_blocks: usize,

    /// Check references on every remove/get and warn on misuse
    #[serde(default = "default_false")]
    pub validate_refs: bool,

    /// Entries printed by diagnostic dumps
    #[serde(default = "default_dump_limit")]
    pub dump_limit: usize,

    /// Free slots left when a table starts warning about its size
    #[serde(default = "default_near_capacity_margin")]
    pub near_capacity_margin: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default = "default_false")]
    pub json: bool,

    #[serde(default = "default_false")]
    pub spans: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            global_initial_capacity: default_global_initial(),
            global_max_size: default_global_max(),
            global_fixed_size: default_fixed_size(),
            weak_initial_capacity: default_weak_initial(),
            weak_max_size: default_weak_max(),
            max_local_blocks: default_max_local_blocks(),
            validate_refs: false,
            dump_limit: default_dump_limit(),
            near_capacity_margin: default_near_capacity_margin(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
            json: false,
            spans: false,
        }
    }
}

fn default_global_initial() -> usize { 1024 }
fn default_global_max() -> usize { 51_200 }
fn default_fixed_size() -> usize { 256 }
fn default_weak_initial() -> usize { 1024 }
fn default_weak_max() -> usize { 51_200 }
fn default_max_local_blocks() -> usize { 1024 }
fn default_dump_limit() -> usize { 10 }
fn default_near_capacity_margin() -> usize { 10 }
fn default_level() -> String { "info".to_string() }
fn default_false() -> bool { false }

impl StorageConfig {
    /// Small tables, validation on: the shape unit tests want
    pub fn small() -> Self {
        Self {
            global_initial_capacity: 4,
            global_max_size: 16,
            global_fixed_size: 4,
            weak_initial_capacity: 4,
            weak_max_size: 16,
            max_local_blocks: 8,
            validate_refs: true,
            dump_limit: 4,
            near_capacity_margin: 2,
        }
    }

    /// Check sizes against the reference encoding and each other
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tables = [
            ("global_max_size", self.global_max_size),
            ("global_fixed_size", self.global_fixed_size),
            ("weak_max_size", self.weak_max_size),
        ];
        for (field, size) in tables {
            if size == 0 {
                return Err(ConfigError::Invalid(field, "must be positive".into()));
            }
            if size > Reference::MAX_TABLE_INDEX {
                return Err(ConfigError::Invalid(
                    field,
                    format!("{} exceeds the index limit {}", size, Reference::MAX_TABLE_INDEX),
                ));
            }
        }

        // An initial capacity above its table's max is clamped when the table
        // is built, so a file may lower only the max.
        if self.global_initial_capacity == 0 {
            return Err(ConfigError::Invalid("global_initial_capacity", "must be positive".into()));
        }
        if self.weak_initial_capacity == 0 {
            return Err(ConfigError::Invalid("weak_initial_capacity", "must be positive".into()));
        }
        if self.max_local_blocks == 0 || self.max_local_blocks > RefBlock::MAX_BLOCKS {
            return Err(ConfigError::Invalid(
                "max_local_blocks",
                format!("must be in 1..={}", RefBlock::MAX_BLOCKS),
            ));
        }

        Ok(())
    }
}

impl LoggingSection {
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            level: logging::parse_level(&self.level).unwrap_or(logging::Level::INFO),
            log_path: self.file.clone(),
            json_format: self.json,
            show_spans: self.spans,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if logging::parse_level(&self.logging.level).is_none() {
            return Err(ConfigError::Invalid(
                "logging.level",
                format!("unknown level `{}`", self.logging.level),
            ));
        }
        self.storage.validate()
    }

    /// Find and load configuration from the current directory or its parents
    pub fn discover() -> Self {
        let mut current = std::env::current_dir().ok();

        while let Some(dir) = current {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                match Self::load(&config_path) {
                    Ok(config) => return config,
                    Err(e) => logging::warn!(
                        path = %config_path.display(),
                        error = %e,
                        "ignoring unusable config file"
                    ),
                }
            }

            current = dir.parent().map(|p| p.to_path_buf());
        }

        Self::default()
    }

    /// Generate default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate config"))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
