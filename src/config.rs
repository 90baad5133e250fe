//! SmartBuffer Configuration
//!
//! Handles parsing and management of smartbuffer.toml configuration files.

use crate::platform::{Endianness, Platform, PlatformRegistry};
use crate::store::GrowthPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Name of the configuration file searched for by [`SmartBufferConfig::find_and_load`].
pub const CONFIG_FILE_NAME: &str = "smartbuffer.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("Invalid platform descriptor: {0}")]
    InvalidPlatform(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching smartbuffer.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SmartBufferConfig {
    /// Target platform selection and extra descriptors
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Buffer growth policy
    #[serde(default)]
    pub growth: GrowthPolicy,

    /// Link defaults
    #[serde(default)]
    pub link: LinkConfig,
}

impl SmartBufferConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: SmartBufferConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding config
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Built-in platforms plus every `[[platform.extra]]` entry.
    pub fn registry(&self) -> ConfigResult<PlatformRegistry> {
        let mut registry = PlatformRegistry::with_builtins();
        for extra in &self.platform.extra {
            let endianness = if extra.big_endian {
                Endianness::Big
            } else {
                Endianness::Little
            };
            let platform = Platform::new(extra.label.clone(), extra.pointer_width, endianness)
                .map_err(|e| ConfigError::InvalidPlatform(e.to_string()))?;
            registry
                .register(platform)
                .map_err(|e| ConfigError::InvalidPlatform(e.to_string()))?;
        }
        Ok(registry)
    }

    /// The descriptor named by `platform.default`.
    pub fn default_platform(&self) -> ConfigResult<Platform> {
        self.registry()?
            .get(&self.platform.default)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPlatform(self.platform.default.clone()))
    }
}

/// Platform selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformConfig {
    /// Label of the platform new buffers are created for
    #[serde(default = "default_platform_label")]
    pub default: String,

    /// Additional platform descriptors
    #[serde(default)]
    pub extra: Vec<PlatformDescriptor>,
}

fn default_platform_label() -> String {
    Platform::default().label().to_string()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            default: default_platform_label(),
            extra: Vec::new(),
        }
    }
}

/// A platform declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformDescriptor {
    pub label: String,
    pub pointer_width: u32,
    #[serde(default)]
    pub big_endian: bool,
}

/// Link defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    /// Address added to every pointer fixup
    #[serde(default)]
    pub load_base: u64,

    /// Placement alignment of buffers in the blob
    #[serde(default = "default_alignment")]
    pub alignment: u32,

    /// Keep fixups into unselected buffers instead of failing
    #[serde(default)]
    pub allow_external: bool,
}

fn default_alignment() -> u32 {
    1
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            load_base: 0,
            alignment: default_alignment(),
            allow_external: false,
        }
    }
}
