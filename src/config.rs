//! Registry configuration.
//!
//! Loaded from TOML. Resolution order:
//! 1. explicit path (CLI `--config`)
//! 2. `$SANGHA_REGISTRY_CONFIG`
//! 3. built-in defaults
//!
//! ```toml
//! [database]
//! path = "registry.db"
//! busy_timeout_ms = 5000
//!
//! [allocator]
//! strategy = "scan"        # or "counter"
//! max_attempts = 10
//! backoff = "exponential"  # or "fixed"
//! base_delay_ms = 20
//! max_delay_ms = 500
//! jitter = true
//!
//! [codes.arama]
//! prefix = "ARN"
//! width = 7
//! ```

use crate::allocator::CodeFormat;
use crate::entities::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("registry.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

/// How the allocator learns the current high-water mark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// MAX over parsed code suffixes, retried on collision
    Scan,
    /// Dedicated per-prefix counter row, seeded from the scan
    Counter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub strategy: AllocationStrategy,
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            strategy: AllocationStrategy::Scan,
            max_attempts: 10,
            backoff: BackoffKind::Fixed,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFormatConfig {
    pub prefix: String,
    pub width: usize,
}

// ============================================================================
// ROOT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub database: DatabaseConfig,
    pub allocator: AllocatorConfig,

    /// Keyed by entity kind name (`arama`, `bhikku_id_card`, ...)
    pub codes: HashMap<String, CodeFormatConfig>,
}

impl RegistryConfig {
    pub const ENV_VAR: &'static str = "SANGHA_REGISTRY_CONFIG";

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        let config: RegistryConfig = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Explicit path, then the environment variable, then defaults
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match std::env::var_os(Self::ENV_VAR) {
            Some(path) if !path.is_empty() => Self::load(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allocator.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "allocator.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.allocator.max_delay_ms < self.allocator.base_delay_ms {
            return Err(ConfigError::InvalidValue(
                "allocator.max_delay_ms must not be below base_delay_ms".to_string(),
            ));
        }

        let mut seen_prefixes: HashMap<String, EntityKind> = HashMap::new();
        for kind in EntityKind::ALL {
            let format = self.code_format(kind);
            if let Some(other) = seen_prefixes.insert(format.prefix.clone(), kind) {
                return Err(ConfigError::InvalidValue(format!(
                    "prefix '{}' is used by both {} and {}",
                    format.prefix, other, kind
                )));
            }
        }

        for (name, format) in &self.codes {
            name.parse::<EntityKind>()
                .map_err(|e| ConfigError::InvalidValue(format!("codes.{}: {}", name, e)))?;

            if format.width == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "codes.{}.width must be at least 1",
                    name
                )));
            }

            if format.prefix.is_empty() || !format.prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::InvalidValue(format!(
                    "codes.{}.prefix must be non-empty ASCII letters/digits, got '{}'",
                    name, format.prefix
                )));
            }
        }

        Ok(())
    }

    /// Configured format for a kind, falling back to the built-in one
    pub fn code_format(&self, kind: EntityKind) -> CodeFormat {
        self.codes
            .iter()
            .find(|(name, _)| name.parse::<EntityKind>().ok() == Some(kind))
            .map(|(_, c)| CodeFormat::new(c.prefix.clone(), c.width))
            .unwrap_or_else(|| kind.default_format())
    }
}
