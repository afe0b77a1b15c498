//! Application settings and configuration

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::vendor::{Vendor, VendorError};

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Database configuration
    pub database: DatabaseSettings,
    /// Symbology configuration
    #[serde(default)]
    pub symbology: SymbologySettings,
    /// Consensus configuration
    #[serde(default)]
    pub consensus: ConsensusSettings,
    /// Vendor trust weights
    #[serde(default)]
    pub vendors: Vec<VendorSettings>,
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

/// Symbology settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbologySettings {
    /// Source name the authoritative reference feed registers under
    #[serde(default = "default_backbone_source")]
    pub backbone_source: String,
}

fn default_backbone_source() -> String {
    "csi".to_string()
}

impl Default for SymbologySettings {
    fn default() -> Self {
        Self {
            backbone_source: default_backbone_source(),
        }
    }
}

/// Consensus engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSettings {
    /// Relative tolerance for continuous price fields, as a decimal fraction
    #[serde(default = "default_tolerance")]
    pub tolerance: String,
    /// Default windowed-recompute span in days
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    /// Worker pool size for universe recomputes. Kept small by default; the
    /// store serializes writes under contention.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_tolerance() -> String {
    "0.001".to_string() // 0.1%
}

fn default_window_days() -> u32 {
    30
}

fn default_workers() -> usize {
    4
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            window_days: default_window_days(),
            workers: default_workers(),
        }
    }
}

/// One configured vendor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorSettings {
    /// Unique vendor name
    pub name: String,
    /// Trust weight in 0..=100
    pub weight: u32,
    /// Whether the vendor participates in consensus
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from configuration files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix("REFDATA")
    }

    /// Load settings with a custom environment variable prefix
    pub fn load_with_prefix(env_prefix: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config_dir = Self::config_dir();

        let s = Config::builder()
            // Start with default configuration
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            // Add environment-specific configuration
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            // Add local overrides (not checked into git)
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            // Add environment variables (e.g., REFDATA__DATABASE__URL)
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// Get the configuration directory path
    fn config_dir() -> String {
        std::env::var("REFDATA_CONFIG_DIR").unwrap_or_else(|_| "config".into())
    }

    /// Build the validated vendor table from configuration
    pub fn vendor_table(&self) -> Result<Vec<Vendor>, VendorError> {
        self.vendors
            .iter()
            .map(|v| {
                let vendor = Vendor::new(v.name.clone(), v.weight)?;
                Ok(if v.active { vendor } else { vendor.disabled() })
            })
            .collect()
    }

    /// Create default settings (useful for testing)
    pub fn default_settings() -> Self {
        Settings {
            database: DatabaseSettings {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/refdata".into()),
                max_connections: 10,
                min_connections: 2,
            },
            symbology: SymbologySettings::default(),
            consensus: ConsensusSettings::default(),
            vendors: vec![],
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::default_settings()
    }
}
