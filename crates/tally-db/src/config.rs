//! # Ledger Configuration
//!
//! Database location, paging, and the tenancy whose payments config the
//! ledger reads.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_DATABASE_PATH=/var/lib/tally/ledger.db                       │
//! │     TALLY_PAGE_SIZE=500                                                │
//! │     TALLY_TENANCY_ID=prod                                              │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/ledger/ledger.toml (Linux)                               │
//! │     ~/Library/Application Support/com.tally.ledger/ledger.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     in-memory database, page_size 200, empty payments config           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/tally/ledger.db"
//! max_connections = 5
//!
//! [ledger]
//! page_size = 200
//! default_customer_type = "user"
//!
//! [tenancy]
//! id = "prod"
//! project_id = "acme"
//!
//! [tenancy.payments.product_lines.plans]
//! display_name = "Plans"
//!
//! [tenancy.payments.products.pro]
//! customer_type = "user"
//! product_line_id = "plans"
//! prices = { monthly = { USD = "9.99", interval = [1, "month"] } }
//! included_items = { credits = { quantity = 100, repeat = [1, "month"], expires = "when-repeated" } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tally_core::{CustomerType, PaymentsConfig, Tenancy, TenancyConfig, DEFAULT_PAGE_SIZE};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::pool::DbConfig;

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file; absent means an in-memory database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: None,
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseSettings {
    /// Pool configuration for these settings.
    pub fn db_config(&self) -> DbConfig {
        match &self.path {
            Some(path) => DbConfig::new(path).max_connections(self.max_connections),
            None => DbConfig::in_memory(),
        }
    }
}

// =============================================================================
// Ledger Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// Rows fetched per page when draining a source.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Customer type assumed by tools that take a bare customer id.
    #[serde(default = "default_customer_type")]
    pub default_customer_type: CustomerType,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_customer_type() -> CustomerType {
    CustomerType::User
}

impl Default for LedgerSettings {
    fn default() -> Self {
        LedgerSettings {
            page_size: default_page_size(),
            default_customer_type: default_customer_type(),
        }
    }
}

// =============================================================================
// Tenancy Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancySettings {
    pub id: String,

    #[serde(default)]
    pub project_id: String,

    #[serde(default)]
    pub payments: PaymentsConfig,
}

impl Default for TenancySettings {
    fn default() -> Self {
        TenancySettings {
            id: "default".to_string(),
            project_id: "default".to_string(),
            payments: PaymentsConfig::default(),
        }
    }
}

// =============================================================================
// Main Ledger Configuration
// =============================================================================

/// Complete ledger configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub tenancy: TenancySettings,
}

impl LedgerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (ledger.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading ledger config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load ledger config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> ConfigResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or(ConfigError::NoConfigPath)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Ledger config saved");
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.ledger.page_size == 0 {
            return Err(ConfigError::Invalid(
                "page_size must be greater than 0".into(),
            ));
        }

        if self.tenancy.id.is_empty() {
            return Err(ConfigError::Invalid("tenancy id must not be empty".into()));
        }

        let payments = &self.tenancy.payments;
        for (product_id, product) in &payments.products {
            if let Some(line_id) = &product.product_line_id {
                if !payments.product_lines.contains_key(line_id) {
                    return Err(ConfigError::Invalid(format!(
                        "Product '{}' references unknown product line '{}'",
                        product_id, line_id
                    )));
                }
            }
            for base_id in &product.is_add_on_to {
                if !payments.products.contains_key(base_id) {
                    return Err(ConfigError::Invalid(format!(
                        "Add-on '{}' requires unknown product '{}'",
                        product_id, base_id
                    )));
                }
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TALLY_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }

        if let Ok(size) = std::env::var("TALLY_PAGE_SIZE") {
            match size.parse::<usize>() {
                Ok(size) => self.ledger.page_size = size,
                Err(_) => warn!(value = %size, "Ignoring non-numeric TALLY_PAGE_SIZE"),
            }
        }

        if let Ok(id) = std::env::var("TALLY_TENANCY_ID") {
            debug!(tenancy_id = %id, "Overriding tenancy id from environment");
            self.tenancy.id = id;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "ledger")
            .map(|dirs| dirs.config_dir().join("ledger.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// The configured tenancy as the ledger sees it.
    pub fn tenancy(&self) -> Tenancy {
        Tenancy {
            id: self.tenancy.id.clone(),
            project_id: self.tenancy.project_id.clone(),
            config: TenancyConfig {
                payments: self.tenancy.payments.clone(),
            },
        }
    }

    pub fn page_size(&self) -> usize {
        self.ledger.page_size
    }
}
