mod loader;

pub use loader::{ENV_PREFIX, get_default_config, load_configuration, write_config_to};

use serde::{Deserialize, Serialize};

use crate::scan::ScannerConfig;

pub const DEFAULT_DATABASE_FILE: &str = "data/blockscan.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_file: String,
    pub scanner: ScannerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_file: DEFAULT_DATABASE_FILE.to_string(),
            scanner: ScannerConfig::default(),
        }
    }
}
