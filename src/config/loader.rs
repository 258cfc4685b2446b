use std::{fs, fs::File, io::Write, path::Path};

use anyhow::{Context, Result};
use config::{Config, Environment};
use log::{info, trace};

use crate::config::AppConfig;

pub const ENV_PREFIX: &str = "BLOCKSCAN";

pub fn get_default_config() -> &'static str {
    include_str!("../../config/config.toml")
}

/// Loads the configuration at `path`, creating it from the embedded default if
/// it does not exist yet.
///
/// Environment variables override file values, e.g.
/// `BLOCKSCAN_SCANNER__SCAN_PERIOD_SECS=10`.
pub fn load_configuration(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let sources = get_default_config();
        write_config_to(path, sources).context("Could not create default config")?;
        info!(path:% = path.display(); "Created new configuration file");
    }

    let filename = path.to_str().context("Invalid config file path")?;

    let cfg = Config::builder()
        .add_source(config::File::with_name(filename))
        .add_source(Environment::with_prefix(ENV_PREFIX).prefix_separator("_").separator("__"))
        .build()
        .context("Could not build config")?;

    let app_config: AppConfig = cfg.try_deserialize().context("Invalid configuration")?;
    trace!("Loaded configuration: {:?}", app_config);
    Ok(app_config)
}

pub fn write_config_to(path: &Path, source: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create parent directories")?;
    };

    let mut file = File::create(path).context("Failed to create config file")?;
    file.write_all(source.as_bytes())
        .context("Failed to write config content")?;
    file.write_all(b"\n").context("Failed to write newline")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_written_and_loaded() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = load_configuration(&path).unwrap();

        assert!(path.exists());
        assert_eq!(config.database_file, "data/blockscan.db");
        assert_eq!(config.scanner.symbol, "BTC");
        assert_eq!(config.scanner.block_cache_size, 1000);
        assert!(config.scanner.rescan_failed_records);
    }

    #[test]
    fn test_missing_keys_fall_back_to_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("partial.toml");
        write_config_to(&path, "[scanner]\nsymbol = \"LTC\"\nextract_workers = 2").unwrap();

        let config = load_configuration(&path).unwrap();

        assert_eq!(config.scanner.symbol, "LTC");
        assert_eq!(config.scanner.extract_workers, 2);
        assert_eq!(config.scanner.scan_period_secs, 5);
        assert_eq!(config.database_file, AppConfig::default().database_file);
    }
}
