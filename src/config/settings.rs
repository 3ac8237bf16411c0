use clap::ArgMatches;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::modbus::protocol::{RegisterType, BANK_SIZE, MAX_ADU_LEN};
use crate::storage::DataStore;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Identification
    pub server_name: String,

    // Connection settings
    pub listen_address: String,
    pub read_buffer_size: usize,
    pub max_connections: usize,         // 0 = unlimited
    pub shutdown_timeout_ms: u64,
    pub fragment_timeout_ms: u64,       // wait for the rest of a split ADU

    // Logging
    pub log_level: String,

    // Initial bank contents
    pub presets: Vec<RegisterPreset>,
}

/// A block of values loaded into one bank at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPreset {
    pub register_type: RegisterType,
    pub address: u16,
    pub values: Vec<u16>,
    #[serde(default)]
    pub description: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: "Modbus TCP Server".to_string(),
            listen_address: "0.0.0.0:502".to_string(),
            read_buffer_size: 512,
            max_connections: 0,
            shutdown_timeout_ms: 5000,
            fragment_timeout_ms: 20,
            log_level: "info".to_string(),
            presets: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ModbusError::ConfigError(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override settings with command line arguments.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), ModbusError> {
        if let Some(listen) = matches.get_one::<String>("listen") {
            self.listen_address = listen.clone();
        }
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.log_level = level.clone();
        }
        if let Some(max) = matches.get_one::<String>("max-connections") {
            self.max_connections = max.parse().map_err(|e| {
                ModbusError::ConfigError(format!("Invalid max-connections '{}': {}", max, e))
            })?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.listen_address.trim().is_empty() {
            return Err(ModbusError::ConfigError("listen_address is empty".to_string()));
        }

        if self.read_buffer_size < MAX_ADU_LEN {
            return Err(ModbusError::ConfigError(format!(
                "read_buffer_size {} is smaller than the largest ADU ({} bytes)",
                self.read_buffer_size, MAX_ADU_LEN
            )));
        }

        if self.fragment_timeout_ms == 0 {
            return Err(ModbusError::ConfigError(
                "fragment_timeout_ms must be at least 1".to_string(),
            ));
        }

        LevelFilter::from_str(&self.log_level).map_err(|_| {
            ModbusError::ConfigError(format!("Unknown log level '{}'", self.log_level))
        })?;

        for preset in &self.presets {
            if usize::from(preset.address) + preset.values.len() > BANK_SIZE {
                return Err(ModbusError::ConfigError(format!(
                    "Preset '{}' ({} {} values at {}) overflows the bank",
                    preset.description,
                    preset.values.len(),
                    preset.register_type,
                    preset.address
                )));
            }
        }

        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_millis(self.fragment_timeout_ms)
    }

    /// Write every preset into the store.
    pub fn apply_presets(&self, store: &DataStore) -> Result<(), ModbusError> {
        for preset in &self.presets {
            store.load_preset(preset.register_type, preset.address, &preset.values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_presets() {
        let config: Config = toml::from_str(
            r#"
            listen_address = "127.0.0.1:1502"

            [[presets]]
            register_type = "input"
            address = 0
            values = [1234, 5678]
            description = "measurements"

            [[presets]]
            register_type = "coil"
            address = 10
            values = [1, 0, 1]
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_address, "127.0.0.1:1502");
        assert_eq!(config.read_buffer_size, 512);
        assert_eq!(config.fragment_timeout(), Duration::from_millis(20));
        assert_eq!(config.presets.len(), 2);
        assert_eq!(config.presets[1].register_type, RegisterType::Coil);

        let store = DataStore::new();
        config.apply_presets(&store).unwrap();
        assert_eq!(store.input_register(1).unwrap(), 5678);
        assert!(store.coil(12).unwrap());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("mbserver.toml");

        let mut config = Config::default();
        config.max_connections = 8;
        config.presets.push(RegisterPreset {
            register_type: RegisterType::Holding,
            address: 100,
            values: vec![10, 20, 30],
            description: "setpoints".to_string(),
        });
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.max_connections, 8);
        assert_eq!(loaded.presets, config.presets);
    }

    #[test]
    fn test_rejects_bad_settings() {
        let mut config = Config::default();
        config.read_buffer_size = 64;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.fragment_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.presets.push(RegisterPreset {
            register_type: RegisterType::Input,
            address: 65535,
            values: vec![1, 2],
            description: String::new(),
        });
        assert!(config.validate().is_err());
    }
}
