use std::collections::BTreeMap;
use std::path::Path;
use serde::{Deserialize, Serialize};

use crate::device::UsbId;
use crate::serial::options::DEFAULT_BAUD_RATE;
use crate::serial::{DEFAULT_DRIVER, DEFAULT_PORT_PATH};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Serial layer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialSettings {
    /// Path every discovered device is addressed by
    pub port_path: String,
    pub baud_rate: u32,
    /// Driver class sent with permission requests
    pub driver: String,
    /// Replaces the built-in whitelist when set
    pub known_devices: Option<Vec<UsbId>>,
    /// Merged over the built-in vendor names
    pub vendor_names: BTreeMap<u16, String>,
    pub hotplug_poll_ms: u64,
}

impl SerialSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let settings = Self::from_json_str(&contents)?;
        log::info!("Loaded serial settings from {}", path.as_ref().display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_path.is_empty() {
            return Err(ConfigError::Invalid("portPath must not be empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baudRate must be positive".to_string()));
        }
        if self.hotplug_poll_ms == 0 {
            return Err(ConfigError::Invalid("hotplugPollMs must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port_path: DEFAULT_PORT_PATH.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            driver: DEFAULT_DRIVER.to_string(),
            known_devices: None,
            vendor_names: BTreeMap::new(),
            hotplug_poll_ms: 500,
        }
    }
}
