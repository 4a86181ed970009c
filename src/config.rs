// src/config.rs - host configuration loaded from TOML
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub machine: MachineConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub jog: JogConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default = "default_machine_name")]
    pub name: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            name: default_machine_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            port: default_port(),
            baud_rate: default_baud_rate(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JogConfig {
    /// Z pull-up put back on the controller after each jog, in machine units.
    #[serde(default)]
    pub z_lift: f64,
}

fn default_machine_name() -> String {
    "tool".to_string()
}

fn default_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud_rate() -> u32 {
    115200
}
