// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration management for the rig controller
//!
//! The configuration is a YAML file with three sections:
//! - `controller`: simulation switch, E-stop tag, transport timing, calibration file
//! - `routines`: routine engine tick and leak-check tuning
//! - `adapters`: the rig topology, one entry per adapter with its devices
//!
//! ## Usage
//!
//! ```no_run
//! use rust_rig_controller::config::Config;
//!
//! // Load config from file, creates a default if not found
//! let mut config = Config::from_file("config.yaml").unwrap();
//!
//! // Command line overrides
//! config.apply_args(true, None);
//!
//! println!("Adapters: {}", config.adapters.len());
//! ```

pub mod controller;
pub mod routines;
pub mod topology;
pub mod utils;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};

pub use controller::ControllerConfig;
pub use routines::{LeakCheckConfig, LeakCheckWiring, RoutinesConfig};
pub use topology::{default_topology, AdapterConfig, AdapterKind, DeviceConfig, PointConfig};
pub use utils::validate_specific_rules;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Controller behaviour and transport timing
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Routine engine settings
    #[serde(default)]
    pub routines: RoutinesConfig,

    /// Rig topology, in polling order
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            routines: RoutinesConfig::default(),
            adapters: default_topology(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    ///
    /// A missing file is created with the default rig topology.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(
                "Configuration file not found at {:?}, creating default",
                path
            );
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;

        let config = Self::from_yaml(&contents)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config =
            serde_yml::from_str(contents).context("Failed to parse YAML configuration")?;

        if let Err(err) = utils::validate_specific_rules(&config) {
            error!("Configuration specific validation error: {}", err);
            return Err(err);
        }
        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;

        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create config file at {:?}", path.as_ref()))?;

        file.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Apply command line arguments to override configuration values
    ///
    /// # Parameters
    ///
    /// * `simulation` - If true, forces simulation mode on
    /// * `calibration_file` - Optional calibration table replacing the configured one
    pub fn apply_args(&mut self, simulation: bool, calibration_file: Option<PathBuf>) {
        if simulation {
            debug!("Enabling simulation mode from command line");
            self.controller.simulation = true;
        }

        if let Some(file) = calibration_file {
            debug!("Overriding calibration file from command line: {:?}", file);
            self.controller.calibration_file = Some(file);
        }
    }

    /// Look up a device entry by tag across every adapter
    pub fn device(&self, tag: &str) -> Option<&DeviceConfig> {
        self.adapters
            .iter()
            .flat_map(|adapter| adapter.devices.iter())
            .find(|device| device.tag == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        validate_specific_rules(&config).unwrap();
        assert!(config.device("E-stop").is_some());
        assert!(config.device("Pressure controller 3.SP").is_some());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = Config::from_yaml("adapters: []\n").unwrap();
        assert_eq!(config.controller, ControllerConfig::default());
        assert_eq!(config.routines.tick_ms, 100);
        assert!(config.adapters.is_empty());
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.apply_args(false, None);
        assert!(!config.controller.simulation);
        config.apply_args(true, Some(PathBuf::from("cal.json")));
        assert!(config.controller.simulation);
        assert_eq!(
            config.controller.calibration_file,
            Some(PathBuf::from("cal.json"))
        );
    }
}
