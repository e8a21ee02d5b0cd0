// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Controller configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::AdapterSettings;

/// Controller settings
///
/// ```yaml
/// controller:
///   simulation: false
///   estop_tag: E-stop
///   connect_retry_ms: 1000
///   io_timeout_ms: 5000
///   calibration_file: calibration.json
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Replace every hardware adapter with a synthetic one
    #[serde(default)]
    pub simulation: bool,

    /// Digital input watched for emergency-stop edges
    #[serde(default = "default_estop_tag")]
    pub estop_tag: String,

    /// Pause between connection attempts, in milliseconds
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,

    /// Deadline for one request/response exchange, in milliseconds
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Calibration table applied at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_file: Option<PathBuf>,
}

fn default_estop_tag() -> String {
    "E-stop".to_string()
}

fn default_connect_retry_ms() -> u64 {
    1000
}

fn default_io_timeout_ms() -> u64 {
    5000
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            simulation: false,
            estop_tag: default_estop_tag(),
            connect_retry_ms: default_connect_retry_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            calibration_file: None,
        }
    }
}

impl ControllerConfig {
    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            connect_retry: Duration::from_millis(self.connect_retry_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }
}
