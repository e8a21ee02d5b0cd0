// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Startup calibration table
//!
//! A JSON array of per-tag scaling overrides:
//!
//! ```json
//! [{"tag": "Pressure 1", "raw_min": 4609, "raw_max": 23960,
//!   "scaled_min": 972, "scaled_max": 5040, "full_scale": 1500}]
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::ControllerContext;
use crate::devices::{ScaleRange, Scaling};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    pub tag: String,
    pub raw_min: f64,
    pub raw_max: f64,
    pub scaled_min: f64,
    pub scaled_max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_scale: Option<f64>,
}

impl CalibrationEntry {
    pub fn scaling(&self) -> Scaling {
        Scaling::new(
            ScaleRange::new(self.raw_min, self.raw_max),
            ScaleRange::new(self.scaled_min, self.scaled_max),
            self.full_scale,
        )
    }
}

pub fn load_calibration<P: AsRef<Path>>(path: P) -> Result<Vec<CalibrationEntry>> {
    let path = path.as_ref();
    debug!("Loading calibration from {:?}", path);
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read calibration file at {:?}", path))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Invalid calibration table in {}", path.display()))
}

impl ControllerContext {
    /// Override the scaling of every matching device; returns how many changed
    pub fn apply_calibration(&self, entries: &[CalibrationEntry]) -> usize {
        let mut applied = 0;
        for entry in entries {
            let Ok(device) = self.device(&entry.tag) else {
                warn!("Calibration entry for unknown device '{}'", entry.tag);
                continue;
            };
            let scaling = entry.scaling();
            if !scaling.is_valid() {
                warn!("Ignoring degenerate calibration for '{}'", entry.tag);
                continue;
            }
            device.set_scaling(scaling);
            applied += 1;
        }
        info!("Calibration applied to {} device(s)", applied);
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutinesConfig;
    use crate::devices::{AnalogEncoding, Device, DeviceKind};
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_load_and_apply() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"tag": "Pressure 1", "raw_min": 0, "raw_max": 1000, "scaled_min": 0, "scaled_max": 10, "full_scale": 8}},
                {{"tag": "Missing", "raw_min": 0, "raw_max": 1, "scaled_min": 0, "scaled_max": 1}},
                {{"tag": "Thermocouple", "raw_min": 5, "raw_max": 5, "scaled_min": 0, "scaled_max": 1}}
            ]"#
        )
        .unwrap();
        let entries = load_calibration(file.path()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].full_scale, None);

        let analog = |tag: &str| {
            Arc::new(Device::new(
                tag,
                0,
                DeviceKind::AnalogIn(AnalogEncoding::Status),
                Scaling::default(),
            ))
        };
        let context = ControllerContext::new(
            vec![analog("Pressure 1"), analog("Thermocouple")],
            "E-stop",
            RoutinesConfig::default(),
        )
        .unwrap();
        assert_eq!(context.apply_calibration(&entries), 1);

        let pressure = context.device("Pressure 1").unwrap();
        pressure.set_raw(500.0);
        assert!((pressure.val() - 5.0).abs() < 1e-9);
        assert_eq!(pressure.full_scale(), 8.0);
        assert_eq!(
            context.device("Thermocouple").unwrap().scaling(),
            Scaling::default()
        );
    }

    #[test]
    fn test_malformed_table_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tag": "Pressure 1"}}"#).unwrap();
        assert!(load_calibration(file.path()).is_err());
    }
}
