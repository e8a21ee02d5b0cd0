// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Routine engine configuration and leak-check tuning

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Routine engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutinesConfig {
    /// Polling increment of `delay` and `wait_for`, in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Supervised pause after a warning message, in seconds
    #[serde(default = "default_warning_hold")]
    pub warning_hold: f64,

    #[serde(default)]
    pub leak_check: LeakCheckConfig,
}

fn default_tick_ms() -> u64 {
    100
}

fn default_warning_hold() -> f64 {
    5.0
}

impl Default for RoutinesConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            warning_hold: default_warning_hold(),
            leak_check: LeakCheckConfig::default(),
        }
    }
}

impl RoutinesConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Leak-check timing and thresholds, all durations in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeakCheckConfig {
    /// Time allowed for the pressure to reach its setpoint
    pub pressure_delay: f64,
    /// Relative pressure error accepted as "at setpoint"
    pub pressure_error_threshold: f64,
    /// Time allowed for the flow meter to report a healthy, non-zero value
    pub health_timeout: f64,
    /// Time allowed for the flow gradient to settle
    pub flow_delay: f64,
    /// Log window while watching the gradient
    pub gradient_window: f64,
    /// Log window, and averaging time, while recording results
    pub record_window: f64,
    /// Largest flow gradient considered stable
    pub gradient_threshold: f64,
    /// Settle time after zeroing the setpoint during reset
    pub reset_settle: f64,
    /// Pressure and flow delays used in debug mode
    pub debug_delay: f64,
    /// Time constant of the simulated pressure response in debug mode
    pub debug_pressure_lag: f64,
    /// Time constant of the simulated flow response in debug mode
    pub debug_flow_lag: f64,
    /// Tags of the rig points the check drives
    pub wiring: LeakCheckWiring,
}

impl Default for LeakCheckConfig {
    fn default() -> Self {
        Self {
            pressure_delay: 60.0,
            pressure_error_threshold: 0.02,
            health_timeout: 60.0,
            flow_delay: 120.0,
            gradient_window: 10.0,
            record_window: 20.0,
            gradient_threshold: 1.0,
            reset_settle: 5.0,
            debug_delay: 10.0,
            debug_pressure_lag: 2.0,
            debug_flow_lag: 1.5,
            wiring: LeakCheckWiring::default(),
        }
    }
}

/// Rig points used by the leak check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeakCheckWiring {
    pub valves: Vec<String>,
    pub vent_valve: String,
    pub flow_valve: String,
    pub pressure_valve: String,
    pub ambient_pressure: String,
    pub ambient_temperature: String,
    pub pressure_sp: String,
    pub pressure_pv: String,
    pub flow_meter: String,
    /// Every flow meter whose log window follows the check
    pub flow_meters: Vec<String>,
    /// Reference pressure shown on the plot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_pressure: Option<String>,
}

impl Default for LeakCheckWiring {
    fn default() -> Self {
        Self {
            valves: (1..=5).map(|i| format!("Valve {i}")).collect(),
            vent_valve: "Valve 5".to_string(),
            flow_valve: "Valve 1".to_string(),
            pressure_valve: "Valve 3".to_string(),
            ambient_pressure: "Pressure 1".to_string(),
            ambient_temperature: "Thermocouple".to_string(),
            pressure_sp: "Pressure controller 1.SP".to_string(),
            pressure_pv: "Pressure controller 1.PV".to_string(),
            flow_meter: "Flow meter 1".to_string(),
            flow_meters: (1..=3).map(|i| format!("Flow meter {i}")).collect(),
            reference_pressure: Some("Pressure controller 3.PV".to_string()),
        }
    }
}

impl LeakCheckWiring {
    /// Every tag the check needs, for validation
    pub fn required_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.valves.iter().map(String::as_str).collect();
        tags.extend([
            self.vent_valve.as_str(),
            self.flow_valve.as_str(),
            self.pressure_valve.as_str(),
            self.ambient_pressure.as_str(),
            self.ambient_temperature.as_str(),
            self.pressure_sp.as_str(),
            self.pressure_pv.as_str(),
            self.flow_meter.as_str(),
        ]);
        tags
    }
}
