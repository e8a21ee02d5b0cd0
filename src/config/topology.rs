// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Rig topology: which adapters exist and which devices each one owns
//!
//! ```yaml
//! adapters:
//!   - name: coupler
//!     kind: coupler
//!     host: 192.168.100.20
//!     devices:
//!       - tag: Valve 1
//!         type: digital_out
//!         address: 0
//!       - tag: Flow meter 1
//!         type: analog_in_status
//!         address: 4
//!         scale_to: [0.0, 100.0]
//!   - name: software
//!     kind: software
//!     devices:
//!       - tag: PID demo.CV
//!         type: pid
//!         pv: PID demo.PV
//!         sp: PID demo.SP
//!         p: 1.0
//!         t_i: 1.0
//! ```

use serde::{Deserialize, Serialize};

use crate::devices::{
    now_secs, AnalogEncoding, Computation, Device, DeviceKind, Link, PidController, ScaleRange,
    Scaling,
};

/// Protocol spoken by an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Simulation,
    Software,
    Coupler,
    TransducerArray,
    FlowController,
}

impl AdapterKind {
    /// Adapter talks to real hardware over the network
    pub fn is_hardware(self) -> bool {
        matches!(
            self,
            AdapterKind::Coupler | AdapterKind::TransducerArray | AdapterKind::FlowController
        )
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            AdapterKind::Coupler | AdapterKind::FlowController => Some(502),
            AdapterKind::TransducerArray => Some(9000),
            AdapterKind::Simulation | AdapterKind::Software => None,
        }
    }
}

/// One adapter of the topology
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    pub name: String,
    pub kind: AdapterKind,

    /// `host` or `host:port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Modbus unit identifier
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_unit_id() -> u8 {
    1
}

impl AdapterConfig {
    pub fn new(name: &str, kind: AdapterKind, host: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            host: host.map(str::to_string),
            unit_id: default_unit_id(),
            devices: Vec::new(),
        }
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    /// `host:port` to connect to, with the kind's default port when omitted
    pub fn endpoint(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        if host.contains(':') {
            return Some(host.to_string());
        }
        self.kind.default_port().map(|port| format!("{host}:{port}"))
    }
}

/// One device of the topology
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub tag: String,

    #[serde(default)]
    pub address: u16,

    #[serde(flatten)]
    pub point: PointConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_from: Option<ScaleRange>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_to: Option<ScaleRange>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_scale: Option<f64>,

    /// Rolling log window in seconds, `0` disables logging
    #[serde(default, skip_serializing_if = "is_zero")]
    pub log_window: f64,
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

/// Point type and the parameters specific to it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PointConfig {
    DigitalIn,
    DigitalOut,
    AnalogIn,
    AnalogInStatus,
    AnalogInFloat,
    AnalogInRaw,
    AnalogOut,
    AnalogOutStatus,
    AnalogOutFloat,
    Input,
    PassThrough {
        input: String,
        output: String,
    },
    Gain {
        input: String,
        #[serde(default = "unity")]
        gain: f64,
        #[serde(default)]
        noise_amplitude: f64,
    },
    Ramp {
        input: String,
        rate: f64,
    },
    Lag {
        input: String,
        time_constant: f64,
        #[serde(default = "unity")]
        gain: f64,
        #[serde(default)]
        noise_amplitude: f64,
    },
    Pid {
        pv: String,
        sp: String,
        p: f64,
        t_i: f64,
        #[serde(default)]
        t_d: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_cv: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_cv: Option<f64>,
    },
}

fn unity() -> f64 {
    1.0
}

impl PointConfig {
    pub fn kind(&self) -> DeviceKind {
        use AnalogEncoding::*;
        match self {
            PointConfig::DigitalIn => DeviceKind::DigitalIn,
            PointConfig::DigitalOut => DeviceKind::DigitalOut,
            PointConfig::AnalogIn => DeviceKind::AnalogIn(Plain),
            PointConfig::AnalogInStatus => DeviceKind::AnalogIn(Status),
            PointConfig::AnalogInFloat => DeviceKind::AnalogIn(Float),
            PointConfig::AnalogInRaw => DeviceKind::AnalogIn(Raw),
            PointConfig::AnalogOut => DeviceKind::AnalogOut(Plain),
            PointConfig::AnalogOutStatus => DeviceKind::AnalogOut(Status),
            PointConfig::AnalogOutFloat => DeviceKind::AnalogOut(Float),
            _ => DeviceKind::Software,
        }
    }

    /// Tags of the points a software entry refers to
    pub fn links(&self) -> Vec<&str> {
        match self {
            PointConfig::PassThrough { input, output } => vec![input, output],
            PointConfig::Gain { input, .. }
            | PointConfig::Ramp { input, .. }
            | PointConfig::Lag { input, .. } => vec![input],
            PointConfig::Pid { pv, sp, .. } => vec![pv, sp],
            _ => Vec::new(),
        }
    }

    fn computation(&self) -> Option<Computation> {
        let computation = match self {
            PointConfig::Input => Computation::Input,
            PointConfig::PassThrough { input, output } => Computation::PassThrough {
                input: Link::new(input),
                output: Link::new(output),
            },
            PointConfig::Gain {
                input,
                gain,
                noise_amplitude,
            } => Computation::gain(Link::new(input), *gain, *noise_amplitude),
            PointConfig::Ramp { input, rate } => Computation::ramp(Link::new(input), *rate),
            PointConfig::Lag {
                input,
                time_constant,
                gain,
                noise_amplitude,
            } => Computation::lag(Link::new(input), *time_constant, *gain, *noise_amplitude),
            PointConfig::Pid {
                pv,
                sp,
                p,
                t_i,
                t_d,
                min_cv,
                max_cv,
            } => Computation::pid(
                Link::new(pv),
                Link::new(sp),
                PidController::new(*p, *t_i, *t_d, *min_cv, *max_cv).with_time_base(now_secs()),
            ),
            _ => return None,
        };
        Some(computation)
    }
}

impl DeviceConfig {
    pub fn new(tag: &str, address: u16, point: PointConfig) -> Self {
        Self {
            tag: tag.to_string(),
            address,
            point,
            scale_from: None,
            scale_to: None,
            full_scale: None,
            log_window: 0.0,
        }
    }

    pub fn scale_from(mut self, lo: f64, hi: f64) -> Self {
        self.scale_from = Some(ScaleRange::new(lo, hi));
        self
    }

    pub fn scale_to(mut self, lo: f64, hi: f64) -> Self {
        self.scale_to = Some(ScaleRange::new(lo, hi));
        self
    }

    pub fn full_scale(mut self, full_scale: f64) -> Self {
        self.full_scale = Some(full_scale);
        self
    }

    pub fn kind(&self) -> DeviceKind {
        self.point.kind()
    }

    /// Scaling law, filling in the 15-bit / 4-20 mA defaults
    pub fn scaling(&self) -> Scaling {
        Scaling::new(
            self.scale_from.unwrap_or(Scaling::DEFAULT_FROM),
            self.scale_to.unwrap_or(Scaling::DEFAULT_TO),
            self.full_scale,
        )
    }

    /// Scaling is applied when reading or writing this point
    pub fn is_scaled(&self) -> bool {
        matches!(
            self.kind(),
            DeviceKind::AnalogIn(
                AnalogEncoding::Plain | AnalogEncoding::Status | AnalogEncoding::Float
            ) | DeviceKind::AnalogOut(
                AnalogEncoding::Plain | AnalogEncoding::Status | AnalogEncoding::Float
            )
        )
    }

    /// Build the device; software links are left unbound
    pub fn build(&self) -> Device {
        let device = match self.point.computation() {
            Some(computation) => {
                Device::software(&self.tag, computation, self.full_scale.unwrap_or(1.0))
            }
            None => Device::new(&self.tag, self.address, self.kind(), self.scaling()),
        };
        device.with_log_window(self.log_window)
    }
}

/// Default rig wiring: coupler, transducer array, three pressure controllers
/// and a small software PID loop
pub fn default_topology() -> Vec<AdapterConfig> {
    use PointConfig::*;

    let mut coupler = AdapterConfig::new("coupler", AdapterKind::Coupler, Some("192.168.100.20"));
    for i in 0..5u16 {
        coupler = coupler.with_device(DeviceConfig::new(&format!("Valve {}", i + 1), i, DigitalOut));
    }
    coupler = coupler
        .with_device(DeviceConfig::new("E-stop", 0, DigitalIn))
        .with_device(DeviceConfig::new("Pressure 1", 0, AnalogInStatus).scale_to(0.0, 1.2))
        .with_device(
            DeviceConfig::new("Pressure 2", 2, AnalogInStatus)
                .scale_from(4609.0, 23960.0)
                .scale_to(972.0, 5040.0),
        );
    for (i, hi) in [100.0, 1000.0, 10000.0].into_iter().enumerate() {
        coupler = coupler.with_device(
            DeviceConfig::new(&format!("Flow meter {}", i + 1), 4 + 2 * i as u16, AnalogInStatus)
                .scale_to(0.0, hi)
                .full_scale(hi),
        );
    }
    let flow_controllers = [
        (24686.0, 24576.0, 27.18, 35.9745),
        (30207.0, 30000.0, 2.6666, 2.8004),
        (32703.0, 32600.0, 1.0991, 1.0771),
    ];
    for (i, (pv_raw, sp_raw, hi, full_scale)) in flow_controllers.into_iter().enumerate() {
        let n = i + 1;
        coupler = coupler
            .with_device(
                DeviceConfig::new(&format!("Flow controller {n}.PV"), 10 + 2 * i as u16, AnalogInStatus)
                    .scale_from(0.0, pv_raw)
                    .scale_to(0.0, hi)
                    .full_scale(full_scale),
            )
            .with_device(
                DeviceConfig::new(&format!("Flow controller {n}.SP"), 2080 + 2 * i as u16, AnalogOutStatus)
                    .scale_from(0.0, sp_raw)
                    .scale_to(0.0, hi),
            );
    }
    coupler = coupler.with_device(
        DeviceConfig::new("Thermocouple", 40, AnalogInStatus)
            .scale_from(0.0, 10.0)
            .scale_to(0.0, 1.0)
            .full_scale(100.0),
    );

    let mut array = AdapterConfig::new(
        "transducer_array",
        AdapterKind::TransducerArray,
        Some("192.168.100.30"),
    );
    for i in 0..5u16 {
        array = array.with_device(
            DeviceConfig::new(&format!("Transducer {}", i + 1), i, AnalogIn)
                .scale_from(-1.25, 1000.5)
                .scale_to(0.0, 1001.0)
                .full_scale(1034.21),
        );
    }

    let mut adapters = vec![coupler, array];
    for (i, range) in [4.98, 69.0, 345.0].into_iter().enumerate() {
        let n = i + 1;
        adapters.push(
            AdapterConfig::new(
                &format!("pressure_controller_{n}"),
                AdapterKind::FlowController,
                Some(&format!("192.168.100.{}", 40 + i)),
            )
            .with_device(
                DeviceConfig::new(&format!("Pressure controller {n}.PV"), 1202, AnalogInFloat)
                    .scale_from(0.0, range)
                    .scale_to(0.0, range),
            )
            .with_device(
                DeviceConfig::new(&format!("Pressure controller {n}.SP"), 1009, AnalogOutFloat)
                    .scale_from(0.0, range)
                    .scale_to(0.0, range),
            ),
        );
    }

    adapters.push(
        AdapterConfig::new("software", AdapterKind::Software, None)
            .with_device(DeviceConfig::new("PID demo.SP", 0, Input).full_scale(100.0))
            .with_device(
                DeviceConfig::new(
                    "PID demo.PV",
                    0,
                    Lag {
                        input: "PID demo.CV".to_string(),
                        time_constant: 5.0,
                        gain: 1.0,
                        noise_amplitude: 0.0,
                    },
                )
                .full_scale(100.0),
            )
            .with_device(
                DeviceConfig::new(
                    "PID demo.CV",
                    0,
                    Pid {
                        pv: "PID demo.PV".to_string(),
                        sp: "PID demo.SP".to_string(),
                        p: 1.0,
                        t_i: 1.0,
                        t_d: 0.0,
                        min_cv: Some(0.0),
                        max_cv: Some(100.0),
                    },
                )
                .full_scale(100.0),
            )
            .with_device(
                DeviceConfig::new(
                    "Ramp demo",
                    0,
                    Ramp {
                        input: "PID demo.SP".to_string(),
                        rate: 1.0,
                    },
                )
                .full_scale(100.0),
            ),
    );
    adapters
}
