// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Device model
//!
//! A [`Device`] is one named I/O point of the rig: a digital input or output,
//! an analog input or output in one of several register encodings, or a
//! software point computed from other points.
//!
//! Devices are shared as `Arc<Device>` between the adapter that refreshes them,
//! the controller registry and running routines. Each device guards its own
//! state with a mutex, so a read never observes a half-applied update and no
//! lock is ever held across an await point.
//!
//! Register layouts are decoded here and nowhere else:
//!
//! | Encoding | Width | Read layout               | Write layout     |
//! |----------|-------|---------------------------|------------------|
//! | plain    | 1     | `[value]`                 | `[raw]`          |
//! | status   | 2     | `[status, value as i16]`  | `[0, raw]`       |
//! | float    | 2     | `[high word, low word]`   | `[high, low]`    |
//! | raw      | 1     | `[value]` (unscaled)      | `[raw]`          |

pub mod log;
pub mod pid;
pub mod scaling;
pub mod software;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;

pub use self::log::RollingLog;
pub use pid::PidController;
pub use scaling::{ScaleRange, Scaling};
pub use software::{Computation, Link};

use scaling::{decode_float, encode_float, to_register, wrap_i16};
use software::Inputs;

/// Healthy status word
pub const STATUS_OK: u16 = 0x00;
/// Analog input underrange (< 4 mA)
pub const STATUS_UNDERRANGE: u16 = 0x41;
/// Analog input overrange (> 20 mA) or open thermocouple
pub const STATUS_OVERRANGE: u16 = 0x42;

/// Device errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device '{tag}' expects {expected} register(s), got {got}")]
    ShortFrame {
        tag: String,
        expected: usize,
        got: usize,
    },
    #[error("Device '{tag}' is a software point and has no register image")]
    NoRegisterImage { tag: String },
}

/// Coarse classification used by adapters to group points into request spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    DigitalIn,
    DigitalOut,
    AnalogIn,
    AnalogOut,
    Software,
}

impl Category {
    pub const HARDWARE: [Category; 4] = [
        Category::DigitalIn,
        Category::DigitalOut,
        Category::AnalogIn,
        Category::AnalogOut,
    ];

    pub fn type_str(&self) -> &'static str {
        match self {
            Category::DigitalIn => "d-in",
            Category::DigitalOut => "d-out",
            Category::AnalogIn => "a-in",
            Category::AnalogOut => "a-out",
            Category::Software => "software",
        }
    }
}

/// Register encoding of an analog point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalogEncoding {
    /// One scaled word
    Plain,
    /// Status word followed by a signed scaled word
    Status,
    /// IEEE-754 single over two words
    Float,
    /// One unscaled word, or a value handed over already decoded
    Raw,
}

impl AnalogEncoding {
    pub fn width(self) -> u16 {
        match self {
            AnalogEncoding::Plain | AnalogEncoding::Raw => 1,
            AnalogEncoding::Status | AnalogEncoding::Float => 2,
        }
    }
}

/// What a point is and how its value is represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    DigitalIn,
    DigitalOut,
    AnalogIn(AnalogEncoding),
    AnalogOut(AnalogEncoding),
    Software,
}

impl DeviceKind {
    pub fn category(self) -> Category {
        match self {
            DeviceKind::DigitalIn => Category::DigitalIn,
            DeviceKind::DigitalOut => Category::DigitalOut,
            DeviceKind::AnalogIn(_) => Category::AnalogIn,
            DeviceKind::AnalogOut(_) => Category::AnalogOut,
            DeviceKind::Software => Category::Software,
        }
    }

    /// Number of consecutive addresses the point occupies
    pub fn width(self) -> u16 {
        match self {
            DeviceKind::AnalogIn(encoding) | DeviceKind::AnalogOut(encoding) => encoding.width(),
            _ => 1,
        }
    }

    /// Configuration name of the kind
    pub fn type_name(self) -> &'static str {
        use AnalogEncoding::*;
        match self {
            DeviceKind::DigitalIn => "digital_in",
            DeviceKind::DigitalOut => "digital_out",
            DeviceKind::AnalogIn(Plain) => "analog_in",
            DeviceKind::AnalogIn(Status) => "analog_in_status",
            DeviceKind::AnalogIn(Float) => "analog_in_float",
            DeviceKind::AnalogIn(Raw) => "analog_in_raw",
            DeviceKind::AnalogOut(Plain) => "analog_out",
            DeviceKind::AnalogOut(Status) => "analog_out_status",
            DeviceKind::AnalogOut(Float) => "analog_out_float",
            DeviceKind::AnalogOut(Raw) => "analog_out_raw",
            DeviceKind::Software => "software",
        }
    }
}

/// Range flag reported in place of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RangeFlag {
    Under,
    Over,
}

/// A point value, or the range flag that replaces it when the status word says so
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusValue {
    Value(f64),
    Flag(RangeFlag),
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Value(v) => write!(f, "{v}"),
            StatusValue::Flag(RangeFlag::Under) => f.write_str("UNDER"),
            StatusValue::Flag(RangeFlag::Over) => f.write_str("OVER"),
        }
    }
}

impl From<StatusValue> for serde_json::Value {
    fn from(value: StatusValue) -> Self {
        match value {
            StatusValue::Value(v) => serde_json::Value::from(v),
            StatusValue::Flag(_) => serde_json::Value::from(value.to_string()),
        }
    }
}

/// Current wall-clock time in fractional seconds since the Unix epoch
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

#[derive(Debug)]
struct DeviceState {
    scaling: Scaling,
    status: u16,
    raw: f64,
    words: [u16; 2],
    value: f64,
    log: RollingLog,
    saved_window: Option<f64>,
    computation: Option<Computation>,
}

impl DeviceState {
    fn val(&self, kind: DeviceKind) -> f64 {
        use AnalogEncoding::*;
        match kind {
            DeviceKind::DigitalIn | DeviceKind::DigitalOut => self.raw,
            DeviceKind::AnalogIn(Plain | Status) | DeviceKind::AnalogOut(Plain | Status) => {
                self.scaling.scale(self.raw)
            }
            DeviceKind::AnalogIn(Raw) | DeviceKind::AnalogOut(Raw) => self.raw,
            DeviceKind::AnalogIn(Float) | DeviceKind::AnalogOut(Float) => {
                self.scaling.scale(decode_float(self.words) as f64)
            }
            DeviceKind::Software => self.value,
        }
    }

    fn raw(&self, kind: DeviceKind) -> f64 {
        match kind {
            DeviceKind::AnalogIn(AnalogEncoding::Float)
            | DeviceKind::AnalogOut(AnalogEncoding::Float) => self.val(kind),
            _ => self.raw,
        }
    }

    fn store_raw(&mut self, kind: DeviceKind, raw: f64) {
        match kind {
            DeviceKind::AnalogIn(AnalogEncoding::Status) => self.raw = wrap_i16(raw),
            DeviceKind::AnalogIn(AnalogEncoding::Float)
            | DeviceKind::AnalogOut(AnalogEncoding::Float) => {}
            DeviceKind::DigitalOut => self.raw = raw.trunc(),
            _ => self.raw = raw,
        }
    }

    fn store_val(&mut self, kind: DeviceKind, val: f64) {
        use AnalogEncoding::*;
        match kind {
            DeviceKind::DigitalIn | DeviceKind::AnalogIn(Raw) | DeviceKind::AnalogOut(Raw) => {
                self.raw = val
            }
            DeviceKind::DigitalOut => self.raw = val.trunc(),
            DeviceKind::AnalogIn(Plain | Status) => self.raw = self.scaling.unscale(val),
            DeviceKind::AnalogOut(Plain | Status) => self.raw = self.scaling.unscale(val).trunc(),
            DeviceKind::AnalogIn(Float) | DeviceKind::AnalogOut(Float) => {
                self.words = encode_float(self.scaling.unscale(val) as f32)
            }
            DeviceKind::Software => self.value = val,
        }
    }

    fn record(&mut self, kind: DeviceKind, now: f64) {
        if self.log.is_enabled() {
            let v = self.val(kind);
            self.log.push(now, v);
        }
    }
}

/// One named I/O point
#[derive(Debug)]
pub struct Device {
    tag: String,
    address: u16,
    kind: DeviceKind,
    state: Mutex<DeviceState>,
}

impl Device {
    pub fn new(tag: impl Into<String>, address: u16, kind: DeviceKind, scaling: Scaling) -> Self {
        Self {
            tag: tag.into(),
            address,
            kind,
            state: Mutex::new(DeviceState {
                scaling,
                status: STATUS_OK,
                raw: 0.0,
                words: [0, 0],
                value: 0.0,
                log: RollingLog::default(),
                saved_window: None,
                computation: None,
            }),
        }
    }

    /// Software point with the given computation, scaled `0..full_scale`
    pub fn software(tag: impl Into<String>, computation: Computation, full_scale: f64) -> Self {
        let device = Self::new(
            tag,
            0,
            DeviceKind::Software,
            Scaling::identity(0.0, full_scale),
        );
        device.state().computation = Some(computation);
        device
    }

    pub fn with_log_window(self, window: f64) -> Self {
        self.set_log_window(window);
        self
    }

    /// Fresh copy with the same tag, address, kind, scaling and log window
    ///
    /// Used to stand simulated points in for hardware ones.
    pub fn simulated_copy(&self) -> Self {
        let (scaling, window) = {
            let state = self.state();
            (state.scaling, state.log.window())
        };
        Self::new(self.tag.clone(), self.address, self.kind, scaling).with_log_window(window)
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn category(&self) -> Category {
        self.kind.category()
    }

    pub fn width(&self) -> u16 {
        self.kind.width()
    }

    /// Label listed to operators
    pub fn type_str(&self) -> &'static str {
        match &self.state().computation {
            Some(computation) => computation.type_str(),
            None => self.category().type_str(),
        }
    }

    pub fn scaling(&self) -> Scaling {
        self.state().scaling
    }

    pub fn set_scaling(&self, scaling: Scaling) {
        self.state().scaling = scaling;
    }

    pub fn full_scale(&self) -> f64 {
        self.state().scaling.full_scale
    }

    pub fn status(&self) -> u16 {
        self.state().status
    }

    pub fn set_status(&self, status: u16) {
        self.state().status = status;
    }

    /// Status word is neither underrange nor overrange
    pub fn is_healthy(&self) -> bool {
        !matches!(self.status(), STATUS_UNDERRANGE | STATUS_OVERRANGE)
    }

    /// Unscaled value; float points report their decoded value
    pub fn raw(&self) -> f64 {
        self.state().raw(self.kind)
    }

    /// Store an unscaled value as delivered by an adapter
    ///
    /// Status-encoded inputs wrap to a signed 16-bit value, digital outputs
    /// truncate, float points ignore the write.
    pub fn set_raw(&self, raw: f64) {
        let mut state = self.state();
        state.store_raw(self.kind, raw);
        state.record(self.kind, now_secs());
    }

    /// Engineering value
    pub fn val(&self) -> f64 {
        self.state().val(self.kind)
    }

    /// Set the engineering value, inverse-scaling into the raw domain
    ///
    /// Analog outputs truncate toward zero since they end up in a register.
    pub fn set_val(&self, val: f64) {
        let mut state = self.state();
        state.store_val(self.kind, val);
        state.record(self.kind, now_secs());
    }

    /// Value, or the range flag reported by the status word
    pub fn val_status(&self) -> StatusValue {
        let state = self.state();
        match state.status {
            STATUS_UNDERRANGE => StatusValue::Flag(RangeFlag::Under),
            STATUS_OVERRANGE => StatusValue::Flag(RangeFlag::Over),
            _ => StatusValue::Value(state.val(self.kind)),
        }
    }

    pub fn on(&self) {
        self.set_val(1.0);
    }

    pub fn off(&self) {
        self.set_val(0.0);
    }

    /// Digital state, for coil and discrete-input images
    pub fn bit(&self) -> bool {
        self.raw() != 0.0
    }

    /// Refresh a digital point from a single bit
    pub fn load_bit(&self, bit: bool) {
        self.set_raw(if bit { 1.0 } else { 0.0 });
    }

    /// Refresh the point from its register words, `width()` of them
    pub fn load_registers(&self, words: &[u16]) -> Result<(), DeviceError> {
        let expected = self.width() as usize;
        if words.len() < expected {
            return Err(DeviceError::ShortFrame {
                tag: self.tag.clone(),
                expected,
                got: words.len(),
            });
        }
        let mut state = self.state();
        match self.kind {
            DeviceKind::Software => {
                return Err(DeviceError::NoRegisterImage {
                    tag: self.tag.clone(),
                })
            }
            DeviceKind::AnalogIn(AnalogEncoding::Status)
            | DeviceKind::AnalogOut(AnalogEncoding::Status) => {
                state.status = words[0];
                state.store_raw(self.kind, words[1] as i16 as f64);
            }
            DeviceKind::AnalogIn(AnalogEncoding::Float)
            | DeviceKind::AnalogOut(AnalogEncoding::Float) => {
                state.words = [words[0], words[1]];
            }
            _ => state.store_raw(self.kind, words[0] as f64),
        }
        state.record(self.kind, now_secs());
        Ok(())
    }

    /// Register words to write for this point
    pub fn output_registers(&self) -> Vec<u16> {
        let state = self.state();
        match self.kind {
            DeviceKind::AnalogIn(AnalogEncoding::Float)
            | DeviceKind::AnalogOut(AnalogEncoding::Float) => state.words.to_vec(),
            DeviceKind::AnalogIn(AnalogEncoding::Status)
            | DeviceKind::AnalogOut(AnalogEncoding::Status) => vec![0, to_register(state.raw)],
            DeviceKind::DigitalIn | DeviceKind::DigitalOut => vec![u16::from(state.raw != 0.0)],
            _ => vec![to_register(state.raw)],
        }
    }

    pub fn log_window(&self) -> f64 {
        self.state().log.window()
    }

    /// Set the rolling log window in seconds, `0` disables logging
    pub fn set_log_window(&self, window: f64) {
        let mut state = self.state();
        state.log.set_window(window);
        state.saved_window = None;
    }

    /// Temporarily widen the log window, remembering the configured one
    pub fn override_log_window(&self, window: f64) {
        let mut state = self.state();
        if state.saved_window.is_none() {
            state.saved_window = Some(state.log.window());
        }
        state.log.set_window(window);
    }

    /// Undo [`Device::override_log_window`]
    pub fn restore_log_window(&self) {
        let mut state = self.state();
        if let Some(window) = state.saved_window.take() {
            state.log.set_window(window);
        }
    }

    pub fn log_len(&self) -> usize {
        self.state().log.len()
    }

    pub fn log_average(&self) -> f64 {
        let state = self.state();
        state.log.average(state.val(self.kind))
    }

    pub fn log_stddev(&self) -> f64 {
        self.state().log.stddev()
    }

    pub fn log_gradient(&self) -> f64 {
        self.state().log.gradient()
    }

    pub fn is_software(&self) -> bool {
        self.kind == DeviceKind::Software
    }

    /// Tags of every point this one reads or writes
    pub fn link_tags(&self) -> Vec<String> {
        match &self.state().computation {
            Some(computation) => computation.links().iter().map(|l| l.tag().to_string()).collect(),
            None => Vec::new(),
        }
    }

    /// Bind unbound links through `lookup`; returns the tags that did not resolve
    pub fn bind_links<F>(&self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<Arc<Device>>,
    {
        let state = self.state();
        let Some(computation) = &state.computation else {
            return Vec::new();
        };
        let mut unresolved = Vec::new();
        for link in computation.links() {
            if link.is_bound() {
                continue;
            }
            match lookup(link.tag()) {
                Some(device) => {
                    link.bind(&device);
                }
                None => unresolved.push(link.tag().to_string()),
            }
        }
        unresolved
    }

    /// Evaluate the computation of a software point
    pub fn calc(&self) {
        self.calc_at(now_secs());
    }

    /// Evaluate the computation at time `now`
    ///
    /// Linked points are read before this point's lock is taken, so a point may
    /// link to itself or sit in a cycle.
    pub fn calc_at(&self, now: f64) {
        let (primary, setpoint, forward) = {
            let state = self.state();
            let Some(computation) = &state.computation else {
                return;
            };
            let (primary, setpoint) = computation.sources();
            (primary, setpoint, computation.forward_target())
        };
        let inputs = Inputs {
            primary: primary.map(|d| d.val()),
            setpoint: setpoint.map(|d| d.val()),
        };

        let forwarded = {
            let mut state = self.state();
            let current = state.value;
            let Some(step) = state
                .computation
                .as_mut()
                .and_then(|c| c.step(current, inputs, now))
            else {
                return;
            };
            state.raw = step.raw;
            state.value = step.value;
            state.record(self.kind, now);
            step.value
        };

        if let Some(target) = forward {
            target.set_val(forwarded);
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

/// Shared handle to a device
pub type SharedDevice = Arc<Device>;
