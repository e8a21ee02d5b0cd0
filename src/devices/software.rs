// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Software points: computations evaluated once per poll cycle
//!
//! A software point reads other points through [`Link`]s. Links are resolved by
//! tag once the full device registry exists, so computations may form cycles
//! (a PID output feeding a plant model that feeds the PID back) without owning
//! each other.

use std::sync::{Arc, OnceLock, Weak};

use rand::Rng;

use super::pid::PidController;
use super::Device;

/// Named reference to another point, bound after the registry is built
#[derive(Debug, Clone)]
pub struct Link {
    tag: String,
    target: OnceLock<Weak<Device>>,
}

impl Link {
    /// Unbound link to the point called `tag`
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            target: OnceLock::new(),
        }
    }

    /// Link already bound to `device`
    pub fn to(device: &Arc<Device>) -> Self {
        let link = Self::new(device.tag());
        link.bind(device);
        link
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Bind the link; returns `false` when it was already bound
    pub fn bind(&self, device: &Arc<Device>) -> bool {
        self.target.set(Arc::downgrade(device)).is_ok()
    }

    pub fn is_bound(&self) -> bool {
        self.target.get().is_some()
    }

    pub fn resolve(&self) -> Option<Arc<Device>> {
        self.target.get().and_then(Weak::upgrade)
    }
}

/// Values read from the linked points before a step
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Inputs {
    pub primary: Option<f64>,
    pub setpoint: Option<f64>,
}

/// Outcome of one computation step
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Step {
    pub raw: f64,
    pub value: f64,
}

/// Behaviour of a software point
#[derive(Debug, Clone)]
pub enum Computation {
    /// Holds operator-entered data
    Input,
    /// Copies one point into another
    PassThrough { input: Link, output: Link },
    /// Amplifies its input and adds uniform noise
    Gain {
        input: Link,
        gain: f64,
        noise_amplitude: f64,
    },
    /// Follows its input at a bounded rate, without overshoot
    Ramp {
        input: Link,
        rate: f64,
        output: f64,
        last_update: Option<f64>,
    },
    /// First-order lag with gain and uniform noise
    Lag {
        input: Link,
        time_constant: f64,
        gain: f64,
        noise_amplitude: f64,
        buffer: f64,
        last_update: Option<f64>,
    },
    /// PID controller writing its output to this point
    Pid {
        pv: Link,
        sp: Link,
        controller: PidController,
    },
}

impl Computation {
    pub fn gain(input: Link, gain: f64, noise_amplitude: f64) -> Self {
        Self::Gain {
            input,
            gain,
            noise_amplitude,
        }
    }

    pub fn ramp(input: Link, rate: f64) -> Self {
        Self::Ramp {
            input,
            rate,
            output: 0.0,
            last_update: None,
        }
    }

    pub fn lag(input: Link, time_constant: f64, gain: f64, noise_amplitude: f64) -> Self {
        Self::Lag {
            input,
            time_constant,
            gain,
            noise_amplitude,
            buffer: 0.0,
            last_update: None,
        }
    }

    pub fn pid(pv: Link, sp: Link, controller: PidController) -> Self {
        Self::Pid { pv, sp, controller }
    }

    /// Short type label shown to operators
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Input => "a-out",
            Self::PassThrough { .. } => "",
            Self::Gain { .. } | Self::Ramp { .. } | Self::Lag { .. } | Self::Pid { .. } => "a-in",
        }
    }

    /// Every link this computation reads or writes
    pub fn links(&self) -> Vec<&Link> {
        match self {
            Self::Input => Vec::new(),
            Self::PassThrough { input, output } => vec![input, output],
            Self::Gain { input, .. } | Self::Ramp { input, .. } | Self::Lag { input, .. } => {
                vec![input]
            }
            Self::Pid { pv, sp, .. } => vec![pv, sp],
        }
    }

    /// Points whose values feed the next step
    pub(crate) fn sources(&self) -> (Option<Arc<Device>>, Option<Arc<Device>>) {
        match self {
            Self::Input => (None, None),
            Self::PassThrough { input, .. }
            | Self::Gain { input, .. }
            | Self::Ramp { input, .. }
            | Self::Lag { input, .. } => (input.resolve(), None),
            Self::Pid { pv, sp, .. } => (pv.resolve(), sp.resolve()),
        }
    }

    /// Point written by a pass-through after each step
    pub(crate) fn forward_target(&self) -> Option<Arc<Device>> {
        match self {
            Self::PassThrough { output, .. } => output.resolve(),
            _ => None,
        }
    }

    /// Advance one step at time `now`; `None` leaves the point untouched
    pub(crate) fn step(&mut self, current: f64, inputs: Inputs, now: f64) -> Option<Step> {
        match self {
            Self::Input => Some(Step {
                raw: current,
                value: current,
            }),
            Self::PassThrough { output, .. } => {
                if !output.is_bound() {
                    return None;
                }
                let v = inputs.primary?;
                Some(Step { raw: v, value: v })
            }
            Self::Gain {
                gain,
                noise_amplitude,
                ..
            } => {
                let raw = *gain * inputs.primary?;
                Some(Step {
                    raw,
                    value: raw + noise(*noise_amplitude),
                })
            }
            Self::Ramp {
                rate,
                output,
                last_update,
                ..
            } => {
                let target = inputs.primary?;
                let dt = elapsed(last_update, now);
                if *output < target {
                    *output = (*output + *rate * dt).min(target);
                } else if *output > target {
                    *output = (*output - *rate * dt).max(target);
                }
                Some(Step {
                    raw: *output,
                    value: *output,
                })
            }
            Self::Lag {
                time_constant,
                gain,
                noise_amplitude,
                buffer,
                last_update,
                ..
            } => {
                let input = inputs.primary?;
                let dt = elapsed(last_update, now);
                *buffer += (input - *buffer) * dt / *time_constant;
                let output = *gain * *buffer;
                Some(Step {
                    raw: output,
                    value: output + noise(*noise_amplitude),
                })
            }
            Self::Pid { controller, .. } => {
                let cv = controller.update(inputs.setpoint?, inputs.primary?, now);
                Some(Step { raw: cv, value: cv })
            }
        }
    }
}

fn elapsed(last_update: &mut Option<f64>, now: f64) -> f64 {
    let dt = last_update.map_or(0.0, |t| (now - t).max(0.0));
    *last_update = Some(now);
    dt
}

fn noise(amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        rand::rng().random_range(-amplitude..=amplitude)
    } else {
        0.0
    }
}
