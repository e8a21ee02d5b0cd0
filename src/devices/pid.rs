// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Velocity-form PID controller used by software control points

/// Incremental (velocity form) PID controller
///
/// ```text
/// cv = cv[-1] + P * ((e - e[-1]) + dt/Ti * e + Td/dt * (e - 2 e[-1] + e[-2]))
/// ```
///
/// The output is clamped to the optional limits after each update.
#[derive(Debug, Clone, PartialEq)]
pub struct PidController {
    /// Proportional gain
    p: f64,
    /// Integral time in seconds
    t_i: f64,
    /// Derivative time in seconds
    t_d: f64,
    /// Output limits
    output_min: Option<f64>,
    output_max: Option<f64>,
    /// Previous output
    previous_output: f64,
    /// Error history for the incremental form
    previous_error: f64,
    previous_error2: f64,
    /// Timestamp of the last update, in seconds
    last_update: Option<f64>,
}

impl PidController {
    /// Create a new PID controller with the given parameters
    pub fn new(p: f64, t_i: f64, t_d: f64, output_min: Option<f64>, output_max: Option<f64>) -> Self {
        Self {
            p,
            t_i,
            t_d,
            output_min,
            output_max,
            previous_output: 0.0,
            previous_error: 0.0,
            previous_error2: 0.0,
            last_update: None,
        }
    }

    /// Start the time base at `now` so the first update already integrates
    pub fn with_time_base(mut self, now: f64) -> Self {
        self.last_update = Some(now);
        self
    }

    /// Last computed output
    pub fn output(&self) -> f64 {
        self.previous_output
    }

    /// Update the controller at time `now` (seconds) and return the new output
    ///
    /// Without [`with_time_base`](Self::with_time_base) the first call only
    /// establishes the time base. A call with a zero or negative time step
    /// returns the previous output and leaves the state untouched.
    pub fn update(&mut self, setpoint: f64, process_value: f64, now: f64) -> f64 {
        let Some(last_update) = self.last_update else {
            self.last_update = Some(now);
            return self.previous_output;
        };
        let dt = now - last_update;
        if dt <= 0.0 {
            return self.previous_output;
        }
        self.last_update = Some(now);

        let error = setpoint - process_value;
        let proportional = error - self.previous_error;
        let integral = dt / self.t_i * error;
        let derivative = self.t_d / dt * (error - 2.0 * self.previous_error + self.previous_error2);

        let mut output = self.previous_output + self.p * (proportional + integral + derivative);
        if let Some(max) = self.output_max {
            output = output.min(max);
        }
        if let Some(min) = self.output_min {
            output = output.max(min);
        }

        self.previous_error2 = self.previous_error;
        self.previous_error = error;
        self.previous_output = output;
        output
    }
}
