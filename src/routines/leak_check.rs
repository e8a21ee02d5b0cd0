// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Leak-rate qualification check
//!
//! Pressurises the part under test through the pressure controller, waits for
//! the flow meter to settle and averages the leak flow over a fixed window.
//!
//! Started with parameters such as
//! `{"name": "LEAK", "pressureSP": 2.0, "maxLeakage": 5.0, "debug": false}`.
//! In debug mode the pressure PV and the flow meter are replaced by first-order
//! lags driven from the setpoint, so the check can run on a simulated rig.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{PlotSource, Routine, RoutineContext, RoutineError, RoutineFactory, SafetyCheck};
use crate::config::LeakCheckConfig;
use crate::controller::{ControllerContext, ResultStatus};
use crate::devices::{Computation, Device, Link, SharedDevice};

/// Start parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LeakCheckParams {
    /// Test pressure
    #[serde(rename = "pressureSP")]
    pub pressure_sp: f64,
    /// Largest leak flow that still passes
    #[serde(rename = "maxLeakage")]
    pub max_leakage: f64,
    #[serde(default)]
    pub debug: bool,
}

pub struct LeakCheck {
    params: LeakCheckParams,
    config: LeakCheckConfig,
    valves: Vec<SharedDevice>,
    vent_valve: SharedDevice,
    flow_valve: SharedDevice,
    pressure_valve: SharedDevice,
    ambient_pressure: SharedDevice,
    ambient_temperature: SharedDevice,
    pressure_sp: SharedDevice,
    pressure_pv: SharedDevice,
    flow_meter: SharedDevice,
    flow_meters: Vec<SharedDevice>,
    reference_pressure: Option<SharedDevice>,
    estop: Option<SharedDevice>,
    /// Debug stand-ins, stepped with the plot
    simulated: Vec<SharedDevice>,
}

impl LeakCheck {
    pub const NAME: &'static str = "LEAK";

    pub fn new(controller: &ControllerContext, params: LeakCheckParams) -> Result<Self, RoutineError> {
        if !(params.pressure_sp > 0.0) {
            return Err(RoutineError::Failure(format!(
                "pressureSP must be positive, got {}",
                params.pressure_sp
            )));
        }
        let mut config = controller.routines_config().leak_check.clone();
        let wiring = &config.wiring;
        let device = |tag: &str| controller.device(tag).map_err(RoutineError::from);

        let valves = wiring
            .valves
            .iter()
            .map(|tag| device(tag))
            .collect::<Result<Vec<_>, _>>()?;
        let flow_meters = wiring
            .flow_meters
            .iter()
            .map(|tag| device(tag))
            .collect::<Result<Vec<_>, _>>()?;
        let reference_pressure = match &wiring.reference_pressure {
            Some(tag) => Some(device(tag)?),
            None => None,
        };
        let pressure_sp = device(&wiring.pressure_sp)?;
        let mut pressure_pv = device(&wiring.pressure_pv)?;
        let mut flow_meter = device(&wiring.flow_meter)?;
        let vent_valve = device(&wiring.vent_valve)?;
        let flow_valve = device(&wiring.flow_valve)?;
        let pressure_valve = device(&wiring.pressure_valve)?;
        let ambient_pressure = device(&wiring.ambient_pressure)?;
        let ambient_temperature = device(&wiring.ambient_temperature)?;
        let estop = controller.device(controller.estop_tag()).ok();

        let mut simulated = Vec::new();
        if params.debug {
            debug!("Leak check running against simulated pressure and flow");
            let pressure = Arc::new(Device::software(
                format!("{}.debug", pressure_pv.tag()),
                Computation::lag(
                    Link::to(&pressure_sp),
                    config.debug_pressure_lag,
                    1.0,
                    params.pressure_sp / 60.0,
                ),
                pressure_pv.full_scale(),
            ));
            let flow = Arc::new(Device::software(
                format!("{}.debug", flow_meter.tag()),
                Computation::lag(
                    Link::to(&pressure),
                    config.debug_flow_lag,
                    0.95 * params.max_leakage / params.pressure_sp,
                    params.max_leakage / 60.0,
                ),
                flow_meter.full_scale(),
            ));
            pressure_pv = pressure;
            flow_meter = flow;
            simulated = vec![pressure_pv.clone(), flow_meter.clone()];
            config.pressure_delay = config.debug_delay;
            config.flow_delay = config.debug_delay;
        }

        Ok(Self {
            params,
            config,
            valves,
            vent_valve,
            flow_valve,
            pressure_valve,
            ambient_pressure,
            ambient_temperature,
            pressure_sp,
            pressure_pv,
            flow_meter,
            flow_meters,
            reference_pressure,
            estop,
            simulated,
        })
    }

    /// Factory registered with the controller under [`LeakCheck::NAME`]
    pub fn factory() -> RoutineFactory {
        Arc::new(|controller, params| {
            let params: LeakCheckParams = serde_json::from_value(params)?;
            Ok(Box::new(LeakCheck::new(controller, params)?) as Box<dyn Routine>)
        })
    }

    fn set_log_windows(&self, window: f64) {
        self.pressure_pv.set_log_window(window);
        self.flow_meter.set_log_window(window);
        for meter in &self.flow_meters {
            meter.set_log_window(window);
        }
    }

    fn flow_meter_ok(&self) -> Result<(), RoutineError> {
        if !self.flow_meter.is_healthy() || self.flow_meter.val() == 0.0 {
            return Err(RoutineError::NotHealthy {
                tag: self.flow_meter.tag().to_string(),
            });
        }
        Ok(())
    }

    async fn set_pressure(&self, ctx: &RoutineContext) -> Result<(), RoutineError> {
        ctx.status_message("Setting pressure setpoint");
        self.pressure_sp.set_val(self.params.pressure_sp);
        ctx.delay(1.0).await?;
        ctx.status_message("Waiting for pressure to stabilise");
        info!("Waiting for pressure to stabilise");

        let threshold = self.config.pressure_error_threshold;
        let error_ok = || -> Result<bool, RoutineError> {
            let sp = self.pressure_sp.val();
            Ok(((self.pressure_pv.val() - sp) / sp).abs() < threshold)
        };
        match ctx.wait_for(error_ok, self.config.pressure_delay).await {
            Err(RoutineError::Timeout { .. }) => Err(RoutineError::Failure(format!(
                "Unable to achieve pressure setpoint within {} seconds",
                self.config.pressure_delay
            ))),
            other => other,
        }
    }

    async fn wait_until_healthy(&self, ctx: &RoutineContext) -> Result<(), RoutineError> {
        ctx.status_message("Waiting for flow meter to become healthy");
        info!("Waiting for flow meter to become healthy");
        match ctx
            .wait_for(|| Ok(self.flow_meter_ok().is_ok()), self.config.health_timeout)
            .await
        {
            Err(RoutineError::Timeout { .. }) => Err(RoutineError::Failure(
                "Flow meter failed to become healthy".to_string(),
            )),
            other => other,
        }
    }

    /// Let the gradient log fill; `false` when the flow meter dropped out
    async fn gradient_delay(&self, ctx: &RoutineContext) -> Result<bool, RoutineError> {
        ctx.status_message("Calculating flow rate gradient");
        info!("Calculating flow rate gradient");
        let watch = || self.flow_meter_ok().map(|_| false);
        match ctx.wait_for(watch, self.config.gradient_window).await {
            Ok(()) | Err(RoutineError::Timeout { .. }) => Ok(true),
            Err(RoutineError::NotHealthy { tag }) => {
                warn!("{} became unhealthy, restarting stabilisation", tag);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Wait for a flat flow gradient; `false` when the flow meter dropped out
    ///
    /// An operator `continue` message accepts the current flow as stable.
    async fn wait_until_stable(&self, ctx: &RoutineContext) -> Result<bool, RoutineError> {
        ctx.status_message("Waiting for flow to stabilise");
        info!("Waiting for flow to stabilise");
        let threshold = self.config.gradient_threshold;
        let gradient_ok = || -> Result<bool, RoutineError> {
            let messages = ctx.take_messages();
            if messages
                .iter()
                .any(|args| args.first().map(String::as_str) == Some("continue"))
            {
                info!("Flow accepted as stable by the operator");
                return Ok(true);
            }
            self.flow_meter_ok()?;
            let gradient = self.flow_meter.log_gradient();
            debug!("Flow gradient: {}", gradient);
            Ok(gradient.abs() < threshold)
        };
        match ctx.wait_for(gradient_ok, self.config.flow_delay).await {
            Ok(()) => Ok(true),
            Err(RoutineError::NotHealthy { tag }) => {
                warn!("{} became unhealthy, restarting stabilisation", tag);
                Ok(false)
            }
            Err(RoutineError::Timeout { .. }) => {
                ctx.warning_message("Warning: unstable flow rate").await?;
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    async fn record_results(&self, ctx: &RoutineContext) -> Result<(), RoutineError> {
        ctx.status_message("Recording results");
        self.set_log_windows(self.config.record_window);
        ctx.delay(self.config.record_window).await?;

        let mut result = Map::new();
        result.insert("p".to_string(), Value::from(self.pressure_pv.log_average()));
        result.insert("m".to_string(), Value::from(self.flow_meter.log_average()));
        result.insert("pa".to_string(), Value::from(self.ambient_pressure.val()));
        result.insert("ta".to_string(), Value::from(self.ambient_temperature.val()));

        let passed =
            self.flow_meter.val() <= self.params.max_leakage && self.flow_meter.is_healthy();
        info!(
            "Leak check {}: flow {} against limit {}",
            if passed { "passed" } else { "failed" },
            self.flow_meter.val(),
            self.params.max_leakage
        );
        let status = if passed {
            ResultStatus::Passed
        } else {
            ResultStatus::Failed
        };
        ctx.results_message(result, status);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Routine for LeakCheck {
    /// The E-stop must stay clear for the whole check
    fn safety_check(&self) -> SafetyCheck {
        let estop = self.estop.clone();
        Arc::new(move || match &estop {
            Some(estop) if estop.val() == 0.0 => Err(RoutineError::Interlock {
                reason: format!("{} active", estop.tag()),
            }),
            _ => Ok(()),
        })
    }

    fn plot_source(&self) -> Option<PlotSource> {
        let simulated = self.simulated.clone();
        let flow_meter = self.flow_meter.clone();
        let pressure_pv = self.pressure_pv.clone();
        let reference = self.reference_pressure.clone();
        Some(Arc::new(move || {
            for device in &simulated {
                device.calc();
            }
            let mut data = Map::new();
            data.insert(
                "t".to_string(),
                Value::from(chrono::Utc::now().timestamp_millis()),
            );
            data.insert("m".to_string(), flow_meter.val_status().into());
            if let Some(reference) = &reference {
                data.insert("p1".to_string(), reference.val_status().into());
            }
            data.insert("p2".to_string(), pressure_pv.val_status().into());
            data
        }))
    }

    async fn reset(&mut self, _ctx: &RoutineContext) -> Result<(), RoutineError> {
        self.pressure_sp.set_val(0.0);
        tokio::time::sleep(Duration::from_secs_f64(self.config.reset_settle.max(0.0))).await;
        for valve in &self.valves {
            valve.off();
        }
        self.vent_valve.on();
        self.set_log_windows(0.0);
        Ok(())
    }

    async fn execute(&mut self, ctx: &RoutineContext) -> Result<(), RoutineError> {
        ctx.status_message("Starting leak check");
        self.pressure_valve.on();
        self.flow_valve.on();
        ctx.delay(1.0).await?;
        self.vent_valve.off();

        self.set_log_windows(self.config.gradient_window);

        let faulty: Vec<&str> = [
            &self.pressure_valve,
            &self.flow_valve,
            &self.pressure_sp,
            &self.pressure_pv,
        ]
        .into_iter()
        .filter(|device| !device.is_healthy())
        .map(|device| device.tag())
        .collect();
        if !faulty.is_empty() {
            warn!("Leak check blocked by faulty devices: {:?}", faulty);
            return Err(RoutineError::Failure(
                "IO fault present. Clear all faults before continuing.".to_string(),
            ));
        }

        self.set_pressure(ctx).await?;
        loop {
            self.wait_until_healthy(ctx).await?;
            if self.gradient_delay(ctx).await? && self.wait_until_stable(ctx).await? {
                break;
            }
        }
        self.record_results(ctx).await
    }
}
