// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Routine engine: supervised multi-phase procedures
//!
//! A routine is started by name through the controller, runs as its own task
//! and unwinds through [`RoutineError::Stopped`] when asked to stop. The
//! lifecycle of one run is handled by [`run_routine`]:
//!
//! 1. `reset`, then `execute`
//! 2. a stop is logged, any other error is reported as an `error` result
//! 3. `reset` again
//! 4. the instance is marked stopped, a `stopped` result is sent and the
//!    instance is removed from the controller

pub mod context;
pub mod leak_check;

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::{Map, Value};
use thiserror::Error;

pub use context::{Lifecycle, RoutineContext, RoutineControl, SafetyCheck};
pub use leak_check::{LeakCheck, LeakCheckParams};

use crate::controller::{ControllerContext, ControllerError, ResultStatus};

/// Routine errors
#[derive(Error, Debug)]
pub enum RoutineError {
    /// Cooperative stop signal, not a failure
    #[error("Routine stopped")]
    Stopped,

    #[error("Timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Device '{tag}' is not healthy")]
    NotHealthy { tag: String },

    #[error("Interlock tripped: {reason}")]
    Interlock { reason: String },

    #[error("{0}")]
    Failure(String),

    #[error("Invalid routine parameters: {0}")]
    InvalidParameters(#[from] serde_json::Error),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Routine-specific plot payload, sampled once per poll cycle
pub type PlotSource = Arc<dyn Fn() -> Map<String, Value> + Send + Sync>;

/// Builds a routine from its start parameters
pub type RoutineFactory = Arc<
    dyn Fn(&Arc<ControllerContext>, Value) -> Result<Box<dyn Routine>, RoutineError>
        + Send
        + Sync,
>;

/// A supervised procedure
#[async_trait::async_trait]
pub trait Routine: Send {
    /// Interlock hook run on every tick of every wait
    fn safety_check(&self) -> SafetyCheck {
        Arc::new(|| Ok(()))
    }

    /// Payload plotted while the routine runs
    fn plot_source(&self) -> Option<PlotSource> {
        None
    }

    /// Bring the rig to a safe state; runs before and after `execute`
    ///
    /// Must not rely on the supervised waits, it also runs after a stop.
    async fn reset(&mut self, _ctx: &RoutineContext) -> Result<(), RoutineError> {
        Ok(())
    }

    async fn execute(&mut self, ctx: &RoutineContext) -> Result<(), RoutineError>;
}

/// Run one routine instance to completion
pub async fn run_routine(mut routine: Box<dyn Routine>, ctx: RoutineContext) {
    let name = ctx.name().to_string();
    info!("Starting routine {}", name);

    let outcome = match routine.reset(&ctx).await {
        Ok(()) => routine.execute(&ctx).await,
        Err(err) => Err(err),
    };
    match outcome {
        Ok(()) => info!("Routine {} completed", name),
        Err(RoutineError::Stopped) => info!("Routine {} stopped", name),
        Err(err) => {
            error!("Routine {} failed: {}", name, err);
            ctx.controller().error_message(&err);
        }
    }

    if let Err(err) = routine.reset(&ctx).await {
        warn!("Routine {} could not reset: {}", name, err);
    }
    ctx.control().stop();
    ctx.results_message(Map::new(), ResultStatus::Stopped);
    ctx.controller().deregister_routine(&name, ctx.instance());
}
