// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Supervised waiting primitives handed to a running routine
//!
//! Every blocking primitive polls in ticks of [`RoutinesConfig::tick`]. On
//! each tick it runs the routine's safety check, parks while the routine is
//! paused, and returns [`RoutineError::Stopped`] once a stop was requested.
//!
//! [`RoutinesConfig::tick`]: crate::config::RoutinesConfig::tick

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::info;
use serde_json::{Map, Value};
use tokio::time::{sleep, sleep_until, Instant};

use super::RoutineError;
use crate::controller::{Colour, ControllerContext, ResultStatus, RoutineState};
use crate::devices::SharedDevice;

/// Interlock hook evaluated on every tick
pub type SafetyCheck = Arc<dyn Fn() -> Result<(), RoutineError> + Send + Sync>;

/// Observable lifecycle of a routine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Paused,
    Stopped,
}

/// Flags and inbox shared between a routine and whoever drives it
#[derive(Debug)]
pub struct RoutineControl {
    running: AtomicBool,
    paused: AtomicBool,
    inbox: Mutex<Vec<Vec<String>>>,
}

impl Default for RoutineControl {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            inbox: Mutex::new(Vec::new()),
        }
    }
}

impl RoutineControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the routine to stop at its next tick
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if !self.is_running() {
            Lifecycle::Stopped
        } else if self.is_paused() {
            Lifecycle::Paused
        } else {
            Lifecycle::Running
        }
    }

    /// Queue an operator message
    pub fn post(&self, args: Vec<String>) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(args);
    }

    fn take(&self) -> Vec<Vec<String>> {
        std::mem::take(&mut *self.inbox.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

fn deadline_after(start: Instant, value: f64) -> Instant {
    // Far enough to never be reached by a running rig
    let far = Duration::from_secs(100 * 365 * 24 * 3600);
    start
        .checked_add(seconds(value))
        .unwrap_or_else(|| start + far)
}

/// Everything a routine needs while it runs
pub struct RoutineContext {
    name: String,
    instance: u64,
    controller: Arc<ControllerContext>,
    control: Arc<RoutineControl>,
    safety: SafetyCheck,
    tick: Duration,
    warning_hold: f64,
}

impl RoutineContext {
    pub fn new(
        name: &str,
        instance: u64,
        controller: Arc<ControllerContext>,
        control: Arc<RoutineControl>,
        safety: SafetyCheck,
    ) -> Self {
        let config = controller.routines_config();
        let (tick, warning_hold) = (config.tick(), config.warning_hold);
        Self {
            name: name.to_string(),
            instance,
            controller,
            control,
            safety,
            tick,
            warning_hold,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn controller(&self) -> &Arc<ControllerContext> {
        &self.controller
    }

    pub fn control(&self) -> &Arc<RoutineControl> {
        &self.control
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn device(&self, tag: &str) -> Result<SharedDevice, RoutineError> {
        Ok(self.controller.device(tag)?)
    }

    /// Operator messages received since the last call
    pub fn take_messages(&self) -> Vec<Vec<String>> {
        self.control.take()
    }

    pub fn status_message(&self, msg: &str) {
        self.controller.status_message(msg, None);
    }

    pub fn results_message(&self, data: Map<String, Value>, status: ResultStatus) {
        self.controller.results_message(status, data);
    }

    /// Amber status message followed by a supervised pause
    pub async fn warning_message(&self, msg: &str) -> Result<(), RoutineError> {
        self.controller.status_message(msg, Some(Colour::Amber));
        self.delay(self.warning_hold).await
    }

    /// Run the safety check; a fault also requests a stop
    pub fn safety_check(&self) -> Result<(), RoutineError> {
        (self.safety)().map_err(|err| {
            self.control.stop();
            err
        })
    }

    fn ensure_running(&self) -> Result<(), RoutineError> {
        if self.control.is_running() {
            Ok(())
        } else {
            Err(RoutineError::Stopped)
        }
    }

    /// Park while paused, still supervising
    async fn pause_point(&self) -> Result<(), RoutineError> {
        if !self.control.is_paused() {
            return Ok(());
        }
        info!("Routine {} paused", self.name);
        self.controller.state_message(RoutineState::Paused);
        while self.control.is_paused() {
            self.safety_check()?;
            self.ensure_running()?;
            sleep(self.tick).await;
        }
        info!("Routine {} resumed", self.name);
        self.controller.state_message(RoutineState::Resumed);
        Ok(())
    }

    /// Safety check, pause handling and stop check of one tick
    pub async fn check_point(&self) -> Result<(), RoutineError> {
        self.safety_check()?;
        self.pause_point().await?;
        self.ensure_running()
    }

    /// Supervised sleep
    pub async fn delay(&self, secs: f64) -> Result<(), RoutineError> {
        let deadline = deadline_after(Instant::now(), secs);
        while Instant::now() < deadline {
            self.check_point().await?;
            sleep_until(deadline.min(Instant::now() + self.tick)).await;
        }
        Ok(())
    }

    /// Supervised wait until `condition` holds
    ///
    /// The condition is evaluated once per tick and may itself fail, which
    /// ends the wait with its error. Past `timeout` seconds the wait fails
    /// with [`RoutineError::Timeout`].
    pub async fn wait_for<F>(&self, mut condition: F, timeout: f64) -> Result<(), RoutineError>
    where
        F: FnMut() -> Result<bool, RoutineError> + Send,
    {
        let start = Instant::now();
        let deadline = deadline_after(start, timeout);
        loop {
            if condition()? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RoutineError::Timeout { after: now - start });
            }
            self.check_point().await?;
            sleep_until(deadline.min(Instant::now() + self.tick)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutinesConfig;
    use crate::controller::ControllerMessage;
    use std::sync::atomic::AtomicUsize;

    fn context(safety: SafetyCheck) -> (RoutineContext, tokio::sync::mpsc::UnboundedReceiver<ControllerMessage>) {
        let controller = Arc::new(
            ControllerContext::new(Vec::new(), "E-stop", RoutinesConfig::default()).unwrap(),
        );
        let (_, rx) = controller.subscribe();
        let ctx = RoutineContext::new(
            "test",
            1,
            controller,
            Arc::new(RoutineControl::new()),
            safety,
        );
        (ctx, rx)
    }

    fn no_interlock() -> SafetyCheck {
        Arc::new(|| Ok(()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_runs_safety_check_every_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (ctx, _rx) = context(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let start = Instant::now();
        ctx.delay(1.0).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out_within_one_tick() {
        let (ctx, _rx) = context(no_interlock());
        let start = Instant::now();
        let err = ctx.wait_for(|| Ok(false), 2.0).await.unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, RoutineError::Timeout { .. }));
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(2) + ctx.tick());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_returns_when_condition_holds() {
        let (ctx, _rx) = context(no_interlock());
        let mut polls = 0;
        ctx.wait_for(
            || {
                polls += 1;
                Ok(polls == 3)
            },
            10.0,
        )
        .await
        .unwrap();
        assert_eq!(polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_error_ends_the_wait() {
        let (ctx, _rx) = context(no_interlock());
        let err = ctx
            .wait_for(
                || {
                    Err(RoutineError::NotHealthy {
                        tag: "Flow meter 1".into(),
                    })
                },
                10.0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RoutineError::NotHealthy { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_delay_within_one_tick() {
        let (ctx, _rx) = context(no_interlock());
        let control = ctx.control().clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            control.stop();
        });
        let start = Instant::now();
        let err = ctx.delay(60.0).await.unwrap_err();
        assert!(matches!(err, RoutineError::Stopped));
        assert!(start.elapsed() <= Duration::from_millis(250) + ctx.tick());
        assert_eq!(ctx.control().lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_notify_once() {
        let (ctx, mut rx) = context(no_interlock());
        while rx.try_recv().is_ok() {}
        let control = ctx.control().clone();
        control.pause();
        assert_eq!(control.lifecycle(), Lifecycle::Paused);
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            control.resume();
        });
        let start = Instant::now();
        ctx.delay(1.0).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(ctx.control().lifecycle(), Lifecycle::Running);

        let mut states = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ControllerMessage::State(state) = message {
                states.push(state);
            }
        }
        assert_eq!(states, vec![RoutineState::Paused, RoutineState::Resumed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_fault_stops_the_routine() {
        let (ctx, _rx) = context(Arc::new(|| {
            Err(RoutineError::Interlock {
                reason: "E-stop active".into(),
            })
        }));
        let err = ctx.delay(5.0).await.unwrap_err();
        assert!(matches!(err, RoutineError::Interlock { .. }));
        assert!(!ctx.control().is_running());
    }

    #[test]
    fn test_inbox_drains() {
        let control = RoutineControl::new();
        control.post(vec!["continue".into()]);
        control.post(vec!["a".into(), "b".into()]);
        assert_eq!(control.take().len(), 2);
        assert!(control.take().is_empty());
    }
}
