// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Controller orchestration
//!
//! [`ControllerContext`] is the state shared by the poll loop, the running
//! routines and the operator consoles: the tag registry, the subscribers and
//! the routine registry. [`Controller`] owns the adapters and drives the poll
//! loop on its own task.
//!
//! ```no_run
//! use rust_rig_controller::config::Config;
//! use rust_rig_controller::controller::Controller;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut config = Config::default();
//! config.controller.simulation = true;
//!
//! let mut controller = Controller::from_config(&config)?;
//! let (id, mut messages) = controller.subscribe();
//! controller.start().await?;
//! controller.context().handle_command(id, "start-stream");
//! while let Some(message) = messages.recv().await {
//!     println!("{message}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod calibration;
pub mod commands;
pub mod poll_loop;
pub mod subscribers;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use calibration::{load_calibration, CalibrationEntry};
pub use commands::Command;
pub use poll_loop::PollLoop;
pub use subscribers::{
    Colour, ControlEvent, ControllerMessage, DeviceInfo, ResultStatus, RoutineState, StreamMode,
    SubscriberId, Subscribers,
};

use crate::adapters::{create_adapter, Adapter, AdapterError, SimulationAdapter};
use crate::config::{Config, RoutinesConfig};
use crate::devices::Device;
use crate::routines::{
    run_routine, LeakCheck, PlotSource, RoutineContext, RoutineControl, RoutineFactory,
};

/// Controller errors
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Duplicate device tag '{tag}'")]
    DuplicateTag { tag: String },

    #[error("Unknown device '{tag}'")]
    UnknownTag { tag: String },

    #[error("Unknown routine '{name}'")]
    UnknownRoutine { name: String },

    #[error("Routine '{name}' is not running")]
    RoutineNotRunning { name: String },

    #[error("Device '{device}' links to unknown device '{link}'")]
    UnresolvedLink { device: String, link: String },

    #[error("{0}")]
    InvalidCommand(String),

    #[error("Routine '{name}' could not start: {reason}")]
    RoutineSetup { name: String, reason: String },

    #[error("Controller is already running")]
    AlreadyStarted,

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

struct RoutineEntry {
    instance: u64,
    control: Arc<RoutineControl>,
    plot: Option<PlotSource>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry, subscribers and routines shared across tasks
pub struct ControllerContext {
    devices: BTreeMap<String, Arc<Device>>,
    estop_tag: String,
    estop_clear: AtomicBool,
    subscribers: Mutex<Subscribers>,
    routines: Mutex<HashMap<String, RoutineEntry>>,
    factories: Mutex<HashMap<String, RoutineFactory>>,
    routines_config: RoutinesConfig,
    next_instance: AtomicU64,
}

impl ControllerContext {
    /// Build the tag registry and bind every software link against it
    pub fn new(
        devices: Vec<Arc<Device>>,
        estop_tag: &str,
        routines_config: RoutinesConfig,
    ) -> Result<Self, ControllerError> {
        let mut registry = BTreeMap::new();
        for device in devices {
            let tag = device.tag().to_string();
            if registry.contains_key(&tag) {
                return Err(ControllerError::DuplicateTag { tag });
            }
            registry.insert(tag, device);
        }

        for device in registry.values() {
            let unresolved = device.bind_links(|tag| registry.get(tag).cloned());
            if let Some(link) = unresolved.into_iter().next() {
                return Err(ControllerError::UnresolvedLink {
                    device: device.tag().to_string(),
                    link,
                });
            }
        }
        debug!("Registered {} device(s)", registry.len());

        Ok(Self {
            devices: registry,
            estop_tag: estop_tag.to_string(),
            estop_clear: AtomicBool::new(true),
            subscribers: Mutex::new(Subscribers::default()),
            routines: Mutex::new(HashMap::new()),
            factories: Mutex::new(HashMap::new()),
            routines_config,
            next_instance: AtomicU64::new(0),
        })
    }

    pub fn device(&self, tag: &str) -> Result<Arc<Device>, ControllerError> {
        self.devices
            .get(tag)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownTag {
                tag: tag.to_string(),
            })
    }

    /// Every registered device, in tag order
    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> + '_ {
        self.devices.values()
    }

    pub fn device_list(&self) -> Vec<DeviceInfo> {
        self.devices
            .values()
            .map(|d| DeviceInfo {
                tag: d.tag().to_string(),
                kind: d.type_str().to_string(),
            })
            .collect()
    }

    pub fn estop_tag(&self) -> &str {
        &self.estop_tag
    }

    pub fn routines_config(&self) -> &RoutinesConfig {
        &self.routines_config
    }

    pub fn is_estop_active(&self) -> bool {
        !self.estop_clear.load(Ordering::SeqCst)
    }

    /// Record the latest E-stop reading; returns the previous one
    pub(crate) fn swap_estop_clear(&self, clear: bool) -> bool {
        self.estop_clear.swap(clear, Ordering::SeqCst)
    }

    /// Attach a console
    ///
    /// The new subscriber immediately receives the time, the device list and,
    /// when the E-stop is active, an `estop on` event.
    pub fn subscribe(&self) -> (SubscriberId, UnboundedReceiver<ControllerMessage>) {
        let mut subscribers = self.subscribers();
        let (id, receiver) = subscribers.attach();
        subscribers.send_to(id, ControllerMessage::Time(commands::now_millis()));
        subscribers.send_to(id, ControllerMessage::Devices(self.device_list()));
        if self.is_estop_active() {
            subscribers.send_to(id, ControllerMessage::Control(ControlEvent::EstopOn));
        }
        info!("Subscriber {} attached", id);
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers().detach(id);
        info!("Subscriber {} detached", id);
    }

    pub(crate) fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        lock(&self.subscribers)
    }

    pub fn status_message(&self, msg: &str, colour: Option<Colour>) {
        info!("{}", msg);
        self.subscribers().broadcast(ControllerMessage::Status {
            msg: msg.to_string(),
            colour,
        });
    }

    pub fn control_message(&self, event: ControlEvent) {
        self.subscribers().broadcast(ControllerMessage::Control(event));
    }

    pub fn state_message(&self, state: RoutineState) {
        self.subscribers().broadcast(ControllerMessage::State(state));
    }

    pub fn results_message(&self, status: ResultStatus, data: Map<String, Value>) {
        self.subscribers()
            .broadcast(ControllerMessage::Results { status, data });
    }

    /// Report an error as an `error` result carrying `errorMessage`
    pub fn error_message(&self, err: impl fmt::Display) {
        let mut data = Map::new();
        data.insert("errorMessage".to_string(), Value::from(err.to_string()));
        self.results_message(ResultStatus::Error, data);
    }

    pub fn register_routine(&self, name: &str, factory: RoutineFactory) {
        debug!("Registering routine {}", name);
        lock(&self.factories).insert(name.to_string(), factory);
    }

    /// Instantiate routine `name` with `params` and run it on its own task
    ///
    /// Starting a name that is still running replaces the registry entry; the
    /// earlier instance keeps running but can no longer be addressed.
    pub fn call_routine(self: &Arc<Self>, name: &str, params: Value) -> Result<(), ControllerError> {
        let factory = lock(&self.factories).get(name).cloned().ok_or_else(|| {
            ControllerError::UnknownRoutine {
                name: name.to_string(),
            }
        })?;

        let routine = match factory(self, params) {
            Ok(routine) => routine,
            Err(err) => {
                error!("Routine {} rejected its parameters: {}", name, err);
                self.error_message(&err);
                return Err(ControllerError::RoutineSetup {
                    name: name.to_string(),
                    reason: err.to_string(),
                });
            }
        };

        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
        let control = Arc::new(RoutineControl::new());
        let entry = RoutineEntry {
            instance,
            control: control.clone(),
            plot: routine.plot_source(),
        };
        if lock(&self.routines).insert(name.to_string(), entry).is_some() {
            warn!("Routine {} started while a previous run is still active", name);
        }

        let ctx = RoutineContext::new(name, instance, self.clone(), control, routine.safety_check());
        tokio::spawn(run_routine(routine, ctx));
        Ok(())
    }

    fn with_routine<F>(&self, name: &str, action: F) -> Result<(), ControllerError>
    where
        F: FnOnce(&RoutineControl),
    {
        let routines = lock(&self.routines);
        let entry = routines
            .get(name)
            .ok_or_else(|| ControllerError::RoutineNotRunning {
                name: name.to_string(),
            })?;
        action(&entry.control);
        Ok(())
    }

    pub fn stop_routine(&self, name: &str) -> Result<(), ControllerError> {
        info!("Stopping routine {}", name);
        self.with_routine(name, RoutineControl::stop)
    }

    pub fn pause_routine(&self, name: &str) -> Result<(), ControllerError> {
        self.with_routine(name, RoutineControl::pause)
    }

    pub fn resume_routine(&self, name: &str) -> Result<(), ControllerError> {
        self.with_routine(name, RoutineControl::resume)
    }

    pub fn stop_all_routines(&self) {
        for (name, entry) in lock(&self.routines).iter() {
            debug!("Stopping routine {}", name);
            entry.control.stop();
        }
    }

    /// Deliver an operator message to every running routine
    pub fn post_message(&self, args: Vec<String>) -> usize {
        let routines = lock(&self.routines);
        for entry in routines.values() {
            entry.control.post(args.clone());
        }
        routines.len()
    }

    pub fn running_routines(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.routines).keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove `name` if it still refers to `instance`
    pub(crate) fn deregister_routine(&self, name: &str, instance: u64) {
        let mut routines = lock(&self.routines);
        if routines.get(name).is_some_and(|e| e.instance == instance) {
            routines.remove(name);
        }
    }

    pub(crate) fn plot_sources(&self) -> Vec<PlotSource> {
        lock(&self.routines)
            .values()
            .filter_map(|e| e.plot.clone())
            .collect()
    }

    /// Operator override of an engineering value
    pub fn force_value(&self, tag: &str, value: f64) -> Result<(), ControllerError> {
        let device = self.device(tag)?;
        info!("Operator set {} to {}", tag, value);
        device.set_val(value);
        Ok(())
    }
}

/// Longest wait for routines to reset when the controller stops
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Owner of the adapters and of the poll loop task
pub struct Controller {
    context: Arc<ControllerContext>,
    idle: Option<PollLoop>,
    task: Option<JoinHandle<PollLoop>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Controller {
    /// Build adapters, registry and routines from a configuration
    ///
    /// In simulation mode every hardware adapter is replaced by a synthetic
    /// copy of itself and the E-stop is held clear.
    pub fn from_config(config: &Config) -> Result<Self, ControllerError> {
        let settings = config.controller.adapter_settings();
        let simulation = config.controller.simulation;
        let mut adapters: Vec<Box<dyn Adapter>> = Vec::with_capacity(config.adapters.len());

        for adapter_config in &config.adapters {
            let devices = adapter_config
                .devices
                .iter()
                .map(|d| Arc::new(d.build()))
                .collect();
            let adapter = create_adapter(adapter_config, devices, settings)?;
            if simulation && adapter_config.kind.is_hardware() {
                adapters.push(Box::new(SimulationAdapter::mirror(&*adapter)));
            } else {
                adapters.push(adapter);
            }
        }

        let estop_tag = &config.controller.estop_tag;
        if simulation {
            info!("Simulation mode: hardware adapters replaced by synthetic ones");
            if !adapters.iter_mut().any(|a| a.hold(estop_tag, 1.0)) {
                warn!("E-stop '{}' is not simulated, it cannot be held clear", estop_tag);
            }
        }

        let devices = adapters
            .iter()
            .flat_map(|a| a.image().devices().iter().cloned())
            .collect();
        let context = ControllerContext::new(devices, estop_tag, config.routines.clone())?;
        context.register_routine(LeakCheck::NAME, LeakCheck::factory());

        Ok(Self::new(Arc::new(context), adapters))
    }

    pub fn new(context: Arc<ControllerContext>, adapters: Vec<Box<dyn Adapter>>) -> Self {
        let idle = PollLoop::new(context.clone(), adapters);
        Self {
            context,
            idle: Some(idle),
            task: None,
            shutdown: None,
        }
    }

    pub fn context(&self) -> &Arc<ControllerContext> {
        &self.context
    }

    pub fn subscribe(&self) -> (SubscriberId, UnboundedReceiver<ControllerMessage>) {
        self.context.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Connect every adapter in turn, then spawn the poll loop
    ///
    /// Returns once all adapters are connected. An adapter that gives up
    /// leaves the controller idle and its error is returned.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        let mut poll_loop = self.idle.take().ok_or(ControllerError::AlreadyStarted)?;
        if let Err(err) = poll_loop.connect_all().await {
            poll_loop.disconnect_all().await;
            self.idle = Some(poll_loop);
            return Err(err.into());
        }
        let (tx, rx) = watch::channel(false);
        self.task = Some(tokio::spawn(poll_loop.run(rx)));
        self.shutdown = Some(tx);
        Ok(())
    }

    /// Stop every routine and the poll loop, leaving the adapters disconnected
    ///
    /// The loop keeps polling while the routines reset, for at most
    /// [`STOP_GRACE`], so their safe state reaches the outputs.
    pub async fn stop(&mut self) {
        self.context.stop_all_routines();
        if self.task.is_some() {
            let context = self.context.clone();
            let settled = tokio::time::timeout(STOP_GRACE, async move {
                while !context.running_routines().is_empty() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
            if settled.is_err() {
                warn!("Routines still running after {:?}", STOP_GRACE);
            }
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(poll_loop) => self.idle = Some(poll_loop),
                Err(err) => error!("Main loop task failed: {}", err),
            }
        }
    }

    /// Run one cycle on the calling task; only while the loop is not started
    pub async fn poll_once(&mut self) -> Result<(), ControllerError> {
        let poll_loop = self.idle.as_mut().ok_or(ControllerError::AlreadyStarted)?;
        if !poll_loop.is_connected() {
            poll_loop.connect_all().await?;
        }
        if let Err(err) = poll_loop.cycle().await {
            poll_loop.disconnect_all().await;
            return Err(err.into());
        }
        Ok(())
    }

    pub fn apply_calibration(&self, entries: &[CalibrationEntry]) -> usize {
        self.context.apply_calibration(entries)
    }

    pub fn call_routine(&self, name: &str, params: Value) -> Result<(), ControllerError> {
        self.context.call_routine(name, params)
    }

    pub fn force_value(&self, tag: &str, value: f64) -> Result<(), ControllerError> {
        self.context.force_value(tag, value)
    }

    pub fn handle_command(&self, subscriber: SubscriberId, line: &str) {
        self.context.handle_command(subscriber, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{Computation, DeviceKind, Link, Scaling};

    fn digital(tag: &str) -> Arc<Device> {
        Arc::new(Device::new(tag, 0, DeviceKind::DigitalIn, Scaling::default()))
    }

    fn drain(rx: &mut UnboundedReceiver<ControllerMessage>) -> Vec<ControllerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_registry_rejects_duplicates_and_dangling_links() {
        let duplicate =
            ControllerContext::new(vec![digital("A"), digital("A")], "E-stop", RoutinesConfig::default());
        assert!(matches!(duplicate, Err(ControllerError::DuplicateTag { tag }) if tag == "A"));

        let gain = Arc::new(Device::software(
            "G",
            Computation::gain(Link::new("Nowhere"), 2.0, 0.0),
            10.0,
        ));
        let dangling = ControllerContext::new(vec![gain], "E-stop", RoutinesConfig::default());
        assert!(matches!(
            dangling,
            Err(ControllerError::UnresolvedLink { link, .. }) if link == "Nowhere"
        ));
    }

    #[test]
    fn test_subscribe_sends_time_and_devices() {
        let context =
            ControllerContext::new(vec![digital("E-stop")], "E-stop", RoutinesConfig::default())
                .unwrap();
        let (_, mut rx) = context.subscribe();
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], ControllerMessage::Time(_)));
        assert_eq!(
            messages[1],
            ControllerMessage::Devices(vec![DeviceInfo {
                tag: "E-stop".into(),
                kind: "d-in".into()
            }])
        );

        context.swap_estop_clear(false);
        let (_, mut rx) = context.subscribe();
        assert!(drain(&mut rx).contains(&ControllerMessage::Control(ControlEvent::EstopOn)));
    }

    #[test]
    fn test_unknown_routine_and_tag() {
        let context = Arc::new(
            ControllerContext::new(Vec::new(), "E-stop", RoutinesConfig::default()).unwrap(),
        );
        assert!(matches!(
            context.call_routine("LEAK", Value::Null),
            Err(ControllerError::UnknownRoutine { .. })
        ));
        assert!(matches!(
            context.stop_routine("LEAK"),
            Err(ControllerError::RoutineNotRunning { .. })
        ));
        assert!(matches!(
            context.force_value("Valve 9", 1.0),
            Err(ControllerError::UnknownTag { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_parameters_are_reported() {
        let context = Arc::new(
            ControllerContext::new(Vec::new(), "E-stop", RoutinesConfig::default()).unwrap(),
        );
        context.register_routine(LeakCheck::NAME, LeakCheck::factory());
        let (_, mut rx) = context.subscribe();
        drain(&mut rx);

        let err = context
            .call_routine(LeakCheck::NAME, serde_json::json!({"name": "LEAK"}))
            .unwrap_err();
        assert!(matches!(err, ControllerError::RoutineSetup { .. }));
        assert!(context.running_routines().is_empty());
        match drain(&mut rx).as_slice() {
            [ControllerMessage::Results { status, data }] => {
                assert_eq!(*status, ResultStatus::Error);
                assert!(data.contains_key("errorMessage"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_deregister_ignores_stale_instances() {
        let context =
            ControllerContext::new(Vec::new(), "E-stop", RoutinesConfig::default()).unwrap();
        lock(&context.routines).insert(
            "LEAK".into(),
            RoutineEntry {
                instance: 2,
                control: Arc::new(RoutineControl::new()),
                plot: None,
            },
        );
        context.deregister_routine("LEAK", 1);
        assert_eq!(context.running_routines(), vec!["LEAK".to_string()]);
        assert_eq!(context.post_message(vec!["continue".into()]), 1);
        context.deregister_routine("LEAK", 2);
        assert!(context.running_routines().is_empty());
    }
}
