// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! The read / publish / write cycle
//!
//! Any adapter error ends the cycle and restarts the loop: every adapter is
//! disconnected and connected again before polling resumes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;

use super::subscribers::{ControlEvent, StreamMode};
use super::ControllerContext;
use crate::adapters::{Adapter, AdapterError};
use crate::devices::{Device, StatusValue};

/// Pause after a connection attempt that failed outright
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Adapters plus the state the cycle carries between iterations
pub struct PollLoop {
    context: Arc<ControllerContext>,
    adapters: Vec<Box<dyn Adapter>>,
    connected: bool,
}

impl PollLoop {
    pub fn new(context: Arc<ControllerContext>, adapters: Vec<Box<dyn Adapter>>) -> Self {
        Self {
            context,
            adapters,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn adapters(&self) -> &[Box<dyn Adapter>] {
        &self.adapters
    }

    /// Connect every adapter in order, each retrying until it succeeds
    pub async fn connect_all(&mut self) -> Result<(), AdapterError> {
        info!("Connecting to remote devices...");
        for adapter in &mut self.adapters {
            adapter.connect().await?;
        }
        self.connected = true;
        Ok(())
    }

    pub async fn disconnect_all(&mut self) {
        for adapter in &mut self.adapters {
            adapter.disconnect().await;
        }
        self.connected = false;
    }

    /// One full cycle: read, detect E-stop edges, publish, write
    pub async fn cycle(&mut self) -> Result<(), AdapterError> {
        for adapter in &mut self.adapters {
            adapter.read_all().await?;
        }

        self.check_estop();
        self.publish();

        for adapter in &mut self.adapters {
            adapter.write_all().await?;
        }
        Ok(())
    }

    fn check_estop(&self) {
        let Ok(estop) = self.context.device(self.context.estop_tag()) else {
            return;
        };
        let clear = estop.val() != 0.0;
        let was_clear = self.context.swap_estop_clear(clear);
        if was_clear && !clear {
            warn!("E-stop triggered");
            self.context.control_message(ControlEvent::EstopOn);
        } else if clear && !was_clear {
            info!("E-stop cleared");
            self.context.control_message(ControlEvent::EstopOff);
        }
    }

    fn publish(&self) {
        let plots: Vec<_> = self
            .context
            .plot_sources()
            .into_iter()
            .map(|source| source())
            .collect();

        let mut subscribers = self.context.subscribers();
        let snapshots: Vec<_> = subscribers
            .requested_modes()
            .into_iter()
            .map(|mode| (mode, snapshot(self.context.devices(), mode)))
            .collect();
        let plots = if subscribers.wants_plot() { plots } else { Vec::new() };
        subscribers.publish(&snapshots, &plots);
    }

    /// Poll until `shutdown` flips or its sender is dropped, restarting on any
    /// adapter error
    ///
    /// Reconnects when needed. Returns the adapters, disconnected, so the loop
    /// can be started again.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        info!("Starting main loop");
        while !*shutdown.borrow() && shutdown.has_changed().is_ok() {
            if !self.connected {
                tokio::select! {
                    result = self.connect_all() => {
                        if let Err(err) = result {
                            error!("Connection failed: {}", err);
                            tokio::time::sleep(RETRY_PAUSE).await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
            if let Err(err) = self.cycle().await {
                error!("Connection error in main loop: {}. Restarting...", err);
                self.disconnect_all().await;
            }
        }
        info!("Main loop stopped");
        self.disconnect_all().await;
        self
    }
}

/// `{tag: value}` for every device in the requested flavour
pub fn snapshot<'a>(
    devices: impl Iterator<Item = &'a Arc<Device>>,
    mode: StreamMode,
) -> BTreeMap<String, StatusValue> {
    devices
        .map(|device| {
            let value = match mode {
                StreamMode::Scaled => device.val_status(),
                StreamMode::Raw => StatusValue::Value(device.raw()),
                StreamMode::Average => StatusValue::Value(device.log_average()),
                StreamMode::Stddev => StatusValue::Value(device.log_stddev()),
            };
            (device.tag().to_string(), value)
        })
        .collect()
}
