// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Protocol adapters
//!
//! An adapter owns the devices wired to one piece of remote I/O and speaks its
//! wire protocol. Every adapter follows the same contract:
//! - `connect()` retries on a fixed interval until the transport is up
//! - `read_all()` issues one batched read per non-empty input category and
//!   hands the words to the devices by address offset
//! - `write_all()` issues one batched write per non-empty output category
//!
//! Available variants:
//! - [`SimulationAdapter`]: synthetic values, no transport
//! - [`SoftwareAdapter`]: evaluates software points in registration order
//! - [`CouplerAdapter`]: block-register fieldbus coupler over Modbus/TCP
//! - [`TransducerArrayAdapter`]: line-protocol pressure transducer array
//! - [`FlowControllerAdapter`]: variable-length register flow/pressure controller

pub mod coupler;
pub mod flow_controller;
pub mod io_image;
mod modbus_link;
pub mod simulation;
pub mod software;
pub mod transducer_array;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{AdapterConfig, AdapterKind};
use crate::devices::{Device, DeviceError};

pub use coupler::CouplerAdapter;
pub use flow_controller::FlowControllerAdapter;
pub use io_image::{request_limit, DeviceGroup, IoImage, Span};
pub use simulation::SimulationAdapter;
pub use software::SoftwareAdapter;
pub use transducer_array::TransducerArrayAdapter;

/// Adapter errors
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Adapter '{adapter}' lost its connection: {reason}")]
    ConnectionFailure { adapter: String, reason: String },

    #[error("Adapter '{adapter}' timed out waiting for a response")]
    ReadTimeout { adapter: String },

    #[error("Adapter '{adapter}' received a malformed response: {reason}")]
    Protocol { adapter: String, reason: String },

    #[error("Adapter '{adapter}' request rejected with exception {code}")]
    Exception { adapter: String, code: String },

    #[error("Adapter '{adapter}' has no host configured")]
    MissingHost { adapter: String },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// The transport is gone and every adapter must be reconnected
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            AdapterError::ConnectionFailure { .. }
                | AdapterError::ReadTimeout { .. }
                | AdapterError::Io(_)
        )
    }

    pub(crate) fn connection(adapter: &str, reason: impl Into<String>) -> Self {
        AdapterError::ConnectionFailure {
            adapter: adapter.to_string(),
            reason: reason.into(),
        }
    }
}

/// Transport timing shared by every adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Pause between two connection attempts
    pub connect_retry: Duration,
    /// Deadline for a single request/response exchange
    pub io_timeout: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            connect_retry: Duration::from_secs(1),
            io_timeout: Duration::from_secs(5),
        }
    }
}

/// Protocol adapter trait for hardware abstraction
#[async_trait::async_trait]
pub trait Adapter: Send {
    /// Adapter name, unique within a topology
    fn name(&self) -> &str;

    /// Devices bound to this adapter
    fn image(&self) -> &IoImage;

    fn image_mut(&mut self) -> &mut IoImage;

    /// Bind a device to this adapter
    fn add_device(&mut self, device: Arc<Device>) {
        self.image_mut().add_device(device);
    }

    /// Pin a device to `value` so reads leave it alone
    ///
    /// Only synthetic adapters can do this; returns `false` when the tag is
    /// not bound here or the adapter reads real hardware.
    fn hold(&mut self, _tag: &str, _value: f64) -> bool {
        false
    }

    /// Establish the transport, retrying until it succeeds
    async fn connect(&mut self) -> Result<(), AdapterError>;

    /// Release the transport
    async fn disconnect(&mut self) {}

    /// Refresh every input device
    async fn read_all(&mut self) -> Result<(), AdapterError>;

    /// Push every output device
    async fn write_all(&mut self) -> Result<(), AdapterError>;
}

/// Create the adapter described by `config` around already built devices
pub fn create_adapter(
    config: &AdapterConfig,
    devices: Vec<Arc<Device>>,
    settings: AdapterSettings,
) -> Result<Box<dyn Adapter>, AdapterError> {
    let mut adapter: Box<dyn Adapter> = match config.kind {
        AdapterKind::Simulation => Box::new(SimulationAdapter::new(&config.name)),
        AdapterKind::Software => Box::new(SoftwareAdapter::new(&config.name)),
        AdapterKind::Coupler => Box::new(CouplerAdapter::new(
            &config.name,
            config.endpoint().ok_or_else(|| missing_host(config))?,
            config.unit_id,
            settings,
        )),
        AdapterKind::TransducerArray => Box::new(TransducerArrayAdapter::new(
            &config.name,
            config.endpoint().ok_or_else(|| missing_host(config))?,
            settings,
        )),
        AdapterKind::FlowController => Box::new(FlowControllerAdapter::new(
            &config.name,
            config.endpoint().ok_or_else(|| missing_host(config))?,
            config.unit_id,
            settings,
        )),
    };
    for device in devices {
        adapter.add_device(device);
    }
    Ok(adapter)
}

fn missing_host(config: &AdapterConfig) -> AdapterError {
    AdapterError::MissingHost {
        adapter: config.name.clone(),
    }
}
