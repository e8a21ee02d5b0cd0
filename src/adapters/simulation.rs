// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Synthetic adapter used when the rig hardware is not available
//!
//! Each read cycle gives digital inputs a random state and analog inputs a
//! uniform value within their full scale, then pauses briefly so the poll loop
//! does not spin. Held points keep whatever value they were given, which lets
//! an operator force an interlock input without it flickering.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand::Rng;

use super::{Adapter, AdapterError, IoImage};
use crate::devices::{Category, STATUS_OK};

/// Pause at the end of every simulated read
pub const CYCLE_DELAY: Duration = Duration::from_millis(10);

pub struct SimulationAdapter {
    name: String,
    image: IoImage,
    held: HashSet<String>,
    cycle_delay: Duration,
}

impl SimulationAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            image: IoImage::new(),
            held: HashSet::new(),
            cycle_delay: CYCLE_DELAY,
        }
    }

    /// Synthetic stand-in for `adapter`, with a fresh copy of each of its devices
    pub fn mirror(adapter: &dyn Adapter) -> Self {
        let mut simulation = Self::new(adapter.name());
        for device in adapter.image().devices() {
            simulation.add_device(Arc::new(device.simulated_copy()));
        }
        debug!(
            "Simulating adapter '{}' with {} device(s)",
            adapter.name(),
            simulation.image.len()
        );
        simulation
    }

    pub fn with_cycle_delay(mut self, delay: Duration) -> Self {
        self.cycle_delay = delay;
        self
    }

    pub fn is_held(&self, tag: &str) -> bool {
        self.held.contains(tag)
    }
}

#[async_trait::async_trait]
impl Adapter for SimulationAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn image(&self) -> &IoImage {
        &self.image
    }

    fn image_mut(&mut self) -> &mut IoImage {
        &mut self.image
    }

    fn hold(&mut self, tag: &str, value: f64) -> bool {
        let Some(device) = self.image.device(tag) else {
            return false;
        };
        device.set_val(value);
        self.held.insert(tag.to_string());
        true
    }

    async fn connect(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn read_all(&mut self) -> Result<(), AdapterError> {
        {
            let mut rng = rand::rng();
            if let Some(group) = self.image.group(Category::DigitalIn) {
                for device in group.iter().filter(|d| !self.held.contains(d.tag())) {
                    device.set_status(STATUS_OK);
                    device.load_bit(rng.random_bool(0.5));
                }
            }
            if let Some(group) = self.image.group(Category::AnalogIn) {
                for device in group.iter().filter(|d| !self.held.contains(d.tag())) {
                    device.set_status(STATUS_OK);
                    let full_scale = device.full_scale().max(0.0);
                    device.set_val(rng.random_range(0.0..=full_scale));
                }
            }
        }
        tokio::time::sleep(self.cycle_delay).await;
        Ok(())
    }

    async fn write_all(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{AnalogEncoding, Device, DeviceKind, ScaleRange, Scaling};

    fn simulated_rig() -> SimulationAdapter {
        let mut adapter = SimulationAdapter::new("sim").with_cycle_delay(Duration::ZERO);
        adapter.add_device(Arc::new(Device::new(
            "E-stop",
            0,
            DeviceKind::DigitalIn,
            Scaling::default(),
        )));
        adapter.add_device(Arc::new(Device::new(
            "Pressure 1",
            0,
            DeviceKind::AnalogIn(AnalogEncoding::Status),
            Scaling::new(
                ScaleRange::new(4609.0, 23960.0),
                ScaleRange::new(972.0, 5040.0),
                Some(1500.0),
            ),
        )));
        adapter
    }

    #[tokio::test]
    async fn test_analog_values_stay_within_full_scale() {
        let mut adapter = simulated_rig();
        let pressure = adapter.image().device("Pressure 1").unwrap().clone();
        for _ in 0..50 {
            adapter.read_all().await.unwrap();
            let val = pressure.val();
            assert!((0.0..=1500.0 + 1e-6).contains(&val), "{val}");
            assert!(pressure.is_healthy());
        }
    }

    #[tokio::test]
    async fn test_held_device_keeps_its_value() {
        let mut adapter = simulated_rig();
        assert!(adapter.hold("E-stop", 1.0));
        assert!(!adapter.hold("Missing", 1.0));
        let estop = adapter.image().device("E-stop").unwrap().clone();
        for _ in 0..20 {
            adapter.read_all().await.unwrap();
            assert_eq!(estop.val(), 1.0);
        }
        estop.set_val(0.0);
        adapter.read_all().await.unwrap();
        assert_eq!(estop.val(), 0.0);
    }

    #[test]
    fn test_mirror_preserves_addresses_and_scaling() {
        let source = simulated_rig();
        let mirror = SimulationAdapter::mirror(&source);
        assert_eq!(mirror.name(), "sim");
        let original = source.image().device("Pressure 1").unwrap();
        let copy = mirror.image().device("Pressure 1").unwrap();
        assert!(!Arc::ptr_eq(original, copy));
        assert_eq!(copy.address(), original.address());
        assert_eq!(copy.scaling(), original.scaling());
        assert_eq!(mirror.image().span(Category::AnalogIn), source.image().span(Category::AnalogIn));
    }
}
