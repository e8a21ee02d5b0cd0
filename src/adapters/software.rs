// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Adapter hosting software points

use std::time::Duration;

use super::{Adapter, AdapterError, IoImage};

/// Pause at the end of every evaluation pass
pub const CYCLE_DELAY: Duration = Duration::from_millis(10);

/// Evaluates every software point once per cycle, in registration order
///
/// There is no dependency sorting: a point reads whatever its inputs held when
/// its turn comes, so topologies list producers before consumers.
pub struct SoftwareAdapter {
    name: String,
    image: IoImage,
    cycle_delay: Duration,
}

impl SoftwareAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            image: IoImage::new(),
            cycle_delay: CYCLE_DELAY,
        }
    }

    pub fn with_cycle_delay(mut self, delay: Duration) -> Self {
        self.cycle_delay = delay;
        self
    }
}

#[async_trait::async_trait]
impl Adapter for SoftwareAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn image(&self) -> &IoImage {
        &self.image
    }

    fn image_mut(&mut self) -> &mut IoImage {
        &mut self.image
    }

    async fn connect(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn read_all(&mut self) -> Result<(), AdapterError> {
        for device in self.image.devices() {
            device.calc();
        }
        tokio::time::sleep(self.cycle_delay).await;
        Ok(())
    }

    /// Software points have no transport to write to
    async fn write_all(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}
