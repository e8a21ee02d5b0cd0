// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Block-register fieldbus coupler
//!
//! The coupler maps its terminals onto four Modbus tables: discrete inputs,
//! coils, input registers and holding registers. Each cycle reads the whole
//! digital-input span and the whole analog-input span in one request each,
//! then writes the full coil and holding-register spans back. Analog terminals
//! occupy a `[status, value]` register pair.

use log::debug;

use super::modbus_link::ModbusLink;
use super::{Adapter, AdapterError, AdapterSettings, IoImage};
use crate::devices::Category;

pub struct CouplerAdapter {
    name: String,
    link: ModbusLink,
    image: IoImage,
}

impl CouplerAdapter {
    /// Coupler reachable at `endpoint` (`host:port`)
    pub fn new(name: &str, endpoint: String, unit_id: u8, settings: AdapterSettings) -> Self {
        Self {
            name: name.to_string(),
            link: ModbusLink::new(name, endpoint, unit_id, settings),
            image: IoImage::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.link.endpoint()
    }
}

#[async_trait::async_trait]
impl Adapter for CouplerAdapter {
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
        debug!(
            "Coupler '{}' spans: d-in {:?}, d-out {:?}, a-in {:?}, a-out {:?}",
            self.name,
            self.image.span(Category::DigitalIn),
            self.image.span(Category::DigitalOut),
            self.image.span(Category::AnalogIn),
            self.image.span(Category::AnalogOut)
        );
        self.link.connect().await
    }

    async fn disconnect(&mut self) {
        self.link.disconnect();
    }

    async fn read_all(&mut self) -> Result<(), AdapterError> {
        if let Some(group) = self.image.group(Category::DigitalIn) {
            if let Some(span) = group.span() {
                let bits = self.link.read_discrete_inputs(span).await?;
                group.load_bits(&bits)?;
            }
        }
        if let Some(group) = self.image.group(Category::AnalogIn) {
            if let Some(span) = group.span() {
                let words = self.link.read_input_registers(span).await?;
                group.load_words(&words)?;
            }
        }
        Ok(())
    }

    async fn write_all(&mut self) -> Result<(), AdapterError> {
        if let Some(group) = self.image.group(Category::DigitalOut) {
            if let Some(span) = group.span() {
                self.link.write_coils(span.start, &group.output_bits()).await?;
            }
        }
        if let Some(group) = self.image.group(Category::AnalogOut) {
            if let Some(span) = group.span() {
                self.link
                    .write_registers(span.start, &group.output_words())
                    .await?;
            }
        }
        Ok(())
    }
}
