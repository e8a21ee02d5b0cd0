// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Multi-channel flow/pressure controller over Modbus/TCP
//!
//! Readings live in input registers and setpoints in holding registers. Points
//! are one register wide, or two when they carry an IEEE-754 float. Outputs are
//! written as one register image over the whole output span, with `0` in every
//! register no point is bound to.

use super::modbus_link::ModbusLink;
use super::{Adapter, AdapterError, AdapterSettings, IoImage};
use crate::devices::Category;

pub struct FlowControllerAdapter {
    name: String,
    link: ModbusLink,
    image: IoImage,
}

impl FlowControllerAdapter {
    pub fn new(name: &str, endpoint: String, unit_id: u8, settings: AdapterSettings) -> Self {
        Self {
            name: name.to_string(),
            link: ModbusLink::new(name, endpoint, unit_id, settings),
            image: IoImage::new(),
        }
    }
}

#[async_trait::async_trait]
impl Adapter for FlowControllerAdapter {
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
        self.link.connect().await
    }

    async fn disconnect(&mut self) {
        self.link.disconnect();
    }

    async fn read_all(&mut self) -> Result<(), AdapterError> {
        if let Some(group) = self.image.group(Category::AnalogIn) {
            if let Some(span) = group.span() {
                let words = self.link.read_input_registers(span).await?;
                group.load_words(&words)?;
            }
        }
        Ok(())
    }

    async fn write_all(&mut self) -> Result<(), AdapterError> {
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
