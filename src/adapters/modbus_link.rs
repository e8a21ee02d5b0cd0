// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus/TCP client connection shared by the register-based adapters

use log::{debug, info, warn};
use tokio::time::{sleep, timeout};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

use super::{request_limit, AdapterError, AdapterSettings, Span};
use crate::devices::Category;

type Outcome<T> = Result<tokio_modbus::Result<T>, tokio::time::error::Elapsed>;

pub(crate) struct ModbusLink {
    adapter: String,
    endpoint: String,
    unit_id: u8,
    settings: AdapterSettings,
    context: Option<Context>,
}

impl ModbusLink {
    pub fn new(adapter: &str, endpoint: String, unit_id: u8, settings: AdapterSettings) -> Self {
        Self {
            adapter: adapter.to_string(),
            endpoint,
            unit_id,
            settings,
            context: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    /// Connect, retrying every `connect_retry` until the server answers
    pub async fn connect(&mut self) -> Result<(), AdapterError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            info!(
                "Adapter '{}' connecting to {} (attempt {})",
                self.adapter, self.endpoint, attempt
            );
            match Self::try_connect(&self.endpoint, self.settings.io_timeout, self.unit_id).await {
                Ok(context) => {
                    info!("Adapter '{}' connected to {}", self.adapter, self.endpoint);
                    self.context = Some(context);
                    return Ok(());
                }
                Err(reason) => {
                    warn!(
                        "Adapter '{}' unable to connect to {}: {}. Retrying in {:?}",
                        self.adapter, self.endpoint, reason, self.settings.connect_retry
                    );
                    sleep(self.settings.connect_retry).await;
                }
            }
        }
    }

    async fn try_connect(
        endpoint: &str,
        io_timeout: std::time::Duration,
        unit_id: u8,
    ) -> Result<Context, String> {
        let socket_addr = tokio::net::lookup_host(endpoint)
            .await
            .map_err(|e| e.to_string())?
            .next()
            .ok_or_else(|| format!("no address found for {}", endpoint))?;
        timeout(
            io_timeout,
            tcp::connect_slave(socket_addr, Slave(unit_id)),
        )
        .await
        .map_err(|_| "connection timed out".to_string())?
        .map_err(|e| e.to_string())
    }

    pub fn disconnect(&mut self) {
        if self.context.take().is_some() {
            debug!("Adapter '{}' disconnected from {}", self.adapter, self.endpoint);
        }
    }

    pub async fn read_discrete_inputs(&mut self, span: Span) -> Result<Vec<bool>, AdapterError> {
        let io_timeout = self.settings.io_timeout;
        let quantity = self.quantity(span.count(), Category::DigitalIn)?;
        let context = connected(&mut self.context, &self.adapter)?;
        let outcome = timeout(
            io_timeout,
            context.read_discrete_inputs(span.start, quantity),
        )
        .await;
        let bits = self.finish(outcome)?;
        if bits.is_empty() {
            return Err(AdapterError::connection(&self.adapter, "no digital input data received"));
        }
        Ok(bits)
    }

    pub async fn read_input_registers(&mut self, span: Span) -> Result<Vec<u16>, AdapterError> {
        let io_timeout = self.settings.io_timeout;
        let quantity = self.quantity(span.count(), Category::AnalogIn)?;
        let context = connected(&mut self.context, &self.adapter)?;
        let outcome = timeout(
            io_timeout,
            context.read_input_registers(span.start, quantity),
        )
        .await;
        let words = self.finish(outcome)?;
        if words.is_empty() {
            return Err(AdapterError::connection(&self.adapter, "no analog input data received"));
        }
        Ok(words)
    }

    pub async fn write_coils(&mut self, start: u16, bits: &[bool]) -> Result<(), AdapterError> {
        let io_timeout = self.settings.io_timeout;
        self.quantity(bits.len(), Category::DigitalOut)?;
        let context = connected(&mut self.context, &self.adapter)?;
        let outcome = timeout(io_timeout, context.write_multiple_coils(start, bits)).await;
        self.finish(outcome)
    }

    pub async fn write_registers(&mut self, start: u16, words: &[u16]) -> Result<(), AdapterError> {
        let io_timeout = self.settings.io_timeout;
        self.quantity(words.len(), Category::AnalogOut)?;
        let context = connected(&mut self.context, &self.adapter)?;
        let outcome = timeout(io_timeout, context.write_multiple_registers(start, words)).await;
        self.finish(outcome)
    }

    /// Request quantity, refused when one frame cannot carry it
    fn quantity(&self, count: usize, category: Category) -> Result<u16, AdapterError> {
        let limit = request_limit(category).unwrap_or(0);
        if count > limit {
            return Err(AdapterError::Protocol {
                adapter: self.adapter.clone(),
                reason: format!("{count} {category:?} addresses exceed the {limit} one request carries"),
            });
        }
        Ok(count as u16)
    }

    fn finish<T>(&self, outcome: Outcome<T>) -> Result<T, AdapterError> {
        match outcome {
            Err(_) => Err(AdapterError::ReadTimeout {
                adapter: self.adapter.clone(),
            }),
            Ok(Err(e)) => Err(AdapterError::connection(&self.adapter, e.to_string())),
            Ok(Ok(Err(code))) => Err(AdapterError::Exception {
                adapter: self.adapter.clone(),
                code: format!("{code:?}"),
            }),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}

fn connected<'a>(
    context: &'a mut Option<Context>,
    adapter: &str,
) -> Result<&'a mut Context, AdapterError> {
    context
        .as_mut()
        .ok_or_else(|| AdapterError::connection(adapter, "not connected"))
}
