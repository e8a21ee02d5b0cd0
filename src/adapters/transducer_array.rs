// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Line-protocol pressure transducer array
//!
//! The array answers a plain TCP request `r<mask>0`, where `<mask>` is a
//! four-digit hexadecimal channel bitmask, with one 12-character ASCII decimal
//! field per selected channel, highest channel first. Readings are in psi and
//! are handed to the devices in mbar.
//!
//! A read timeout only skips the cycle; any other socket error is reported as a
//! connection failure so the controller resynchronises every adapter. Bytes of
//! a response that arrived after its deadline are discarded before the next
//! request goes out.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use super::{Adapter, AdapterError, AdapterSettings, IoImage};
use crate::devices::{Category, Device};

/// Conversion factor from psi to mbar
pub const PSI_TO_MBAR: f64 = 68.947573;

/// Width of one channel field in a response
pub const FIELD_WIDTH: usize = 12;

/// Number of channels addressable by the bitmask
pub const CHANNEL_COUNT: u16 = 16;

/// Build the request string for the given channel addresses
pub fn channel_request(addresses: impl IntoIterator<Item = u16>) -> String {
    let mask = addresses
        .into_iter()
        .filter(|a| *a < CHANNEL_COUNT)
        .fold(0u16, |mask, a| mask | (1 << a));
    format!("r{mask:04x}0")
}

/// Parse `count` fixed-width fields into mbar readings
pub fn parse_frame(frame: &[u8], count: usize) -> Result<Vec<f64>, String> {
    let needed = count * FIELD_WIDTH;
    if frame.len() < needed {
        return Err(format!(
            "expected {} bytes for {} channels, got {}",
            needed,
            count,
            frame.len()
        ));
    }
    frame
        .chunks(FIELD_WIDTH)
        .take(count)
        .map(|field| {
            let text = std::str::from_utf8(field).map_err(|e| e.to_string())?;
            text.trim()
                .parse::<f64>()
                .map(|psi| psi * PSI_TO_MBAR)
                .map_err(|e| format!("invalid field '{}': {}", text.trim(), e))
        })
        .collect()
}

pub struct TransducerArrayAdapter {
    name: String,
    endpoint: String,
    settings: AdapterSettings,
    image: IoImage,
    channels: Vec<Arc<Device>>,
    request: String,
    stream: Option<TcpStream>,
}

impl TransducerArrayAdapter {
    pub fn new(name: &str, endpoint: String, settings: AdapterSettings) -> Self {
        Self {
            name: name.to_string(),
            endpoint,
            settings,
            image: IoImage::new(),
            channels: Vec::new(),
            request: channel_request([]),
            stream: None,
        }
    }

    /// Request string sent every cycle
    pub fn request(&self) -> &str {
        &self.request
    }

    fn build_request(&mut self) {
        self.channels = self
            .image
            .group(Category::AnalogIn)
            .map(|group| group.iter().rev().cloned().collect())
            .unwrap_or_default();
        self.request = channel_request(self.channels.iter().map(|d| d.address()));
        debug!(
            "Transducer array '{}' request {} for {} channel(s)",
            self.name,
            self.request,
            self.channels.len()
        );
    }

    /// Drop whatever a late response left in the socket
    fn discard_stale(&mut self) -> Result<(), AdapterError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| AdapterError::connection(&self.name, "not connected"))?;
        let mut buffer = [0u8; 1024];
        let mut discarded = 0;
        loop {
            match stream.try_read(&mut buffer) {
                Ok(0) => {
                    return Err(AdapterError::connection(&self.name, "connection closed by peer"))
                }
                Ok(n) => discarded += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(AdapterError::connection(&self.name, e.to_string())),
            }
        }
        if discarded > 0 {
            debug!(
                "Adapter '{}' discarded {} stale byte(s)",
                self.name, discarded
            );
        }
        Ok(())
    }

    async fn receive_frame(&mut self) -> Result<Option<Vec<u8>>, AdapterError> {
        let needed = self.channels.len() * FIELD_WIDTH;
        let deadline = Instant::now() + self.settings.io_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| AdapterError::connection(&self.name, "not connected"))?;

        let mut frame = Vec::with_capacity(needed);
        let mut buffer = [0u8; 1024];
        while frame.len() < needed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wanted = (needed - frame.len()).min(buffer.len());
            match timeout(remaining, stream.read(&mut buffer[..wanted])).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(AdapterError::connection(&self.name, e.to_string())),
                Ok(Ok(0)) => {
                    return Err(AdapterError::connection(&self.name, "connection closed by peer"))
                }
                Ok(Ok(n)) => frame.extend_from_slice(&buffer[..n]),
            }
        }
        Ok(Some(frame))
    }
}

#[async_trait::async_trait]
impl Adapter for TransducerArrayAdapter {
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
        self.build_request();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            info!(
                "Adapter '{}' connecting to {} (attempt {})",
                self.name, self.endpoint, attempt
            );
            match timeout(self.settings.io_timeout, TcpStream::connect(&self.endpoint)).await {
                Ok(Ok(stream)) => {
                    info!("Adapter '{}' connected to {}", self.name, self.endpoint);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Ok(Err(e)) => warn!(
                    "Adapter '{}' unable to connect to {}: {}. Retrying in {:?}",
                    self.name, self.endpoint, e, self.settings.connect_retry
                ),
                Err(_) => warn!(
                    "Adapter '{}' connection to {} timed out. Retrying in {:?}",
                    self.name, self.endpoint, self.settings.connect_retry
                ),
            }
            sleep(self.settings.connect_retry).await;
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Adapter '{}' disconnected from {}", self.name, self.endpoint);
        }
    }

    async fn read_all(&mut self) -> Result<(), AdapterError> {
        if self.channels.is_empty() {
            return Ok(());
        }
        self.discard_stale()?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| AdapterError::connection(&self.name, "not connected"))?;
        stream
            .write_all(self.request.as_bytes())
            .await
            .map_err(|e| AdapterError::connection(&self.name, e.to_string()))?;

        let Some(frame) = self.receive_frame().await? else {
            warn!(
                "Adapter '{}' timed out reading from {}; skipping this cycle",
                self.name, self.endpoint
            );
            return Ok(());
        };

        let readings = parse_frame(&frame, self.channels.len()).map_err(|reason| {
            AdapterError::Protocol {
                adapter: self.name.clone(),
                reason,
            }
        })?;
        for (device, reading) in self.channels.iter().zip(readings) {
            device.set_raw(reading);
        }
        Ok(())
    }

    async fn write_all(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}
