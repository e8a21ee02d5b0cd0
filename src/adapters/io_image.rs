// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Per-adapter I/O image
//!
//! Devices bound to an adapter are grouped by [`Category`] and ordered by
//! address. Each group keeps the contiguous address span covering all of its
//! devices so an adapter can refresh the whole group with one bulk request.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::warn;

use crate::devices::{Category, Device, DeviceError};

/// Inclusive address range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u16,
    pub end: u16,
}

impl Span {
    /// Number of addresses covered
    pub fn count(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn contains(&self, address: u16) -> bool {
        (self.start..=self.end).contains(&address)
    }
}

/// Largest quantity one Modbus request may carry for a category
///
/// Read discrete inputs: 2000 bits, write multiple coils: 1968 bits, read
/// input registers: 125 words, write multiple registers: 123 words.
pub fn request_limit(category: Category) -> Option<usize> {
    match category {
        Category::DigitalIn => Some(2000),
        Category::DigitalOut => Some(1968),
        Category::AnalogIn => Some(125),
        Category::AnalogOut => Some(123),
        Category::Software => None,
    }
}

/// Devices of one category, keyed by address
#[derive(Debug, Default)]
pub struct DeviceGroup {
    devices: BTreeMap<u16, Arc<Device>>,
    span: Option<Span>,
}

impl DeviceGroup {
    fn insert(&mut self, device: Arc<Device>) {
        if let Some(previous) = self.devices.insert(device.address(), device.clone()) {
            warn!(
                "Device '{}' replaces '{}' at address {}",
                device.tag(),
                previous.tag(),
                device.address()
            );
        }
        self.span = self.compute_span();
    }

    fn compute_span(&self) -> Option<Span> {
        let start = *self.devices.keys().next()?;
        let end = self
            .devices
            .values()
            .map(|d| d.address().saturating_add(d.width() - 1))
            .max()?;
        Some(Span { start, end })
    }

    pub fn span(&self) -> Option<Span> {
        self.span
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Devices in ascending address order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<Device>> + '_ {
        self.devices.values()
    }

    /// Refresh every device from a word image starting at the span start
    pub fn load_words(&self, words: &[u16]) -> Result<(), DeviceError> {
        let Some(span) = self.span else {
            return Ok(());
        };
        for device in self.devices.values() {
            let offset = (device.address() - span.start) as usize;
            let slice = words.get(offset..).unwrap_or(&[]);
            device.load_registers(slice)?;
        }
        Ok(())
    }

    /// Refresh every device from a bit image starting at the span start
    pub fn load_bits(&self, bits: &[bool]) -> Result<(), DeviceError> {
        let Some(span) = self.span else {
            return Ok(());
        };
        for device in self.devices.values() {
            let offset = (device.address() - span.start) as usize;
            match bits.get(offset) {
                Some(bit) => device.load_bit(*bit),
                None => {
                    return Err(DeviceError::ShortFrame {
                        tag: device.tag().to_string(),
                        expected: offset + 1,
                        got: bits.len(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Word image over the whole span; unbound addresses are `0`
    pub fn output_words(&self) -> Vec<u16> {
        let Some(span) = self.span else {
            return Vec::new();
        };
        let mut words = vec![0u16; span.count()];
        for device in self.devices.values() {
            let offset = (device.address() - span.start) as usize;
            for (slot, word) in words[offset..].iter_mut().zip(device.output_registers()) {
                *slot = word;
            }
        }
        words
    }

    /// Bit image over the whole span; unbound addresses are `false`
    pub fn output_bits(&self) -> Vec<bool> {
        let Some(span) = self.span else {
            return Vec::new();
        };
        let mut bits = vec![false; span.count()];
        for device in self.devices.values() {
            bits[(device.address() - span.start) as usize] = device.bit();
        }
        bits
    }
}

/// All devices bound to one adapter
#[derive(Debug, Default)]
pub struct IoImage {
    devices: Vec<Arc<Device>>,
    digital_in: DeviceGroup,
    digital_out: DeviceGroup,
    analog_in: DeviceGroup,
    analog_out: DeviceGroup,
}

impl IoImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device; spans are recomputed immediately
    pub fn add_device(&mut self, device: Arc<Device>) {
        match device.category() {
            Category::DigitalIn => self.digital_in.insert(device.clone()),
            Category::DigitalOut => self.digital_out.insert(device.clone()),
            Category::AnalogIn => self.analog_in.insert(device.clone()),
            Category::AnalogOut => self.analog_out.insert(device.clone()),
            Category::Software => {}
        }
        self.devices.push(device);
    }

    /// Every device in registration order
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, tag: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.tag() == tag)
    }

    /// Group of a hardware category; software points have no group
    pub fn group(&self, category: Category) -> Option<&DeviceGroup> {
        match category {
            Category::DigitalIn => Some(&self.digital_in),
            Category::DigitalOut => Some(&self.digital_out),
            Category::AnalogIn => Some(&self.analog_in),
            Category::AnalogOut => Some(&self.analog_out),
            Category::Software => None,
        }
    }

    pub fn span(&self, category: Category) -> Option<Span> {
        self.group(category).and_then(DeviceGroup::span)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{AnalogEncoding, DeviceKind, Scaling};

    fn device(tag: &str, address: u16, kind: DeviceKind) -> Arc<Device> {
        Arc::new(Device::new(tag, address, kind, Scaling::identity(0.0, 1000.0)))
    }

    #[test]
    fn test_span_covers_widest_device() {
        let mut image = IoImage::new();
        image.add_device(device("A", 4, DeviceKind::AnalogIn(AnalogEncoding::Status)));
        image.add_device(device("B", 0, DeviceKind::AnalogIn(AnalogEncoding::Status)));
        image.add_device(device("C", 40, DeviceKind::AnalogIn(AnalogEncoding::Status)));
        assert_eq!(image.span(Category::AnalogIn), Some(Span { start: 0, end: 41 }));
        assert_eq!(image.span(Category::AnalogIn).unwrap().count(), 42);
        assert_eq!(image.span(Category::DigitalIn), None);
    }

    #[test]
    fn test_span_tracks_device_additions() {
        let mut image = IoImage::new();
        image.add_device(device("V1", 3, DeviceKind::DigitalOut));
        assert_eq!(image.span(Category::DigitalOut), Some(Span { start: 3, end: 3 }));
        image.add_device(device("V2", 1, DeviceKind::DigitalOut));
        assert_eq!(image.span(Category::DigitalOut), Some(Span { start: 1, end: 3 }));
    }

    #[test]
    fn test_output_words_fill_gaps_with_zero() {
        let mut image = IoImage::new();
        let a = device("A", 10, DeviceKind::AnalogOut(AnalogEncoding::Status));
        let b = device("B", 14, DeviceKind::AnalogOut(AnalogEncoding::Status));
        a.set_val(7.0);
        b.set_val(9.0);
        image.add_device(a);
        image.add_device(b);
        let group = image.group(Category::AnalogOut).unwrap();
        assert_eq!(group.output_words(), vec![0, 7, 0, 0, 0, 9]);
    }

    #[test]
    fn test_full_address_range_span() {
        let mut image = IoImage::new();
        image.add_device(device("First", 0, DeviceKind::DigitalIn));
        image.add_device(device("Last", 0xFFFF, DeviceKind::DigitalIn));
        let span = image.span(Category::DigitalIn).unwrap();
        assert_eq!(span, Span { start: 0, end: 0xFFFF });
        assert_eq!(span.count(), 0x1_0000);
        assert!(span.count() > request_limit(Category::DigitalIn).unwrap());
    }

    #[test]
    fn test_output_bits_fill_gaps_with_false() {
        let mut image = IoImage::new();
        let v1 = device("V1", 0, DeviceKind::DigitalOut);
        let v3 = device("V3", 2, DeviceKind::DigitalOut);
        v3.on();
        image.add_device(v1);
        image.add_device(v3);
        let group = image.group(Category::DigitalOut).unwrap();
        assert_eq!(group.output_bits(), vec![false, false, true]);
    }

    #[test]
    fn test_load_words_slices_by_address() {
        let mut image = IoImage::new();
        let a = device("A", 0, DeviceKind::AnalogIn(AnalogEncoding::Status));
        let b = device("B", 4, DeviceKind::AnalogIn(AnalogEncoding::Status));
        image.add_device(a.clone());
        image.add_device(b.clone());
        let group = image.group(Category::AnalogIn).unwrap();
        group.load_words(&[0, 100, 9, 9, 0x41, 250]).unwrap();
        assert_eq!(a.raw(), 100.0);
        assert!(a.is_healthy());
        assert_eq!(b.raw(), 250.0);
        assert!(!b.is_healthy());

        assert!(group.load_words(&[0, 100, 9]).is_err());
    }

    #[test]
    fn test_registration_order_is_kept() {
        let mut image = IoImage::new();
        image.add_device(device("Z", 9, DeviceKind::DigitalIn));
        image.add_device(device("A", 1, DeviceKind::DigitalIn));
        let tags: Vec<_> = image.devices().iter().map(|d| d.tag().to_string()).collect();
        assert_eq!(tags, vec!["Z", "A"]);
        assert!(image.device("A").is_some());
    }
}
