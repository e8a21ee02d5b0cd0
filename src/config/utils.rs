// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration utilities
//!
//! Validation of the rules serde cannot express on its own.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use log::{debug, warn};

use super::{AdapterKind, Config, PointConfig};
use crate::adapters::request_limit;
use crate::adapters::transducer_array::CHANNEL_COUNT;
use crate::devices::{AnalogEncoding, Category, DeviceKind};

/// Validates the configuration against rules that deserialisation cannot check
///
/// # Validation Rules
///
/// - **Names**: adapter names and device tags are unique across the topology
/// - **Transport**: hardware adapters have a `host`
/// - **Placement**: software points live on software adapters and hardware
///   points elsewhere; flow controllers and the transducer array carry analog
///   points only, coupler analog terminals are `[status, value]` pairs
/// - **Addresses**: address plus register width fits in 16 bits, transducer
///   channels stay below the request bitmask width, each Modbus category span
///   fits in a single request
/// - **Scaling**: scaled analog points have non-zero spans
/// - **Software points**: links resolve to existing tags, PID integral time and
///   lag time constants are positive
///
/// Leak-check wiring that points at missing tags only produces warnings, the
/// check reports the problem when it is started.
pub fn validate_specific_rules(config: &Config) -> Result<()> {
    debug!("Performing additional validation checks");

    let mut names = HashSet::new();
    let mut tags = HashSet::new();
    for adapter in &config.adapters {
        if !names.insert(adapter.name.as_str()) {
            anyhow::bail!("Duplicate adapter name: {}", adapter.name);
        }
        for device in &adapter.devices {
            if !tags.insert(device.tag.as_str()) {
                anyhow::bail!("Duplicate device tag: {}", device.tag);
            }
        }
    }

    for adapter in &config.adapters {
        if adapter.kind.is_hardware() && adapter.host.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("Adapter '{}' needs a host", adapter.name);
        }

        for device in &adapter.devices {
            let kind = device.kind();
            let software = kind == DeviceKind::Software;
            match adapter.kind {
                AdapterKind::Software if !software => anyhow::bail!(
                    "Device '{}' on software adapter '{}' is a hardware point",
                    device.tag,
                    adapter.name
                ),
                AdapterKind::Software => {}
                _ if software => anyhow::bail!(
                    "Software point '{}' must live on a software adapter",
                    device.tag
                ),
                AdapterKind::FlowController | AdapterKind::TransducerArray
                    if !matches!(kind.category(), Category::AnalogIn | Category::AnalogOut) =>
                {
                    anyhow::bail!(
                        "Adapter '{}' only carries analog points, '{}' is {}",
                        adapter.name,
                        device.tag,
                        kind.type_name()
                    )
                }
                AdapterKind::Coupler
                    if matches!(
                        kind,
                        DeviceKind::AnalogIn(encoding) | DeviceKind::AnalogOut(encoding)
                            if encoding != AnalogEncoding::Status
                    ) =>
                {
                    anyhow::bail!(
                        "Coupler '{}' frames analog terminals as [status, value] pairs, '{}' is {}",
                        adapter.name,
                        device.tag,
                        kind.type_name()
                    )
                }
                AdapterKind::TransducerArray if kind.category() != Category::AnalogIn => {
                    anyhow::bail!(
                        "Transducer array '{}' is read-only, '{}' is {}",
                        adapter.name,
                        device.tag,
                        kind.type_name()
                    )
                }
                _ => {}
            }

            if !software {
                let end = u32::from(device.address) + u32::from(kind.width());
                if end > 0x1_0000 {
                    anyhow::bail!(
                        "Device '{}' at address {} overruns the 16-bit register space",
                        device.tag,
                        device.address
                    );
                }
            }
            if adapter.kind == AdapterKind::TransducerArray && device.address >= CHANNEL_COUNT {
                anyhow::bail!(
                    "Transducer channel '{}' at address {} is beyond channel {}",
                    device.tag,
                    device.address,
                    CHANNEL_COUNT - 1
                );
            }

            if device.is_scaled() {
                let scaling = device.scaling();
                if !scaling.is_valid() {
                    anyhow::bail!("Device '{}' has a zero-width scaling range", device.tag);
                }
            }

            for link in device.point.links() {
                if !tags.contains(link) {
                    anyhow::bail!(
                        "Software point '{}' refers to unknown tag '{}'",
                        device.tag,
                        link
                    );
                }
            }
            match &device.point {
                PointConfig::Pid { t_i, .. } if *t_i <= 0.0 => {
                    anyhow::bail!("PID '{}' needs a positive integral time", device.tag)
                }
                PointConfig::Lag { time_constant, .. } if *time_constant <= 0.0 => {
                    anyhow::bail!("Lag '{}' needs a positive time constant", device.tag)
                }
                _ => {}
            }
        }

        if matches!(adapter.kind, AdapterKind::Coupler | AdapterKind::FlowController) {
            validate_request_spans(adapter)?;
        }
    }

    if !tags.contains(config.controller.estop_tag.as_str()) {
        warn!(
            "E-stop tag '{}' is not part of the topology",
            config.controller.estop_tag
        );
    }
    for tag in config.routines.leak_check.wiring.required_tags() {
        if !tags.contains(tag) {
            warn!("Leak check wiring refers to unknown tag '{}'", tag);
        }
    }

    Ok(())
}

/// Every category span of a Modbus adapter is read or written in one request
fn validate_request_spans(adapter: &super::AdapterConfig) -> Result<()> {
    let mut spans: BTreeMap<Category, (u32, u32)> = BTreeMap::new();
    for device in &adapter.devices {
        let kind = device.kind();
        let start = u32::from(device.address);
        let end = start + u32::from(kind.width()) - 1;
        spans
            .entry(kind.category())
            .and_modify(|(lo, hi)| {
                *lo = (*lo).min(start);
                *hi = (*hi).max(end);
            })
            .or_insert((start, end));
    }
    for (category, (lo, hi)) in spans {
        let Some(limit) = request_limit(category) else {
            continue;
        };
        let count = (hi - lo + 1) as usize;
        if count > limit {
            anyhow::bail!(
                "Adapter '{}' {:?} span {}..={} covers {} addresses, one request carries at most {}",
                adapter.name,
                category,
                lo,
                hi,
                count,
                limit
            );
        }
    }
    Ok(())
}
