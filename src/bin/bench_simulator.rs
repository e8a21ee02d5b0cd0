// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Serve a simulated bus coupler over Modbus/TCP
//!
//! The register map is laid out from the coupler adapter of the configuration
//! so the controller can be pointed at this process instead of the rig.
//! Analog inputs wander within their full scale, the E-stop input is held
//! clear, and coils or holding registers written by the controller are kept.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use rand::Rng;
use rust_rig_controller::config::{AdapterKind, Config};
use rust_rig_controller::devices::{Category, Device};
use rust_rig_controller::modbus::{serve, RegisterBank, SharedRegisterBank};
use tokio::net::TcpListener;

/// Simulated bus coupler for bench testing
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Configuration whose coupler adapter describes the register map
    #[clap(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Name of the coupler adapter to emulate, the first one by default
    #[clap(long)]
    adapter: Option<String>,

    /// Listen address
    #[clap(long, default_value = "127.0.0.1")]
    address: String,

    /// Listen port
    #[clap(long, default_value = "5020")]
    port: u16,

    /// Interval between two updates of the analog inputs, in milliseconds
    #[clap(long, default_value = "500")]
    update_ms: u64,
}

fn refresh(bank: &SharedRegisterBank, devices: &[Arc<Device>], estop_tag: &str) {
    let mut rng = rand::rng();
    let mut bank = bank.lock().unwrap_or_else(PoisonError::into_inner);
    for device in devices {
        match device.category() {
            Category::DigitalIn => {
                let bit = device.tag() == estop_tag || rng.random_bool(0.5);
                bank.set_discrete_input(device.address(), bit);
            }
            Category::AnalogIn => {
                let full_scale = device.full_scale().max(0.0);
                device.set_val(rng.random_range(0.0..=full_scale));
                bank.set_input_registers(device.address(), &device.output_registers());
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;
    let coupler = config
        .adapters
        .iter()
        .filter(|a| a.kind == AdapterKind::Coupler)
        .find(|a| args.adapter.as_ref().map_or(true, |name| &a.name == name))
        .context("No matching coupler adapter in the configuration")?;
    let devices: Vec<Arc<Device>> = coupler.devices.iter().map(|d| Arc::new(d.build())).collect();
    info!(
        "Emulating coupler '{}' with {} device(s)",
        coupler.name,
        devices.len()
    );

    let bank = RegisterBank::default().shared();
    let estop_tag = config.controller.estop_tag.clone();
    refresh(&bank, &devices, &estop_tag);

    let updater = {
        let bank = bank.clone();
        let period = Duration::from_millis(args.update_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                refresh(&bank, &devices, &estop_tag);
                debug!("Analog inputs refreshed");
            }
        })
    };

    let socket_addr: SocketAddr = format!("{}:{}", args.address, args.port)
        .parse()
        .context("Invalid socket address")?;
    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind {}", socket_addr))?;
    info!("Bench simulator listening on {}", socket_addr);

    tokio::select! {
        result = serve(listener, bank) => result.context("Modbus server failed")?,
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
    }
    updater.abort();
    Ok(())
}
