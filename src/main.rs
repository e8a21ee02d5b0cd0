// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the rig controller daemon
use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use rust_rig_controller::config::Config;
use rust_rig_controller::controller::{load_calibration, Controller, ControllerMessage};

use std::path::PathBuf;
use tokio::signal;

/// Process-control controller for remote I/O test rigs
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (YAML format)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Replace every hardware adapter with a synthetic one
    #[arg(long)]
    simulation: bool,

    /// Calibration table (JSON) applied at startup
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Path to a configuration to validate and exit
    #[arg(long)]
    validate_config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    // Validate configuration file if --validate-config is set
    if let Some(validate_path) = args.validate_config {
        if !validate_path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file does not exist: {}",
                validate_path.display()
            ));
        }

        Config::from_file(&validate_path)
            .map_err(|err| anyhow::anyhow!("Configuration validation failed: {:#}", err))?;
        println!("Configuration file is valid: {}", validate_path.display());
        return Ok(());
    }

    let mut config = Config::from_file(&args.config)?;
    config.apply_args(args.simulation, args.calibration.clone());

    let mut controller =
        Controller::from_config(&config).context("Failed to build the controller")?;

    if let Some(path) = &config.controller.calibration_file {
        let entries = load_calibration(path)?;
        controller.apply_calibration(&entries);
    }

    // Log what a console would see
    let (_, mut messages) = controller.subscribe();
    let monitor = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            match message {
                ControllerMessage::Data(_) | ControllerMessage::Plot(_) => debug!("{}", message),
                ControllerMessage::Error(_) => warn!("{}", message),
                _ => info!("{}", message),
            }
        }
    });

    info!("Starting rig controller");
    tokio::select! {
        result = controller.start() => result?,
        _ = signal::ctrl_c() => {
            info!("Interrupted while connecting to the rig");
            monitor.abort();
            return Ok(());
        }
    }

    // Wait for termination signal
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal, stopping controller"),
        Err(err) => eprintln!("Error waiting for shutdown signal: {}", err),
    }
    controller.stop().await;
    monitor.abort();

    Ok(())
}
