// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Rust rig controller library
//!
//! Polls remote I/O on a test rig, maps register values to engineering units,
//! detects emergency-stop edges, streams snapshots to operator consoles and
//! runs supervised test routines such as the leak check.

pub mod adapters;
pub mod config;
pub mod controller;
pub mod devices;
pub mod modbus;
pub mod routines;
