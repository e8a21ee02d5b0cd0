// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! In-process Modbus/TCP server standing in for a bus coupler
//!
//! Used by the `bench_simulator` binary and by the adapter integration tests.
//!
//! ## Tables
//!
//! | Table             | Requests                                   | Written by    |
//! |-------------------|--------------------------------------------|---------------|
//! | Discrete inputs   | `ReadDiscreteInputs`                       | bench side    |
//! | Coils             | `ReadCoils`, `WriteSingleCoil`, `WriteMultipleCoils` | controller |
//! | Input registers   | `ReadInputRegisters`                       | bench side    |
//! | Holding registers | `ReadHoldingRegisters`, `WriteSingleRegister`, `WriteMultipleRegisters` | controller |
//!
//! ```no_run
//! use rust_rig_controller::modbus::{serve, RegisterBank};
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> std::io::Result<()> {
//! let bank = RegisterBank::default().shared();
//! bank.lock().unwrap().set_discrete_input(0, true);
//! let listener = TcpListener::bind("127.0.0.1:5020").await?;
//! serve(listener, bank).await
//! # }
//! ```

pub mod register_bank;
pub use register_bank::{serve, RegisterBank, RegisterBankServer, SharedRegisterBank};
