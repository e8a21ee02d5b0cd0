// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use tokio_modbus::prelude::*;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Table {
    DiscreteInputs,
    Coils,
    InputRegisters,
    HoldingRegisters,
}

/// One-shot Modbus read for checking rig wiring
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Modbus server address
    #[clap(long, default_value = "127.0.0.1")]
    address: String,

    /// Modbus server port
    #[clap(long, default_value = "502")]
    port: u16,

    /// Unit identifier
    #[clap(long, default_value = "1")]
    unit_id: u8,

    /// Table to read
    #[clap(long, value_enum, default_value = "input-registers")]
    table: Table,

    /// Starting address
    #[clap(long, default_value = "0")]
    start: u16,

    /// Number of entries to read
    #[clap(long, default_value = "8")]
    quantity: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args = Args::parse();

    let socket_addr: SocketAddr = format!("{}:{}", args.address, args.port)
        .parse()
        .context("Invalid socket address")?;
    println!("Connecting to Modbus server at {}", socket_addr);

    let mut ctx = tcp::connect_slave(socket_addr, Slave(args.unit_id)).await?;

    println!(
        "Reading {} {:?} starting at address {}",
        args.quantity, args.table, args.start
    );
    let exception = |code: ExceptionCode| anyhow!("Server answered with exception {:?}", code);
    match args.table {
        Table::DiscreteInputs => {
            let bits = ctx
                .read_discrete_inputs(args.start, args.quantity)
                .await?
                .map_err(exception)?;
            print_bits(args.start, &bits);
        }
        Table::Coils => {
            let bits = ctx
                .read_coils(args.start, args.quantity)
                .await?
                .map_err(exception)?;
            print_bits(args.start, &bits);
        }
        Table::InputRegisters => {
            let words = ctx
                .read_input_registers(args.start, args.quantity)
                .await?
                .map_err(exception)?;
            print_words(args.start, &words);
        }
        Table::HoldingRegisters => {
            let words = ctx
                .read_holding_registers(args.start, args.quantity)
                .await?
                .map_err(exception)?;
            print_words(args.start, &words);
        }
    }

    ctx.disconnect().await?;
    Ok(())
}

fn print_bits(start: u16, bits: &[bool]) {
    for (offset, bit) in bits.iter().enumerate() {
        println!("{:>5}: {}", usize::from(start) + offset, u8::from(*bit));
    }
}

fn print_words(start: u16, words: &[u16]) {
    for (offset, word) in words.iter().enumerate() {
        println!(
            "{:>5}: {:>6}  0x{:04X}  {:>6}",
            usize::from(start) + offset,
            word,
            word,
            *word as i16
        );
    }
}
