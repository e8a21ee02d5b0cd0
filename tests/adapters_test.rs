// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Adapters against in-process servers over real TCP
//!
//! The coupler and the flow controller talk to a register bank served on
//! `127.0.0.1:0`; the transducer array talks to a plain listener answering
//! the line protocol.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use rust_rig_controller::adapters::transducer_array::PSI_TO_MBAR;
use rust_rig_controller::adapters::{
    Adapter, AdapterError, AdapterSettings, CouplerAdapter, FlowControllerAdapter,
    TransducerArrayAdapter,
};
use rust_rig_controller::devices::scaling::encode_float;
use rust_rig_controller::devices::{
    AnalogEncoding, Device, DeviceKind, ScaleRange, Scaling, STATUS_OVERRANGE,
};
use rust_rig_controller::modbus::{serve, RegisterBank, SharedRegisterBank};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn settings() -> AdapterSettings {
    AdapterSettings {
        connect_retry: Duration::from_millis(50),
        io_timeout: Duration::from_millis(500),
    }
}

/// Serve `bank` in the background and return its address
async fn start_register_bank(bank: SharedRegisterBank) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Err(e) = serve(listener, bank).await {
            eprintln!("Server error: {}", e);
        }
    });
    socket_addr
}

fn device(tag: &str, address: u16, kind: DeviceKind, scaling: Scaling) -> Arc<Device> {
    Arc::new(Device::new(tag, address, kind, scaling))
}

#[tokio::test]
async fn test_coupler_reads_and_writes_every_table() {
    let mut bank = RegisterBank::default();
    bank.set_discrete_input(0, true);
    bank.set_discrete_input(1, false);
    bank.set_input_registers(0, &[0, 16383, STATUS_OVERRANGE, 32767]);
    let bank = bank.shared();
    let socket_addr = start_register_bank(bank.clone()).await;

    let estop = device("E-stop", 0, DeviceKind::DigitalIn, Scaling::default());
    let door = device("Door", 1, DeviceKind::DigitalIn, Scaling::default());
    let pressure = device(
        "Pressure 1",
        0,
        DeviceKind::AnalogIn(AnalogEncoding::Status),
        Scaling::default(),
    );
    let thermocouple = device(
        "Thermocouple",
        2,
        DeviceKind::AnalogIn(AnalogEncoding::Status),
        Scaling::default(),
    );
    let valve = device("Valve 2", 1, DeviceKind::DigitalOut, Scaling::default());
    let heater = device(
        "Heater",
        0,
        DeviceKind::AnalogOut(AnalogEncoding::Status),
        Scaling::default(),
    );

    let mut coupler = CouplerAdapter::new("coupler", socket_addr.to_string(), 1, settings());
    for d in [&estop, &door, &pressure, &thermocouple, &valve, &heater] {
        coupler.add_device(d.clone());
    }
    coupler.connect().await.unwrap();
    coupler.read_all().await.unwrap();

    assert_eq!(estop.val(), 1.0);
    assert_eq!(door.val(), 0.0);
    assert_eq!(pressure.raw(), 16383.0);
    assert!((pressure.val() - (4.0 + 16383.0 / 32767.0 * 16.0)).abs() < 1e-9);
    assert!(pressure.is_healthy());
    assert!(!thermocouple.is_healthy());

    valve.on();
    heater.set_val(12.0);
    coupler.write_all().await.unwrap();
    {
        let bank = bank.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(!bank.coil(0));
        assert!(bank.coil(1));
        assert_eq!(bank.holding_registers(0, 2), vec![0, 16383]);
    }
    coupler.disconnect().await;
}

#[tokio::test]
async fn test_coupler_reports_out_of_range_spans() {
    let bank = RegisterBank::new(4).shared();
    let socket_addr = start_register_bank(bank).await;

    let mut coupler = CouplerAdapter::new("coupler", socket_addr.to_string(), 1, settings());
    coupler.add_device(device(
        "Pressure 9",
        8,
        DeviceKind::AnalogIn(AnalogEncoding::Status),
        Scaling::default(),
    ));
    coupler.connect().await.unwrap();
    let err = coupler.read_all().await.unwrap_err();
    assert!(matches!(err, AdapterError::Exception { .. }), "{err}");
}

#[tokio::test]
async fn test_flow_controller_float_points() {
    let mut bank = RegisterBank::default();
    bank.set_input_registers(0, &encode_float(2.5));
    bank.set_input_registers(2, &encode_float(1013.0));
    let bank = bank.shared();
    let socket_addr = start_register_bank(bank.clone()).await;

    let flow = device(
        "Flow controller 1.PV",
        0,
        DeviceKind::AnalogIn(AnalogEncoding::Float),
        Scaling::identity(0.0, 10.0),
    );
    let pressure = device(
        "Flow controller 1.P",
        2,
        DeviceKind::AnalogIn(AnalogEncoding::Float),
        Scaling::new(
            ScaleRange::new(0.0, 2000.0),
            ScaleRange::new(0.0, 2.0),
            None,
        ),
    );
    let setpoint = device(
        "Flow controller 1.SP",
        0,
        DeviceKind::AnalogOut(AnalogEncoding::Float),
        Scaling::identity(0.0, 10.0),
    );

    let mut controller =
        FlowControllerAdapter::new("flow", socket_addr.to_string(), 1, settings());
    for d in [&flow, &pressure, &setpoint] {
        controller.add_device(d.clone());
    }
    controller.connect().await.unwrap();
    controller.read_all().await.unwrap();
    assert!((flow.val() - 2.5).abs() < 1e-6);
    assert!((pressure.val() - 1.013).abs() < 1e-6);

    setpoint.set_val(1.25);
    controller.write_all().await.unwrap();
    let bank = bank.lock().unwrap_or_else(PoisonError::into_inner);
    assert_eq!(bank.holding_registers(0, 2), encode_float(1.25).to_vec());
}

#[tokio::test]
async fn test_flow_controller_outputs_keep_their_addresses() {
    let bank = RegisterBank::default().shared();
    let socket_addr = start_register_bank(bank.clone()).await;

    let first = device(
        "Pressure controller 1.SP",
        0,
        DeviceKind::AnalogOut(AnalogEncoding::Float),
        Scaling::identity(0.0, 10.0),
    );
    let second = device(
        "Pressure controller 2.SP",
        4,
        DeviceKind::AnalogOut(AnalogEncoding::Float),
        Scaling::identity(0.0, 10.0),
    );
    let mut controller =
        FlowControllerAdapter::new("flow", socket_addr.to_string(), 1, settings());
    controller.add_device(first.clone());
    controller.add_device(second.clone());
    controller.connect().await.unwrap();

    first.set_val(1.0);
    second.set_val(2.0);
    controller.write_all().await.unwrap();
    {
        let bank = bank.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(bank.holding_registers(0, 2), encode_float(1.0).to_vec());
        assert_eq!(bank.holding_registers(2, 2), vec![0, 0]);
        assert_eq!(bank.holding_registers(4, 2), encode_float(2.0).to_vec());
    }
    controller.disconnect().await;
}

#[tokio::test]
async fn test_oversized_span_is_refused_before_sending() {
    let bank = RegisterBank::default().shared();
    let socket_addr = start_register_bank(bank).await;

    let mut coupler = CouplerAdapter::new("coupler", socket_addr.to_string(), 1, settings());
    coupler.add_device(device("First", 0, DeviceKind::DigitalIn, Scaling::default()));
    coupler.add_device(device("Last", 0xFFFF, DeviceKind::DigitalIn, Scaling::default()));
    coupler.connect().await.unwrap();
    let err = coupler.read_all().await.unwrap_err();
    assert!(matches!(err, AdapterError::Protocol { .. }), "{err}");
}

#[tokio::test]
async fn test_transducer_array_line_protocol() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket_addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 6];

        // First cycle answers, highest channel first
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"r00050");
        stream
            .write_all(format!("{:>12}{:>12}", "2.0", "14.5").as_bytes())
            .await
            .unwrap();

        // Second cycle is left unanswered, then the link drops
        stream.read_exact(&mut request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
    });

    let low = device("Transducer 1", 0, DeviceKind::AnalogIn(AnalogEncoding::Raw), Scaling::default());
    let high = device("Transducer 3", 2, DeviceKind::AnalogIn(AnalogEncoding::Raw), Scaling::default());
    let mut array = TransducerArrayAdapter::new("array", socket_addr.to_string(), settings());
    array.add_device(low.clone());
    array.add_device(high.clone());
    array.connect().await.unwrap();
    assert_eq!(array.request(), "r00050");

    array.read_all().await.unwrap();
    assert!((high.val() - 2.0 * PSI_TO_MBAR).abs() < 1e-9);
    assert!((low.val() - 14.5 * PSI_TO_MBAR).abs() < 1e-9);

    // A timeout skips the cycle and keeps the last readings
    array.read_all().await.unwrap();
    assert!((low.val() - 14.5 * PSI_TO_MBAR).abs() < 1e-9);

    server.await.unwrap();
    let err = array.read_all().await.unwrap_err();
    assert!(err.is_connection_failure(), "{err}");
}

#[tokio::test]
async fn test_transducer_array_drops_late_responses() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket_addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 6];

        // Answer after the client gave up on this cycle
        stream.read_exact(&mut request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        stream.write_all(format!("{:>12}", "1.0").as_bytes()).await.unwrap();

        stream.read_exact(&mut request).await.unwrap();
        stream.write_all(format!("{:>12}", "3.0").as_bytes()).await.unwrap();
        stream
    });

    let channel = device("Transducer 1", 0, DeviceKind::AnalogIn(AnalogEncoding::Raw), Scaling::default());
    let mut array = TransducerArrayAdapter::new("array", socket_addr.to_string(), settings());
    array.add_device(channel.clone());
    array.connect().await.unwrap();

    array.read_all().await.unwrap();
    assert_eq!(channel.val(), 0.0);

    // Let the late answer land before the next cycle
    tokio::time::sleep(Duration::from_millis(400)).await;
    array.read_all().await.unwrap();
    assert!((channel.val() - 3.0 * PSI_TO_MBAR).abs() < 1e-9);

    let _stream = server.await.unwrap();
    array.disconnect().await;
}
