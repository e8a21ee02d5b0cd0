// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_rig_controller::adapters::{
    Adapter, AdapterError, IoImage, SimulationAdapter, SoftwareAdapter,
};
use rust_rig_controller::config::{Config, RoutinesConfig};
use rust_rig_controller::controller::{
    ControlEvent, Controller, ControllerContext, ControllerError, ControllerMessage,
};
use rust_rig_controller::devices::{
    AnalogEncoding, Computation, Device, DeviceKind, Link, Scaling, StatusValue,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn drain(rx: &mut UnboundedReceiver<ControllerMessage>) -> Vec<ControllerMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

fn control_events(messages: &[ControllerMessage]) -> Vec<ControlEvent> {
    messages
        .iter()
        .filter_map(|m| match m {
            ControllerMessage::Control(event) => Some(*event),
            _ => None,
        })
        .collect()
}

/// Simulated rig with a held E-stop, a heater output and a software model
fn rig() -> (Controller, Arc<Device>) {
    let mut simulation = SimulationAdapter::new("rig").with_cycle_delay(Duration::ZERO);
    simulation.add_device(Arc::new(Device::new(
        "E-stop",
        0,
        DeviceKind::DigitalIn,
        Scaling::default(),
    )));
    simulation.add_device(Arc::new(Device::new(
        "Heater",
        0,
        DeviceKind::AnalogOut(AnalogEncoding::Plain),
        Scaling::identity(0.0, 100.0),
    )));
    assert!(simulation.hold("E-stop", 1.0));

    let mut software = SoftwareAdapter::new("software").with_cycle_delay(Duration::ZERO);
    software.add_device(Arc::new(Device::software(
        "Heater x2",
        Computation::gain(Link::new("Heater"), 2.0, 0.0),
        200.0,
    )));

    let adapters: Vec<Box<dyn Adapter>> = vec![Box::new(simulation), Box::new(software)];
    let devices = adapters
        .iter()
        .flat_map(|a| a.image().devices().to_vec())
        .collect();
    let context =
        Arc::new(ControllerContext::new(devices, "E-stop", RoutinesConfig::default()).unwrap());
    let estop = context.device("E-stop").unwrap();
    (Controller::new(context, adapters), estop)
}

#[tokio::test]
async fn test_estop_edges_are_reported_once() {
    let (mut controller, estop) = rig();
    let (_, mut rx) = controller.subscribe();
    drain(&mut rx);

    for _ in 0..3 {
        controller.poll_once().await.unwrap();
    }
    assert!(control_events(&drain(&mut rx)).is_empty());

    estop.set_val(0.0);
    for _ in 0..3 {
        controller.poll_once().await.unwrap();
    }
    assert_eq!(control_events(&drain(&mut rx)), vec![ControlEvent::EstopOn]);
    assert!(controller.context().is_estop_active());

    // A console attaching while the E-stop is active hears about it
    let (_, mut late) = controller.subscribe();
    assert_eq!(control_events(&drain(&mut late)), vec![ControlEvent::EstopOn]);

    estop.set_val(1.0);
    for _ in 0..3 {
        controller.poll_once().await.unwrap();
    }
    assert_eq!(control_events(&drain(&mut rx)), vec![ControlEvent::EstopOff]);
    assert!(!controller.context().is_estop_active());
}

#[tokio::test]
async fn test_streaming_and_operator_commands() {
    let (mut controller, _) = rig();
    let (id, mut rx) = controller.subscribe();
    drain(&mut rx);

    controller.poll_once().await.unwrap();
    assert!(drain(&mut rx).is_empty());

    controller.handle_command(id, "set 40 Heater");
    controller.handle_command(id, "start-stream");
    controller.poll_once().await.unwrap();
    let snapshot = drain(&mut rx)
        .into_iter()
        .find_map(|m| match m {
            ControllerMessage::Data(data) => Some(data),
            _ => None,
        })
        .unwrap();
    assert_eq!(snapshot["Heater"], StatusValue::Value(40.0));
    assert_eq!(snapshot["Heater x2"], StatusValue::Value(80.0));
    assert_eq!(snapshot["E-stop"], StatusValue::Value(1.0));

    controller.handle_command(id, "stream-select 3");
    let heater = controller.context().device("Heater").unwrap();
    assert_eq!(heater.log_window(), 5.0);
    controller.handle_command(id, "stream-select 0");
    assert_eq!(heater.log_window(), 0.0);

    controller.handle_command(id, "stop-stream");
    controller.handle_command(id, "devices");
    controller.handle_command(id, "launch rockets");
    controller.handle_command(id, "stop-check LEAK");
    controller.poll_once().await.unwrap();
    let messages = drain(&mut rx);
    assert!(!messages.iter().any(|m| matches!(m, ControllerMessage::Data(_))));
    assert!(matches!(&messages[0], ControllerMessage::Devices(list) if list.len() == 3));
    assert_eq!(
        messages[1],
        ControllerMessage::Error("Unknown command".to_string())
    );
    assert_eq!(
        messages[2],
        ControllerMessage::Error("Error: Routine 'LEAK' is not running".to_string())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_and_stop_the_poll_loop() {
    let (mut controller, estop) = rig();
    let (_, mut rx) = controller.subscribe();
    drain(&mut rx);

    controller.start().await.unwrap();
    assert!(matches!(
        controller.start().await,
        Err(ControllerError::AlreadyStarted)
    ));
    assert!(matches!(
        controller.poll_once().await,
        Err(ControllerError::AlreadyStarted)
    ));

    estop.set_val(0.0);
    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ControllerMessage::Control(event)) = rx.recv().await {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, ControlEvent::EstopOn);

    controller.stop().await;
    assert!(!controller.is_running());
    controller.poll_once().await.unwrap();
}

/// Adapter that refuses connections until told otherwise
struct Gate {
    image: IoImage,
    open: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Adapter for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    fn image(&self) -> &IoImage {
        &self.image
    }

    fn image_mut(&mut self) -> &mut IoImage {
        &mut self.image
    }

    async fn connect(&mut self) -> Result<(), AdapterError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AdapterError::ConnectionFailure {
                adapter: "gate".into(),
                reason: "refused".into(),
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn read_all(&mut self) -> Result<(), AdapterError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(())
    }

    async fn write_all(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_start_connects_before_polling() {
    let open = Arc::new(AtomicBool::new(false));
    let connected = Arc::new(AtomicBool::new(false));
    let gate = Gate {
        image: IoImage::new(),
        open: open.clone(),
        connected: connected.clone(),
    };
    let context =
        Arc::new(ControllerContext::new(Vec::new(), "E-stop", RoutinesConfig::default()).unwrap());
    let mut controller = Controller::new(context, vec![Box::new(gate)]);

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, ControllerError::Adapter(_)), "{err}");
    assert!(!controller.is_running());

    open.store(true, Ordering::SeqCst);
    controller.start().await.unwrap();
    assert!(connected.load(Ordering::SeqCst));
    assert!(controller.is_running());

    controller.stop().await;
    assert!(!connected.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_simulation_topology_from_configuration() {
    let mut config = Config::default();
    config.controller.simulation = true;
    let mut controller = Controller::from_config(&config).unwrap();
    let (_, mut rx) = controller.subscribe();
    drain(&mut rx);

    for _ in 0..5 {
        controller.poll_once().await.unwrap();
    }
    let context = controller.context();
    assert_eq!(context.device("E-stop").unwrap().val(), 1.0);
    assert!(control_events(&drain(&mut rx)).is_empty());
    assert!(context.device("Transducer 1").is_ok());
    assert!(context.device("Pressure controller 1.SP").is_ok());
}
