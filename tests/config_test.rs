// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use rust_rig_controller::config::{AdapterConfig, AdapterKind, Config, DeviceConfig, PointConfig};
use tempfile::tempdir;

#[test]
fn test_config_load_and_save() -> Result<()> {
    // Create a temporary directory
    let temp_dir = tempdir()?;
    let config_path = temp_dir.path().join("config.yaml");

    // Create a custom config
    let mut config = Config::default();
    config.controller.estop_tag = "Rig stop".to_string();
    config.routines.tick_ms = 50;
    config.adapters = vec![AdapterConfig::new("bench", AdapterKind::Coupler, Some("10.0.0.2"))
        .with_device(DeviceConfig::new("Rig stop", 0, PointConfig::DigitalIn))
        .with_device(
            DeviceConfig::new("Pressure 1", 0, PointConfig::AnalogInStatus)
                .scale_from(4609.0, 23960.0)
                .scale_to(972.0, 5040.0)
                .full_scale(1500.0),
        )];

    // Save config to file
    config.save_to_file(&config_path)?;

    // Load config from file
    let loaded_config = Config::from_file(&config_path)?;
    assert_eq!(loaded_config, config);
    assert_eq!(
        loaded_config.adapters[0].endpoint().as_deref(),
        Some("10.0.0.2:502")
    );

    // Test loading default config for non-existent file
    let non_existent_path = temp_dir.path().join("non_existent.yaml");
    let default_config = Config::from_file(&non_existent_path)?;

    // Verify default config was created
    assert!(non_existent_path.exists());
    assert_eq!(default_config, Config::default());
    assert_eq!(Config::from_file(&non_existent_path)?, default_config);

    // Apply command-line arguments
    let mut config = Config::default();
    assert!(!config.controller.simulation);
    config.apply_args(true, Some(PathBuf::from("calibration.json")));
    assert!(config.controller.simulation);
    assert_eq!(
        config.controller.calibration_file,
        Some(PathBuf::from("calibration.json"))
    );

    Ok(())
}

#[test]
fn test_yaml_topology() -> Result<()> {
    let yaml = r#"
controller:
  simulation: true
routines:
  tick_ms: 20
  leak_check:
    pressure_delay: 30
adapters:
  - name: rig
    kind: simulation
    devices:
      - tag: E-stop
        type: digital_in
      - tag: Heater
        address: 0
        type: analog_out
  - name: software
    kind: software
    devices:
      - tag: Heater model
        type: lag
        input: Heater
        time_constant: 4.0
        full_scale: 100
"#;
    let config = Config::from_yaml(yaml)?;
    assert!(config.controller.simulation);
    assert_eq!(config.controller.estop_tag, "E-stop");
    assert_eq!(config.routines.tick_ms, 20);
    assert_eq!(config.routines.leak_check.pressure_delay, 30.0);
    assert_eq!(config.routines.leak_check.flow_delay, 120.0);
    assert_eq!(config.adapters.len(), 2);
    assert_eq!(config.device("Heater model").map(|d| d.point.links()), Some(vec!["Heater"]));
    Ok(())
}

#[test]
fn test_invalid_configurations_are_rejected() -> Result<()> {
    let temp_dir = tempdir()?;
    let config_path = temp_dir.path().join("config.yaml");

    // Not a configuration at all
    fs::write(&config_path, "adapters: 12\n")?;
    assert!(Config::from_file(&config_path).is_err());

    // Well formed but violating the topology rules
    let cases = [
        // duplicate tag
        r#"
adapters:
  - name: a
    kind: simulation
    devices:
      - {tag: X, type: digital_in}
      - {tag: X, type: digital_out}
"#,
        // hardware adapter without host
        r#"
adapters:
  - name: coupler
    kind: coupler
"#,
        // dangling software link
        r#"
adapters:
  - name: software
    kind: software
    devices:
      - {tag: G, type: gain, input: Nowhere}
"#,
        // transducer channel outside the bitmask
        r#"
adapters:
  - name: array
    kind: transducer_array
    host: 10.0.0.3
    devices:
      - {tag: T, address: 16, type: analog_in_raw}
"#,
        // coupler analog terminal without its status word
        r#"
adapters:
  - name: coupler
    kind: coupler
    host: 10.0.0.2
    devices:
      - {tag: Heater, address: 0, type: analog_out}
"#,
        // discrete inputs too far apart for one request
        r#"
adapters:
  - name: coupler
    kind: coupler
    host: 10.0.0.2
    devices:
      - {tag: A, address: 0, type: digital_in}
      - {tag: B, address: 65535, type: digital_in}
"#,
    ];
    for yaml in cases {
        fs::write(&config_path, yaml)?;
        assert!(Config::from_file(&config_path).is_err(), "accepted:{yaml}");
    }
    Ok(())
}
