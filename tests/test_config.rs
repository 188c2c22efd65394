use unimem::backend::emulated::{EmulatedRuntime, EmulatorConfig};
use unimem::prelude::*;

const CONFIG: &str = r#"
[[devices]]
name = "Tiny Integrated"
total_memory = 2048
compute_capability = [1, 2]
multiprocessors = 2
cores = 16
clock_rate_khz = 600000
max_threads_per_block = 512
shared_memory = true

[[devices]]
name = "Tiny Discrete"
total_memory = 1024
compute_capability = [8, 6]
multiprocessors = 4
cores = 512
clock_rate_khz = 1700000
max_threads_per_block = 1024
concurrent_copy = true
"#;

#[test]
fn config_round_trips_through_toml() {
    let config = EmulatorConfig::from_toml_str(CONFIG).unwrap();
    let text = toml::to_string(&config).unwrap();
    assert_eq!(config, EmulatorConfig::from_toml_str(&text).unwrap());
    assert_eq!("unimem emulated accelerator", config.platform_name);
    assert!(!config.devices[1].shared_memory);
}

#[test]
fn configured_devices_drive_capabilities() {
    let config = EmulatorConfig::from_toml_str(CONFIG).unwrap();
    let mut device = Device::enumerate(EmulatedRuntime::new(config)).unwrap();
    assert_eq!(2, device.num_devices());

    device.select(0).unwrap();
    assert!(device.supports_shared_memory());
    assert!(!device.supports_double_precision());
    assert_eq!(Some("Tiny Integrated"), device.name());

    device.select(1).unwrap();
    assert!(!device.supports_shared_memory());
    assert!(device.supports_double_precision());
    assert_eq!(Some((8, 6)), device.compute_capability());
    assert_eq!(
        Err(MemError::AllocationError { bytes: 2048 }),
        DeviceBuffer::<u64>::alloc(256, &device, Placement::Default).map(|_| ())
    );
}

#[test]
fn malformed_config_is_rejected() {
    assert!(EmulatorConfig::from_toml_str("[[devices]]\nname = 3").is_err());
}
