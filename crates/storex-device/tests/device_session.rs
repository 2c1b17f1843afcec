//! A StoreX session over a real command bridge.

use pretty_assertions::assert_eq;
use storex_config::Framing;
use storex_device::{DeviceError, StoreX, UserDoorStatus};
use storex_test_utils::{Action, StubPeer, TestConfigBuilder, TestConfigFile};

#[test_log::test]
fn activate_read_climate_and_lock() {
    let peer = StubPeer::spawn(vec![
        vec![Action::write("1;1\r\n")],
        vec![Action::write("36.9;91.0;5.0;0.0\r\n")],
        vec![Action::write("0\r\n")],
    ]);
    let config = TestConfigBuilder::new()
        .endpoint(peer.addr())
        .device_id("4")
        .build();
    let device = StoreX::from_config(&config).unwrap();

    device.open().unwrap();
    device.activate().unwrap();
    let climate = device.read_actual_climate().unwrap();
    assert_eq!(climate.temperature, 36.9);
    assert_eq!(device.lock().unwrap(), UserDoorStatus::Closed);
    device.close().unwrap();

    assert_eq!(
        peer.received(),
        vec![
            "STX2Activate(4)\r",
            "STX2ReadActualClimate(4)\r",
            "STX2Lock(4)\r",
        ]
    );
}

#[test_log::test]
fn commands_before_open_fail() {
    let config = TestConfigBuilder::new().build();
    let device = StoreX::from_config(&config).unwrap();

    assert!(matches!(device.reset(), Err(DeviceError::Bridge(_))));
}

#[test_log::test]
fn session_from_config_file() {
    let peer = StubPeer::spawn(vec![vec![Action::write("1"), Action::Close]]);
    let addr = peer.addr();
    let toml = format!(
        r#"
[device]
host = "{}"
port = {}
device_id = "2"

[bridge]
framing = "until-close"
response_timeout_ms = 2000
"#,
        addr.ip(),
        addr.port()
    );
    let file = tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(TestConfigFile::with_toml(&toml));
    assert_eq!(file.config.bridge.framing, Framing::UntilClose);

    let device = StoreX::from_config(&file.config).unwrap();
    device.open().unwrap();
    device.load_plate(1, 1).unwrap();
    device.close().unwrap();

    assert_eq!(peer.received(), vec!["STX2LoadPlate(2,1,1)\r"]);
}
