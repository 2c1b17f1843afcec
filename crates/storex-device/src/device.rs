//! The StoreX command set.

use std::fmt::Display;

use storex_config::{DeviceConfig, StorexConfig};
use storex_core::{CommandBridge, CommandLink};
use tracing::{debug, info};

use crate::DeviceError;
use crate::protocol::{format_command, split_fields};
use crate::types::{
    Climate, DetectorStatus, SystemStatus, TransferInfo, TransferStation, UserDoorStatus,
};

/// Replies that barcode reads use to report failure instead of a barcode.
const BARCODE_ERRORS: &[&str] = &[
    "BCRError",
    "InitError",
    "Device Status Error",
    "Device not Ready",
    "Error",
    "No Plate",
    "No Barcode",
];

/// A StoreX unit reached through a [`CommandLink`].
pub struct StoreX<L: CommandLink = CommandBridge> {
    link: L,
    device: DeviceConfig,
}

impl StoreX<CommandBridge> {
    /// Build a device handle with its own command bridge. Nothing is
    /// connected until [`open`](Self::open).
    pub fn from_config(config: &StorexConfig) -> Result<Self, DeviceError> {
        let bridge = CommandBridge::new(config.bridge.clone())?;
        Ok(Self::new(bridge, config.device.clone()))
    }
}

impl<L: CommandLink> StoreX<L> {
    pub fn new(link: L, device: DeviceConfig) -> Self {
        Self { link, device }
    }

    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Connect to the configured endpoint. A no-op when already connected.
    pub fn open(&self) -> Result<(), DeviceError> {
        self.link.open(&self.device.host, self.device.port)?;
        info!(
            host = %self.device.host,
            port = self.device.port,
            device_id = %self.device.device_id,
            "StoreX session open"
        );
        Ok(())
    }

    pub fn close(&self) -> Result<(), DeviceError> {
        self.link.close()?;
        info!(device_id = %self.device.device_id, "StoreX session closed");
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Open the device's serial links and initialise handling.
    ///
    /// The reply carries two codes: the device and the barcode reader. Both
    /// must be `1`.
    pub fn activate(&self) -> Result<(), DeviceError> {
        const COMMAND: &str = "STX2Activate";
        let reply = self.call(COMMAND, &[])?;
        let fields = split_fields(&reply);
        let [device, reader, ..] = fields.as_slice() else {
            return Err(malformed(COMMAND, &reply));
        };
        if *device != "1" {
            return Err(rejected(COMMAND, device));
        }
        if *reader != "1" {
            return Err(DeviceError::BarcodeReader {
                code: (*reader).to_string(),
            });
        }
        Ok(())
    }

    pub fn deactivate(&self) -> Result<(), DeviceError> {
        self.call("STX2Deactivate", &[]).map(drop)
    }

    /// Put the unit back into idle after an error. Call
    /// [`activate`](Self::activate) again before further operations.
    pub fn reset(&self) -> Result<(), DeviceError> {
        self.call("STX2Reset", &[]).map(drop)
    }

    pub fn soft_reset(&self) -> Result<(), DeviceError> {
        self.call("STX2SoftReset", &[]).map(drop)
    }

    // ── Climate ─────────────────────────────────────────────────

    pub fn read_actual_climate(&self) -> Result<Climate, DeviceError> {
        self.call("STX2ReadActualClimate", &[])
            .map(|reply| Climate::from_response(&reply))
    }

    pub fn read_set_climate(&self) -> Result<Climate, DeviceError> {
        self.call("STX2ReadSetClimate", &[])
            .map(|reply| Climate::from_response(&reply))
    }

    pub fn write_set_climate(&self, climate: &Climate) -> Result<(), DeviceError> {
        self.call(
            "STX2WriteSetClimate",
            &[
                &climate.temperature,
                &climate.relative_humidity,
                &climate.co2_percent,
                &climate.n2_percent,
            ],
        )
        .map(drop)
    }

    // ── Shaker ──────────────────────────────────────────────────

    /// Write the shaker speed and switch the shaker on. The device documents
    /// `1..=50`; the value is passed through unchecked.
    pub fn activate_shaker(&self, speed: u32) -> Result<(), DeviceError> {
        self.call("STX2ActivateShaker", &[&speed]).map(drop)
    }

    pub fn deactivate_shaker(&self) -> Result<(), DeviceError> {
        self.call("STX2DeactivateShaker", &[]).map(drop)
    }

    pub fn read_set_shaker_speed(&self) -> Result<u32, DeviceError> {
        const COMMAND: &str = "STX2ReadSetShakerSpeed";
        let reply = self.call(COMMAND, &[])?;
        if reply == "-1" {
            return Err(rejected(COMMAND, &reply));
        }
        reply.parse().map_err(|_| malformed(COMMAND, &reply))
    }

    // ── Swap station, door and access ───────────────────────────

    /// Rotate the swap station by 180 degrees.
    pub fn swap_in(&self) -> Result<(), DeviceError> {
        self.call_failing_on("STX2SwapIn", "1")
    }

    /// Rotate the swap station back to its home position.
    pub fn swap_out(&self) -> Result<(), DeviceError> {
        self.call_failing_on("STX2SwapOut", "1")
    }

    /// Lock the user door and report whether it is open.
    pub fn lock(&self) -> Result<UserDoorStatus, DeviceError> {
        self.door_status("STX2Lock")
    }

    pub fn unlock(&self) -> Result<(), DeviceError> {
        self.call_failing_on("STX2UnLock", "1")
    }

    pub fn read_user_door_flag(&self) -> Result<UserDoorStatus, DeviceError> {
        self.door_status("STX2ReadUserDoorFlag")
    }

    /// Abandon the pending load-plate access.
    pub fn abandon_access(&self) -> Result<(), DeviceError> {
        self.call("STX2AbandonAccess", &[]).map(drop)
    }

    /// Continue the pending load-plate access.
    pub fn continue_access(&self) -> Result<(), DeviceError> {
        self.call("STX2ContinueAccess", &[]).map(drop)
    }

    // ── Status ──────────────────────────────────────────────────

    pub fn get_sys_status(&self) -> Result<SystemStatus, DeviceError> {
        const COMMAND: &str = "STX2GetSysStatus";
        let reply = self.call(COMMAND, &[])?;
        if reply == "-1" {
            return Err(rejected(COMMAND, &reply));
        }
        reply
            .parse()
            .map(SystemStatus::from_bits)
            .map_err(|_| malformed(COMMAND, &reply))
    }

    /// The current system error code, or `None` when there is no error.
    pub fn read_error_code(&self) -> Result<Option<String>, DeviceError> {
        const COMMAND: &str = "STX2ReadErrorCode";
        let reply = self.call(COMMAND, &[])?;
        match reply.as_str() {
            "0" => Ok(None),
            "-1" => Err(rejected(COMMAND, &reply)),
            "" => Err(malformed(COMMAND, &reply)),
            _ => Ok(Some(reply)),
        }
    }

    /// Whether a long operation such as a move or inventory is still running.
    pub fn is_operation_running(&self) -> Result<bool, DeviceError> {
        self.call("STX2IsOperationRunning", &[])
            .map(|reply| reply == "1")
    }

    // ── Detectors and beeper ────────────────────────────────────

    pub fn read_shovel_detector(&self) -> Result<DetectorStatus, DeviceError> {
        self.detector_status("STX2ReadShovelDetector")
    }

    pub fn read_xfer_station_detector(
        &self,
        station: TransferStation,
    ) -> Result<DetectorStatus, DeviceError> {
        self.detector_status(station.detector_command())
    }

    pub fn beeper_on(&self) -> Result<(), DeviceError> {
        self.call("STX2BeeperOn", &[]).map(drop)
    }

    pub fn beeper_off(&self) -> Result<(), DeviceError> {
        self.call("STX2BeeperOff", &[]).map(drop)
    }

    // ── Barcodes ────────────────────────────────────────────────

    /// Read the barcode of the plate at `slot`/`level`.
    pub fn service_read_barcode(&self, slot: u32, level: u32) -> Result<String, DeviceError> {
        let reply = self.call("STX2ServiceReadBarcode", &[&slot, &level])?;
        barcode("STX2ServiceReadBarcode", reply)
    }

    pub fn read_barcode_at_transfer_station(&self) -> Result<String, DeviceError> {
        let reply = self.call("STX2ReadBarcodeAtTransferStation", &[])?;
        barcode("STX2ReadBarcodeAtTransferStation", reply)
    }

    // ── Plates ──────────────────────────────────────────────────

    /// Start a device-side inventory of the whole unit, saved by the device
    /// under `file_name`.
    pub fn inventory(
        &self,
        file_name: &str,
        use_plate_detector: bool,
        use_barcode_reader: bool,
    ) -> Result<(), DeviceError> {
        self.call_expecting(
            "STX2Inventory",
            &[
                &file_name,
                &u8::from(use_plate_detector),
                &u8::from(use_barcode_reader),
            ],
            "1",
        )
    }

    /// Load the plate on the transfer station into `slot`/`level`.
    pub fn load_plate(&self, slot: u32, level: u32) -> Result<(), DeviceError> {
        self.call_expecting("STX2LoadPlate", &[&slot, &level], "1")
    }

    /// Unload the plate at `slot`/`level` onto the transfer station.
    pub fn unload_plate(&self, slot: u32, level: u32) -> Result<(), DeviceError> {
        self.call_expecting("STX2UnloadPlate", &[&slot, &level], "1")
    }

    /// Move a plate between two positions, possibly on different cascaded
    /// devices. Failures carry the device's error field.
    pub fn service_move_plate(
        &self,
        source: &TransferInfo,
        target: &TransferInfo,
    ) -> Result<(), DeviceError> {
        const COMMAND: &str = "STX2ServiceMovePlate";
        let [source_id, source_rest @ ..] = source.fields();
        let target_fields = target.fields();
        let args: Vec<&dyn Display> = source_rest
            .iter()
            .chain(target_fields.iter())
            .map(|field| field as &dyn Display)
            .collect();

        let reply = self.exchange(COMMAND, format_command(COMMAND, &source_id, &args))?;
        if reply == "1" {
            return Ok(());
        }
        let code = if reply.contains(';') {
            split_fields(&reply).get(1).copied().unwrap_or(reply.as_str())
        } else {
            reply.as_str()
        };
        Err(rejected(COMMAND, code))
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn call(&self, command: &'static str, args: &[&dyn Display]) -> Result<String, DeviceError> {
        let request = format_command(command, &self.device.device_id, args);
        self.exchange(command, request)
    }

    fn exchange(&self, command: &'static str, request: String) -> Result<String, DeviceError> {
        let reply = self.link.send(&request)?;
        let reply = reply.trim();
        debug!(command, reply, "StoreX replied");
        Ok(reply.to_string())
    }

    fn call_expecting(
        &self,
        command: &'static str,
        args: &[&dyn Display],
        success: &str,
    ) -> Result<(), DeviceError> {
        let reply = self.call(command, args)?;
        if reply == success {
            Ok(())
        } else {
            Err(rejected(command, &reply))
        }
    }

    fn call_failing_on(&self, command: &'static str, failure: &str) -> Result<(), DeviceError> {
        let reply = self.call(command, &[])?;
        if reply == failure {
            Err(rejected(command, &reply))
        } else {
            Ok(())
        }
    }

    fn door_status(&self, command: &'static str) -> Result<UserDoorStatus, DeviceError> {
        self.flag(command)
            .map(|open| if open { UserDoorStatus::Opened } else { UserDoorStatus::Closed })
    }

    fn detector_status(&self, command: &'static str) -> Result<DetectorStatus, DeviceError> {
        self.flag(command)
            .map(|present| if present { DetectorStatus::Occupied } else { DetectorStatus::Empty })
    }

    /// `1`/`0` flag replies; `-1` is the device's error report.
    fn flag(&self, command: &'static str) -> Result<bool, DeviceError> {
        let reply = self.call(command, &[])?;
        match reply.as_str() {
            "1" => Ok(true),
            "0" => Ok(false),
            "-1" => Err(rejected(command, &reply)),
            _ => Err(malformed(command, &reply)),
        }
    }
}

fn barcode(command: &'static str, reply: String) -> Result<String, DeviceError> {
    if BARCODE_ERRORS.contains(&reply.as_str()) {
        Err(DeviceError::Rejected {
            command,
            code: reply,
        })
    } else {
        Ok(reply)
    }
}

fn rejected(command: &'static str, code: &str) -> DeviceError {
    DeviceError::Rejected {
        command,
        code: code.to_string(),
    }
}

fn malformed(command: &'static str, reply: &str) -> DeviceError {
    DeviceError::Malformed {
        command,
        reply: reply.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use storex_core::BridgeError;

    use super::*;
    use crate::types::{PlatePosition, PlateType};

    /// Answers each command with the next scripted reply and records what
    /// was sent.
    #[derive(Default)]
    struct ScriptedLink {
        replies: Mutex<VecDeque<Result<String, BridgeError>>>,
        sent: Mutex<Vec<String>>,
        opened: Mutex<Option<(String, u16)>>,
    }

    impl ScriptedLink {
        fn replying(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CommandLink for ScriptedLink {
        fn open(&self, host: &str, port: u16) -> Result<(), BridgeError> {
            *self.opened.lock().unwrap() = Some((host.to_string(), port));
            Ok(())
        }

        fn close(&self) -> Result<(), BridgeError> {
            self.opened.lock().unwrap().take();
            Ok(())
        }

        fn send(&self, command: &str) -> Result<String, BridgeError> {
            self.sent.lock().unwrap().push(command.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(BridgeError::NotConnected))
        }
    }

    fn storex(replies: &[&str]) -> StoreX<ScriptedLink> {
        StoreX::new(ScriptedLink::replying(replies), DeviceConfig::default())
    }

    fn rejected_code(err: DeviceError) -> String {
        match err {
            DeviceError::Rejected { code, .. } => code,
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_open_uses_configured_endpoint() {
        let device = StoreX::new(
            ScriptedLink::default(),
            DeviceConfig {
                host: "10.0.0.7".to_string(),
                port: 4000,
                device_id: "3".to_string(),
            },
        );
        device.open().unwrap();
        assert_eq!(
            *device.link().opened.lock().unwrap(),
            Some(("10.0.0.7".to_string(), 4000))
        );
        assert_eq!(device.device_id(), "3");

        device.close().unwrap();
        assert!(device.link().opened.lock().unwrap().is_none());
    }

    #[test]
    fn test_activate_succeeds_when_both_codes_are_one() {
        let device = storex(&["1;1\r\n"]);
        device.activate().unwrap();
        assert_eq!(device.link().sent(), vec!["STX2Activate(1)\r"]);
    }

    #[test]
    fn test_activate_reports_device_code() {
        let device = storex(&["-6;1"]);
        assert_eq!(rejected_code(device.activate().unwrap_err()), "-6");
    }

    #[test]
    fn test_activate_reports_barcode_reader_code() {
        let device = storex(&["1;-2"]);
        assert!(matches!(
            device.activate(),
            Err(DeviceError::BarcodeReader { code }) if code == "-2"
        ));
    }

    #[test]
    fn test_activate_with_single_field_is_malformed() {
        let device = storex(&["1"]);
        assert!(matches!(
            device.activate(),
            Err(DeviceError::Malformed { .. })
        ));
    }

    #[test]
    fn test_climate_round_trip_commands() {
        let device = storex(&["37.1;88.0;5.2;0.0\r\n", ""]);
        let climate = device.read_actual_climate().unwrap();
        assert_eq!(climate.temperature, 37.1);
        assert_eq!(climate.co2_percent, 5.2);

        device
            .write_set_climate(&Climate {
                temperature: 37.0,
                relative_humidity: 90.0,
                co2_percent: 5.0,
                n2_percent: 0.5,
            })
            .unwrap();
        assert_eq!(
            device.link().sent(),
            vec![
                "STX2ReadActualClimate(1)\r",
                "STX2WriteSetClimate(1,37,90,5,0.5)\r",
            ]
        );
    }

    #[test]
    fn test_shaker_speed() {
        let device = storex(&["", "25\r\n", "-1", "fast"]);
        device.activate_shaker(25).unwrap();
        assert_eq!(device.read_set_shaker_speed().unwrap(), 25);
        assert_eq!(rejected_code(device.read_set_shaker_speed().unwrap_err()), "-1");
        assert!(matches!(
            device.read_set_shaker_speed(),
            Err(DeviceError::Malformed { .. })
        ));
        assert_eq!(device.link().sent()[0], "STX2ActivateShaker(1,25)\r");
    }

    #[test]
    fn test_swap_station_and_unlock_fail_on_one() {
        let device = storex(&["0", "1", "0"]);
        device.swap_in().unwrap();
        assert_eq!(rejected_code(device.swap_out().unwrap_err()), "1");
        device.unlock().unwrap();
    }

    #[test]
    fn test_door_and_detector_flags() {
        let device = storex(&["1", "0", "-1", "0", "1", "maybe"]);
        assert_eq!(device.lock().unwrap(), UserDoorStatus::Opened);
        assert_eq!(device.read_user_door_flag().unwrap(), UserDoorStatus::Closed);
        assert_eq!(rejected_code(device.read_shovel_detector().unwrap_err()), "-1");
        assert_eq!(
            device
                .read_xfer_station_detector(TransferStation::First)
                .unwrap(),
            DetectorStatus::Empty
        );
        assert_eq!(
            device
                .read_xfer_station_detector(TransferStation::Second)
                .unwrap(),
            DetectorStatus::Occupied
        );
        assert!(matches!(
            device.read_shovel_detector(),
            Err(DeviceError::Malformed { .. })
        ));
        let sent = device.link().sent();
        assert_eq!(sent[3], "STX2ReadXferStationDetector1(1)\r");
        assert_eq!(sent[4], "STX2ReadXferStationDetector2(1)\r");
    }

    #[test]
    fn test_system_status_register() {
        let device = storex(&["7\r\n", "-1", "busy"]);
        let status = device.get_sys_status().unwrap();
        assert!(status.is_ready());
        assert!(status.is_plate_ready());
        assert!(status.is_initialized());
        assert!(!status.has_error());

        assert_eq!(rejected_code(device.get_sys_status().unwrap_err()), "-1");
        assert!(matches!(
            device.get_sys_status(),
            Err(DeviceError::Malformed { .. })
        ));
    }

    #[test]
    fn test_read_error_code() {
        let device = storex(&["0", "1024", "-1"]);
        assert_eq!(device.read_error_code().unwrap(), None);
        assert_eq!(device.read_error_code().unwrap(), Some("1024".to_string()));
        assert_eq!(rejected_code(device.read_error_code().unwrap_err()), "-1");
    }

    #[test]
    fn test_is_operation_running() {
        let device = storex(&["1", "0"]);
        assert!(device.is_operation_running().unwrap());
        assert!(!device.is_operation_running().unwrap());
    }

    #[test]
    fn test_barcode_reads() {
        let device = storex(&["4711-AB\r\n", "No Plate", "No Barcode\r\n"]);
        assert_eq!(device.service_read_barcode(3, 12).unwrap(), "4711-AB");
        assert_eq!(
            rejected_code(device.service_read_barcode(3, 13).unwrap_err()),
            "No Plate"
        );
        assert_eq!(
            rejected_code(device.read_barcode_at_transfer_station().unwrap_err()),
            "No Barcode"
        );
        assert_eq!(device.link().sent()[0], "STX2ServiceReadBarcode(1,3,12)\r");
    }

    #[test]
    fn test_inventory_arguments() {
        let device = storex(&["1", "-2"]);
        device.inventory("run7.inv", true, false).unwrap();
        assert_eq!(
            rejected_code(device.inventory("", false, true).unwrap_err()),
            "-2"
        );
        assert_eq!(
            device.link().sent(),
            vec!["STX2Inventory(1,run7.inv,1,0)\r", "STX2Inventory(1,,0,1)\r"]
        );
    }

    #[test]
    fn test_load_and_unload_succeed_on_one() {
        let device = storex(&["1\r\n", "-4", "1"]);
        device.load_plate(2, 5).unwrap();
        assert_eq!(rejected_code(device.load_plate(2, 99).unwrap_err()), "-4");
        device.unload_plate(2, 5).unwrap();
        assert_eq!(
            device.link().sent(),
            vec![
                "STX2LoadPlate(1,2,5)\r",
                "STX2LoadPlate(1,2,99)\r",
                "STX2UnloadPlate(1,2,5)\r",
            ]
        );
    }

    #[test]
    fn test_service_move_plate() {
        let source = TransferInfo {
            device_id: "1".to_string(),
            position: PlatePosition::SlotLevel,
            slot: 2,
            level: 7,
            transport_slot: 1,
            plate_type: PlateType::Mtp,
        };
        let target = TransferInfo {
            device_id: "2".to_string(),
            position: PlatePosition::TransferStation,
            slot: 0,
            level: 0,
            transport_slot: 2,
            plate_type: PlateType::Mtp,
        };
        let device = storex(&["1", "0;-6", "7"]);

        device.service_move_plate(&source, &target).unwrap();
        assert_eq!(
            rejected_code(device.service_move_plate(&source, &target).unwrap_err()),
            "-6"
        );
        assert_eq!(
            rejected_code(device.service_move_plate(&source, &target).unwrap_err()),
            "7"
        );
        assert_eq!(
            device.link().sent()[0],
            "STX2ServiceMovePlate(1,2,2,7,1,0,2,1,0,0,2,0)\r"
        );
    }

    #[test]
    fn test_bridge_errors_pass_through() {
        let device = storex(&[]);
        assert!(matches!(
            device.reset(),
            Err(DeviceError::Bridge(BridgeError::NotConnected))
        ));
    }

    #[test]
    fn test_plain_commands_format() {
        let device = storex(&["", "", "", "", "", "", "", "", ""]);
        device.deactivate().unwrap();
        device.reset().unwrap();
        device.soft_reset().unwrap();
        device.deactivate_shaker().unwrap();
        device.abandon_access().unwrap();
        device.continue_access().unwrap();
        device.beeper_on().unwrap();
        device.beeper_off().unwrap();
        device.read_set_climate().unwrap();
        assert_eq!(
            device.link().sent(),
            vec![
                "STX2Deactivate(1)\r",
                "STX2Reset(1)\r",
                "STX2SoftReset(1)\r",
                "STX2DeactivateShaker(1)\r",
                "STX2AbandonAccess(1)\r",
                "STX2ContinueAccess(1)\r",
                "STX2BeeperOn(1)\r",
                "STX2BeeperOff(1)\r",
                "STX2ReadSetClimate(1)\r",
            ]
        );
    }
}
