//! Values exchanged with a StoreX unit.

use std::fmt;

use crate::protocol::split_fields;

/// Climate readings or set points.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Climate {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Percent.
    pub relative_humidity: f64,
    pub co2_percent: f64,
    pub n2_percent: f64,
}

impl Climate {
    /// Parse a `temp;rh;co2;n2` reply. Missing or unparsable fields read as `0.0`.
    pub fn from_response(reply: &str) -> Self {
        let fields = split_fields(reply);
        let value = |index: usize| {
            fields
                .get(index)
                .and_then(|field| field.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        Self {
            temperature: value(0),
            relative_humidity: value(1),
            co2_percent: value(2),
            n2_percent: value(3),
        }
    }
}

impl fmt::Display for Climate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "temperature={} rh={} co2={} n2={}",
            self.temperature, self.relative_humidity, self.co2_percent, self.n2_percent
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDoorStatus {
    Closed,
    Opened,
}

/// Whether a plate detector sees a plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorStatus {
    Occupied,
    Empty,
}

/// Which transfer-station plate detector to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStation {
    First,
    Second,
}

impl TransferStation {
    pub(crate) fn detector_command(self) -> &'static str {
        match self {
            Self::First => "STX2ReadXferStationDetector1",
            Self::Second => "STX2ReadXferStationDetector2",
        }
    }
}

/// The DM202 status register returned by `STX2GetSysStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemStatus(u16);

impl SystemStatus {
    const READY: u16 = 1 << 0;
    const PLATE_READY: u16 = 1 << 1;
    const INITIALIZED: u16 = 1 << 2;
    const XFER_STATION_CHANGED: u16 = 1 << 3;
    const GATE_CLOSED: u16 = 1 << 4;
    const USER_DOOR: u16 = 1 << 5;
    const WARNING: u16 = 1 << 6;
    const ERROR: u16 = 1 << 7;

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_ready(self) -> bool {
        self.has(Self::READY)
    }

    pub fn is_plate_ready(self) -> bool {
        self.has(Self::PLATE_READY)
    }

    pub fn is_initialized(self) -> bool {
        self.has(Self::INITIALIZED)
    }

    /// The transfer station changed state since the last read.
    pub fn xfer_station_changed(self) -> bool {
        self.has(Self::XFER_STATION_CHANGED)
    }

    pub fn is_gate_closed(self) -> bool {
        self.has(Self::GATE_CLOSED)
    }

    pub fn is_user_door_open(self) -> bool {
        self.has(Self::USER_DOOR)
    }

    pub fn has_warning(self) -> bool {
        self.has(Self::WARNING)
    }

    pub fn has_error(self) -> bool {
        self.has(Self::ERROR)
    }

    fn has(self, mask: u16) -> bool {
        self.0 & mask != 0
    }
}

/// Where a plate sits for a move operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatePosition {
    TransferStation = 1,
    SlotLevel = 2,
    Shovel = 3,
    Tunnel = 4,
    TubePicker = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateType {
    /// Microtiter plate.
    Mtp = 0,
    /// Deep-well plate.
    Dwp = 1,
    P28 = 3,
}

/// One end of a `STX2ServiceMovePlate` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    /// Identifier of the device holding the plate.
    pub device_id: String,
    pub position: PlatePosition,
    pub slot: u32,
    pub level: u32,
    /// Transport slot, required when moving between cascaded devices.
    /// Selects the plate position on a tube picker.
    pub transport_slot: u32,
    pub plate_type: PlateType,
}

impl TransferInfo {
    /// The six command arguments, device id first.
    pub(crate) fn fields(&self) -> [String; 6] {
        [
            self.device_id.clone(),
            (self.position as u8).to_string(),
            self.slot.to_string(),
            self.level.to_string(),
            self.transport_slot.to_string(),
            (self.plate_type as u8).to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_climate_from_response() {
        let climate = Climate::from_response("37.0;90.5;5.0;0.0\r\n");
        assert_eq!(
            climate,
            Climate {
                temperature: 37.0,
                relative_humidity: 90.5,
                co2_percent: 5.0,
                n2_percent: 0.0,
            }
        );
    }

    #[test]
    fn test_climate_unparsable_fields_read_as_zero() {
        let climate = Climate::from_response("37.0;n/a;5.0");
        assert_eq!(climate.temperature, 37.0);
        assert_eq!(climate.relative_humidity, 0.0);
        assert_eq!(climate.co2_percent, 5.0);
        assert_eq!(climate.n2_percent, 0.0);
    }

    #[test]
    fn test_system_status_bits() {
        let status = SystemStatus::from_bits(0b1001_0101);
        assert!(status.is_ready());
        assert!(!status.is_plate_ready());
        assert!(status.is_initialized());
        assert!(status.is_gate_closed());
        assert!(!status.is_user_door_open());
        assert!(!status.has_warning());
        assert!(status.has_error());
        assert_eq!(status.bits(), 149);
    }

    #[test]
    fn test_transfer_info_fields() {
        let info = TransferInfo {
            device_id: "2".to_string(),
            position: PlatePosition::SlotLevel,
            slot: 4,
            level: 11,
            transport_slot: 0,
            plate_type: PlateType::Dwp,
        };
        assert_eq!(info.fields(), ["2", "2", "4", "11", "0", "1"].map(String::from));
    }
}
