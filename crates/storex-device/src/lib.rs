#![deny(unsafe_code)]

//! Typed StoreX commands.
//!
//! [`StoreX`] turns each documented `STX2*` command into a method that formats
//! the request, sends it through a [`CommandLink`] and interprets the reply.
//! Device-reported failure codes come back as [`DeviceError::Rejected`] with
//! the raw code.

pub mod device;
pub mod protocol;
pub mod types;

pub use device::StoreX;
pub use storex_core::{BridgeError, CommandBridge, CommandLink};
pub use types::{
    Climate, DetectorStatus, PlatePosition, PlateType, SystemStatus, TransferInfo,
    TransferStation, UserDoorStatus,
};

/// Errors from StoreX device commands.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("{command} rejected by device with code {code:?}")]
    Rejected { command: &'static str, code: String },

    #[error("barcode reader failed to open with code {code:?}")]
    BarcodeReader { code: String },

    #[error("{command} returned an unexpected reply: {reply:?}")]
    Malformed { command: &'static str, reply: String },
}
