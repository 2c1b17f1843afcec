#![deny(unsafe_code)]

//! Shared test utilities for the StoreX workspace.
//!
//! Provides a scripted stub StoreX peer and config builders so that
//! individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! storex-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod stub_peer;

pub use config::{TestConfigBuilder, TestConfigFile};
pub use stub_peer::{Action, StubPeer};
