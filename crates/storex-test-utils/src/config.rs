//! Configuration builders and temp-file fixtures for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`StorexConfig`] values
//! without repeating boilerplate across crate boundaries.

use std::net::SocketAddr;
use std::path::PathBuf;

use storex_config::{Framing, StorexConfig};
use tempfile::TempDir;

/// Fluent builder for [`StorexConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .endpoint(peer.addr())
///     .framing(Framing::UntilClose)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: StorexConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StorexConfig::default(),
        }
    }

    /// Point the device section at a socket address (usually a [`StubPeer`](crate::StubPeer)).
    pub fn endpoint(mut self, addr: SocketAddr) -> Self {
        self.config.device.host = addr.ip().to_string();
        self.config.device.port = addr.port();
        self
    }

    pub fn device_id(mut self, id: &str) -> Self {
        self.config.device.device_id = id.to_string();
        self
    }

    pub fn framing(mut self, framing: Framing) -> Self {
        self.config.bridge.framing = framing;
        self
    }

    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.config.bridge.receive_buffer_size = size;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.bridge.connect_timeout_ms = ms;
        self
    }

    pub fn response_timeout_ms(mut self, ms: u64) -> Self {
        self.config.bridge.response_timeout_ms = ms;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> StorexConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A config file written into an owned temp directory.
///
/// The temp directory is deleted automatically when this value is dropped,
/// guaranteeing cleanup even on panic.
pub struct TestConfigFile {
    pub config: StorexConfig,
    pub path: PathBuf,
    _temp_dir: TempDir,
}

impl TestConfigFile {
    /// Write the given TOML string to a temp file and load it back.
    pub async fn with_toml(toml_content: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("storex.toml");
        tokio::fs::write(&path, toml_content)
            .await
            .expect("failed to write test config");

        let config = StorexConfig::load(&path)
            .await
            .expect("failed to parse test config");

        Self {
            config,
            path,
            _temp_dir: temp_dir,
        }
    }
}
