//! Reply framing: deciding when a StoreX reply is complete.
//!
//! The protocol has no length prefix and no terminator on replies. A
//! [`ResponseAccumulator`] is fed every receive event of one exchange and
//! yields the reply once the configured [`Framing`] considers it complete:
//!
//! - a non-empty read is appended to the buffer. Under [`Framing::FirstRead`]
//!   that read alone is the reply;
//! - a zero-length read ends the exchange. The reply is the accumulated
//!   buffer when it holds more than one byte, otherwise the last read.

use bytes::{Bytes, BytesMut};
use storex_config::Framing;

/// Per-request reply buffer.
#[derive(Debug)]
pub struct ResponseAccumulator {
    framing: Framing,
    buffer: BytesMut,
    last_read: Bytes,
}

impl ResponseAccumulator {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: BytesMut::new(),
            last_read: Bytes::new(),
        }
    }

    /// Feed one receive event. Returns the reply once the exchange is complete.
    pub fn on_read(&mut self, data: Bytes) -> Option<Bytes> {
        if data.is_empty() {
            return Some(self.finish());
        }
        self.buffer.extend_from_slice(&data);
        self.last_read = data;
        match self.framing {
            Framing::FirstRead => Some(self.last_read.clone()),
            Framing::UntilClose => None,
        }
    }

    /// Bytes accumulated so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn finish(&mut self) -> Bytes {
        if self.buffer.len() > 1 {
            self.buffer.split().freeze()
        } else {
            std::mem::take(&mut self.last_read)
        }
    }
}
