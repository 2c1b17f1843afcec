#![deny(unsafe_code)]

//! StoreX incubator TCP client.
//!
//! [`TransportChannel`] owns the one TCP connection to a StoreX server and
//! exposes non-blocking connect, send and receive primitives.
//! [`CommandBridge`] layers a blocking request/response call on top of it,
//! with one request in flight at a time and replies framed by
//! [`ResponseAccumulator`].

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Blocking request/response bridge over a transport channel.
pub mod bridge;
/// Reply completion policies.
pub mod framing;
/// Tracing subscriber initialisation.
pub mod logging;
/// Single TCP connection with async primitives.
pub mod transport;

pub use bridge::{BridgeError, CommandBridge, CommandLink};
pub use framing::ResponseAccumulator;
pub use storex_config::{BridgeConfig, Framing};
pub use tokio_util::sync::CancellationToken;
pub use transport::{Completion, ConnectionState, TransportChannel, TransportError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether the current thread is driving a tokio runtime.
pub(crate) fn in_async_context() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}
