//! Command bridge: one synchronous call per StoreX command.
//!
//! The bridge owns a small I/O runtime and at most one [`TransportChannel`].
//! [`CommandBridge::send`] submits the command, makes sure exactly one receive
//! is outstanding and parks the caller on a one-shot signal that the receive
//! callback resolves according to the configured [`Framing`].
//!
//! ```text
//!  caller thread                     storex-io runtime
//!  ─────────────                     ─────────────────
//!  send("STX2Reset(1)\r") ──begin_send──▶ write_all
//!        │               ──begin_receive─▶ read ──▶ ResponseAccumulator
//!        ▼                                              │
//!  wait (timeout / cancel / close) ◀──── one-shot ──────┘
//! ```
//!
//! Only one request is ever in flight: callers queue on a fair async mutex,
//! so replies are observed in submission order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use storex_config::BridgeConfig;
use tokio::runtime::Runtime;
use tokio::sync::{MutexGuard, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::framing::ResponseAccumulator;
use crate::transport::{Completion, ConnectionState, TransportChannel, TransportError};
use crate::{in_async_context, lock};

/// Errors surfaced to callers of the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge is not connected")]
    NotConnected,

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("bridge closed while the request was pending")]
    Closed,

    #[error("another request is already in flight")]
    Busy,

    #[error("blocking bridge call made from inside an async runtime")]
    AsyncContext,

    #[error("invalid bridge configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to start I/O runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// The three operations the device-command layer may use.
///
/// Implemented by [`CommandBridge`]; other implementations stand in for a
/// real StoreX in tests.
pub trait CommandLink: Send + Sync {
    /// Connect to `host:port` unless already connected.
    fn open(&self, host: &str, port: u16) -> Result<(), BridgeError>;

    /// Disconnect and release the connection.
    fn close(&self) -> Result<(), BridgeError>;

    /// Send one command (terminator included) and return its reply.
    fn send(&self, command: &str) -> Result<String, BridgeError>;
}

struct InFlight {
    accumulator: ResponseAccumulator,
    reply: oneshot::Sender<Result<Bytes, BridgeError>>,
}

/// State shared between the waiting caller and receive callbacks.
#[derive(Default)]
struct Exchange {
    in_flight: StdMutex<Option<InFlight>>,
    receive_armed: AtomicBool,
}

impl Exchange {
    fn begin(&self, in_flight: InFlight) {
        if lock(&self.in_flight).replace(in_flight).is_some() {
            warn!("Discarded a stale in-flight request");
        }
    }

    fn clear(&self) {
        lock(&self.in_flight).take();
    }

    fn fail(&self, err: BridgeError) {
        if let Some(pending) = lock(&self.in_flight).take() {
            let _ = pending.reply.send(Err(err));
        }
    }

    /// Handle one receive event. Returns whether a follow-up receive is due.
    fn on_receive(&self, result: Result<Bytes, TransportError>) -> bool {
        let data = match result {
            Ok(data) => data,
            Err(TransportError::Aborted) => {
                trace!("Receive aborted by disconnect");
                return false;
            }
            Err(err) => {
                self.receive_armed.store(false, Ordering::SeqCst);
                self.fail(BridgeError::Transport(err));
                return false;
            }
        };
        self.receive_armed.store(false, Ordering::SeqCst);

        let count = data.len();
        debug!(count, "Received from StoreX");

        let mut slot = lock(&self.in_flight);
        let completed = match slot.as_mut() {
            Some(pending) => {
                let completed = pending.accumulator.on_read(data);
                if completed.is_none() {
                    trace!(
                        buffered = pending.accumulator.buffered(),
                        "Reply still accumulating"
                    );
                }
                completed
            }
            None => {
                if count > 0 {
                    warn!(count, "Dropping bytes received with no request in flight");
                }
                None
            }
        };
        if let Some(reply) = completed
            && let Some(pending) = slot.take()
        {
            let _ = pending.reply.send(Ok(reply));
        }

        count > 0
    }
}

/// Submit a receive unless one is already outstanding, re-arming after every
/// non-empty read so late bytes are always picked up.
fn arm_receive(exchange: &Arc<Exchange>, channel: &TransportChannel, buffer_size: usize) {
    if exchange.receive_armed.swap(true, Ordering::SeqCst) {
        trace!("Receive already outstanding");
        return;
    }
    let follow_up = channel.clone();
    let exchange = Arc::clone(exchange);
    channel.begin_receive(buffer_size, move |result| {
        if exchange.on_receive(result) {
            arm_receive(&exchange, &follow_up, buffer_size);
        }
    });
}

/// Synchronous request/response bridge over a single StoreX connection.
pub struct CommandBridge {
    config: BridgeConfig,
    /// Taken on drop so the runtime can shut down from any context.
    runtime: Option<Runtime>,
    /// Serializes `open` and `close`.
    lifecycle: StdMutex<()>,
    channel: StdMutex<Option<TransportChannel>>,
    single_flight: tokio::sync::Mutex<()>,
    exchange: Arc<Exchange>,
}

impl CommandBridge {
    /// Create a bridge with its own I/O runtime. No connection is made yet.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        if config.receive_buffer_size == 0 {
            return Err(BridgeError::InvalidConfig(
                "receive_buffer_size must be at least 1".to_string(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("storex-io")
            .enable_all()
            .build()
            .map_err(BridgeError::Runtime)?;

        Ok(Self {
            config,
            runtime: Some(runtime),
            lifecycle: StdMutex::new(()),
            channel: StdMutex::new(None),
            single_flight: tokio::sync::Mutex::new(()),
            exchange: Arc::new(Exchange::default()),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.channel)
            .as_ref()
            .map_or(ConnectionState::Disconnected, TransportChannel::state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect to `host:port`, blocking until connected.
    ///
    /// A no-op while connected, including for a caller that waited on a
    /// concurrent `open`. After a failure the bridge stays disconnected and
    /// `open` may be called again.
    pub fn open(&self, host: &str, port: u16) -> Result<(), BridgeError> {
        if in_async_context() {
            return Err(BridgeError::AsyncContext);
        }
        let _lifecycle = lock(&self.lifecycle);
        let handle = self.runtime()?.handle().clone();
        let channel = {
            let mut slot = lock(&self.channel);
            if let Some(existing) = slot.as_ref()
                && existing.is_connected()
            {
                debug!(host, port, "Bridge already open");
                return Ok(());
            }
            slot.get_or_insert_with(|| TransportChannel::new(handle))
                .clone()
        };

        // Receives left on a dead connection were aborted with it.
        self.exchange.receive_armed.store(false, Ordering::SeqCst);
        channel.connect(host, port, self.config.connect_timeout())?;
        info!(
            host,
            port,
            peer = ?channel.peer_addr(),
            framing = ?self.config.framing,
            "Command bridge open"
        );
        Ok(())
    }

    /// Fail any pending request with [`BridgeError::Closed`], then shut the
    /// connection down and release it. A no-op on a bridge never opened.
    ///
    /// Waits for an `open` running on another thread to finish first.
    pub fn close(&self) -> Result<(), BridgeError> {
        if in_async_context() {
            return Err(BridgeError::AsyncContext);
        }
        let _lifecycle = lock(&self.lifecycle);
        let Some(channel) = lock(&self.channel).take() else {
            debug!("Close on a bridge without a channel");
            return Ok(());
        };

        self.exchange.fail(BridgeError::Closed);
        if channel.is_connected() {
            channel.disconnect()?;
        } else {
            channel.abort();
        }
        self.exchange.receive_armed.store(false, Ordering::SeqCst);
        info!("Command bridge closed");
        Ok(())
    }

    /// Send `command` and block until its reply is framed.
    ///
    /// Waits behind any request already in flight.
    pub fn send(&self, command: &str) -> Result<String, BridgeError> {
        self.dispatch(command, None, true)
    }

    /// Like [`send`](Self::send), resolving with [`BridgeError::Cancelled`]
    /// once `cancel` fires.
    pub fn send_with_cancel(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BridgeError> {
        self.dispatch(command, Some(cancel), true)
    }

    /// Like [`send`](Self::send), but fails with [`BridgeError::Busy`]
    /// instead of waiting when another request is in flight.
    pub fn try_send(&self, command: &str) -> Result<String, BridgeError> {
        self.dispatch(command, None, false)
    }

    fn dispatch(
        &self,
        command: &str,
        cancel: Option<&CancellationToken>,
        queue: bool,
    ) -> Result<String, BridgeError> {
        if in_async_context() {
            return Err(BridgeError::AsyncContext);
        }
        let reply = self.runtime()?.block_on(async {
            let _guard = self.acquire(cancel, queue).await?;
            self.exchange(command, cancel).await
        })?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    async fn acquire(
        &self,
        cancel: Option<&CancellationToken>,
        queue: bool,
    ) -> Result<MutexGuard<'_, ()>, BridgeError> {
        if !queue {
            return self.single_flight.try_lock().map_err(|_| BridgeError::Busy);
        }
        match cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => Err(BridgeError::Cancelled),
                guard = self.single_flight.lock() => Ok(guard),
            },
            None => Ok(self.single_flight.lock().await),
        }
    }

    async fn exchange(
        &self,
        command: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Bytes, BridgeError> {
        let channel = self.connected_channel()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.exchange.begin(InFlight {
            accumulator: ResponseAccumulator::new(self.config.framing),
            reply: reply_tx,
        });

        let sent = channel.begin_send(Bytes::copy_from_slice(command.as_bytes()));
        debug!(command = command.trim_end(), "Sent command to StoreX");
        arm_receive(&self.exchange, &channel, self.config.receive_buffer_size);

        let outcome = self.await_reply(sent, reply_rx, cancel).await;
        match &outcome {
            Ok(reply) => debug!(bytes = reply.len(), "Reply framed"),
            Err(e) => {
                warn!(command = command.trim_end(), error = %e, "Command failed");
                self.exchange.clear();
            }
        }
        outcome
    }

    async fn await_reply(
        &self,
        sent: Completion<usize>,
        reply: oneshot::Receiver<Result<Bytes, BridgeError>>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Bytes, BridgeError> {
        let completed = async {
            sent.wait().await?;
            reply.await.unwrap_or(Err(BridgeError::Closed))
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match self.config.response_timeout() {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = completed => result,
            () = cancelled => Err(BridgeError::Cancelled),
            limit = deadline => Err(BridgeError::Timeout(limit)),
        }
    }

    fn runtime(&self) -> Result<&Runtime, BridgeError> {
        self.runtime.as_ref().ok_or(BridgeError::Closed)
    }

    fn connected_channel(&self) -> Result<TransportChannel, BridgeError> {
        lock(&self.channel)
            .as_ref()
            .filter(|channel| channel.is_connected())
            .cloned()
            .ok_or(BridgeError::NotConnected)
    }
}

impl CommandLink for CommandBridge {
    fn open(&self, host: &str, port: u16) -> Result<(), BridgeError> {
        CommandBridge::open(self, host, port)
    }

    fn close(&self) -> Result<(), BridgeError> {
        CommandBridge::close(self)
    }

    fn send(&self, command: &str) -> Result<String, BridgeError> {
        CommandBridge::send(self, command)
    }
}

impl Drop for CommandBridge {
    fn drop(&mut self) {
        self.exchange.fail(BridgeError::Closed);
        if let Some(channel) = lock(&self.channel).take() {
            channel.abort();
        }
        // Dropping a runtime inside another runtime panics; this does not.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
