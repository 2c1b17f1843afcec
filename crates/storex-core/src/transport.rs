//! Transport channel: the single TCP connection to a StoreX server.
//!
//! [`TransportChannel::connect`] and [`TransportChannel::disconnect`] block the
//! calling thread. Sends and receives are submitted to the I/O runtime and
//! report completion through a [`Completion`] or a callback, so the command
//! bridge decides how long to wait for them.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{in_async_context, lock};

/// Errors raised at the socket layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("no usable address for {host}:{port}")]
    NoAddress { host: String, port: u16 },

    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },

    #[error("connecting to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    #[error("channel is not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("orderly shutdown failed: {0}")]
    Shutdown(#[source] io::Error),

    #[error("operation aborted by disconnect")]
    Aborted,

    #[error("blocking transport call made from inside an async runtime")]
    AsyncContext,
}

/// Connection lifecycle of a [`TransportChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// One-shot completion of a submitted operation.
#[must_use = "a completion does nothing unless waited on"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, TransportError>>,
}

impl<T> Completion<T> {
    /// Wait for the operation from async code.
    pub async fn wait(self) -> Result<T, TransportError> {
        self.rx.await.unwrap_or(Err(TransportError::Aborted))
    }

    /// Park the current thread until the operation completes.
    pub fn wait_blocking(self) -> Result<T, TransportError> {
        if in_async_context() {
            return Err(TransportError::AsyncContext);
        }
        self.rx.blocking_recv().unwrap_or(Err(TransportError::Aborted))
    }
}

struct ChannelInner {
    handle: Handle,
    state: AtomicU8,
    peer: StdMutex<Option<SocketAddr>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    abort: StdMutex<CancellationToken>,
}

/// Non-blocking byte transport over one TCP stream.
///
/// Cheap to clone; clones share the same socket.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<ChannelInner>,
}

impl TransportChannel {
    /// Create a disconnected channel whose I/O runs on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                handle,
                state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
                peer: StdMutex::new(None),
                reader: Mutex::new(None),
                writer: Mutex::new(None),
                abort: StdMutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Address of the connected peer, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.peer)
    }

    /// Resolve `host`, open a stream socket and block until the connect
    /// completes or fails.
    ///
    /// A connected channel is left untouched. On failure the channel is back
    /// in [`ConnectionState::Disconnected`] and may be connected again.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        if in_async_context() {
            return Err(TransportError::AsyncContext);
        }
        match self.inner.state.compare_exchange(
            ConnectionState::Disconnected.as_u8(),
            ConnectionState::Connecting.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(current) if ConnectionState::from_u8(current) == ConnectionState::Connected => {
                debug!(host, port, "Channel already connected");
                return Ok(());
            }
            Err(_) => return Err(TransportError::ConnectInProgress),
        }

        debug!(host, port, ?timeout, "Connecting to StoreX");
        let inner = Arc::clone(&self.inner);
        let host_owned = host.to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.handle.spawn(async move {
            let establish = inner.establish(&host_owned, port);
            let result = bounded_connect(establish, timeout, &host_owned, port).await;
            let _ = tx.send(result);
        });

        let connected = Completion { rx }.wait_blocking();
        if let Err(e) = &connected {
            warn!(host, port, error = %e, "Connect to StoreX failed");
            self.inner.set_state(ConnectionState::Disconnected);
        }
        connected
    }

    /// Shut down the write direction, abort any pending receive and release
    /// the socket. Blocks until the shutdown has been performed.
    pub fn disconnect(&self) -> Result<(), TransportError> {
        if in_async_context() {
            return Err(TransportError::AsyncContext);
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.inner.mark_disconnected();

        let inner = Arc::clone(&self.inner);
        let (tx, rx) = oneshot::channel();
        self.inner.handle.spawn(async move {
            let _ = tx.send(inner.release().await);
        });
        Completion { rx }.wait_blocking()
    }

    /// Mark the channel disconnected and abort pending receives without
    /// blocking. The socket is released once the last clone is dropped.
    pub fn abort(&self) {
        self.inner.mark_disconnected();
    }

    /// Submit `bytes` for transmission.
    pub fn begin_send(&self, bytes: Bytes) -> Completion<usize> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            let _ = tx.send(inner.write(bytes).await);
        });
        Completion { rx }
    }

    /// Submit a single receive of up to `buffer_size` bytes.
    ///
    /// `on_complete` runs on the I/O runtime with the bytes read; an empty
    /// buffer means the peer closed its side.
    pub fn begin_receive<F>(&self, buffer_size: usize, on_complete: F)
    where
        F: FnOnce(Result<Bytes, TransportError>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let abort = inner.abort_token();
        self.inner.handle.spawn(async move {
            let result = tokio::select! {
                biased;
                () = abort.cancelled() => Err(TransportError::Aborted),
                read = inner.read(buffer_size) => read,
            };
            on_complete(result);
        });
    }
}

impl ChannelInner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn abort_token(&self) -> CancellationToken {
        lock(&self.abort).clone()
    }

    fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
        lock(&self.abort).cancel();
    }

    async fn establish(&self, host: &str, port: u16) -> Result<(), TransportError> {
        let addr = resolve(host, port).await?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle on StoreX socket");
        }

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        *lock(&self.abort) = CancellationToken::new();
        *lock(&self.peer) = Some(addr);
        self.set_state(ConnectionState::Connected);

        info!(%addr, "Socket connected to StoreX");
        Ok(())
    }

    async fn release(&self) -> Result<(), TransportError> {
        let writer = self.writer.lock().await.take();
        let shutdown = match writer {
            Some(mut w) => w.shutdown().await.map_err(TransportError::Shutdown),
            None => Ok(()),
        };
        self.reader.lock().await.take();
        let peer = lock(&self.peer).take();
        info!(peer = ?peer, "Socket to StoreX released");
        shutdown
    }

    async fn write(&self, bytes: Bytes) -> Result<usize, TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(error = %e, "Send to StoreX failed");
            self.mark_disconnected();
            return Err(TransportError::Send(e));
        }
        trace!(bytes_sent = bytes.len(), "Send complete");
        Ok(bytes.len())
    }

    async fn read(&self, buffer_size: usize) -> Result<Bytes, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buf = vec![0u8; buffer_size];
        let count = match reader.read(&mut buf).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Receive from StoreX failed");
                self.mark_disconnected();
                return Err(TransportError::Receive(e));
            }
        };
        if count == 0 {
            info!("StoreX closed its side of the connection");
            self.mark_disconnected();
        }
        buf.truncate(count);
        Ok(Bytes::from(buf))
    }
}

/// Run a connect attempt, failing with [`TransportError::ConnectTimeout`]
/// once `timeout` elapses.
async fn bounded_connect<F>(
    connecting: F,
    timeout: Option<Duration>,
    host: &str,
    port: u16,
) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    let Some(limit) = timeout else {
        return connecting.await;
    };
    tokio::time::timeout(limit, connecting)
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::ConnectTimeout {
                host: host.to_string(),
                port,
                timeout: limit,
            })
        })
}

/// Resolve `host`, preferring IPv4 like the StoreX server software expects.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| TransportError::Resolve {
            host: host.to_string(),
            port,
            source,
        })?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::NoAddress {
            host: host.to_string(),
            port,
        })
}
