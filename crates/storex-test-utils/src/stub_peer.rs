//! Scripted stand-in for a StoreX server.
//!
//! A [`StubPeer`] listens on `127.0.0.1:0` on a background thread. Every
//! `\r`-terminated command it receives consumes the next script (a list of
//! [`Action`]s); once the scripts are exhausted the fallback script runs.
//! Received commands and accepted connections are recorded for assertions.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// One step of the peer's reaction to a command.
#[derive(Debug, Clone)]
pub enum Action {
    /// Write these bytes in a single write call.
    Write(Vec<u8>),
    /// Write the received command back, without its `\r` terminator.
    Echo,
    /// Sleep before the next action.
    Pause(Duration),
    /// Shut the connection down (the client sees a zero-length read).
    Close,
}

impl Action {
    /// Shorthand for [`Action::Write`] with text.
    pub fn write(text: &str) -> Self {
        Self::Write(text.as_bytes().to_vec())
    }

    /// Shorthand for [`Action::Pause`] in milliseconds.
    pub fn pause_ms(ms: u64) -> Self {
        Self::Pause(Duration::from_millis(ms))
    }
}

#[derive(Default)]
struct PeerState {
    scripts: Mutex<VecDeque<Vec<Action>>>,
    fallback: Vec<Action>,
    received: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

/// Handle to a running stub peer.
pub struct StubPeer {
    addr: SocketAddr,
    state: Arc<PeerState>,
}

impl StubPeer {
    /// Start a peer that answers the n-th command with the n-th script and
    /// stays silent afterwards.
    pub fn spawn(scripts: Vec<Vec<Action>>) -> Self {
        Self::spawn_with_fallback(scripts, Vec::new())
    }

    /// Start a peer that echoes every command back.
    pub fn echo() -> Self {
        Self::spawn_with_fallback(Vec::new(), vec![Action::Echo])
    }

    /// Start a peer that runs `fallback` once `scripts` are exhausted.
    pub fn spawn_with_fallback(scripts: Vec<Vec<Action>>, fallback: Vec<Action>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind stub peer");
        let addr = listener.local_addr().expect("stub peer has no local addr");
        let state = Arc::new(PeerState {
            scripts: Mutex::new(scripts.into()),
            fallback,
            ..PeerState::default()
        });

        let accept_state = Arc::clone(&state);
        thread::Builder::new()
            .name("storex-stub-peer".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    accept_state.connections.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(%addr, "Stub peer accepted connection");
                    serve(stream, &accept_state);
                }
            })
            .expect("failed to spawn stub peer thread");

        Self { addr, state }
    }

    /// An address on which nothing is listening.
    pub fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind probe listener");
        listener.local_addr().expect("probe listener has no local addr")
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Commands received so far, including their `\r` terminators.
    pub fn received(&self) -> Vec<String> {
        self.state
            .received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

fn serve(stream: TcpStream, state: &PeerState) {
    let _ = stream.set_nodelay(true);
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;

    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\r', &mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = String::from_utf8_lossy(&line).into_owned();
        if let Ok(mut received) = state.received.lock() {
            received.push(command.clone());
        }

        let script = state
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| state.fallback.clone());

        for action in script {
            let written = match action {
                Action::Write(bytes) => writer.write_all(&bytes).and_then(|()| writer.flush()),
                Action::Echo => writer
                    .write_all(command.trim_end_matches('\r').as_bytes())
                    .and_then(|()| writer.flush()),
                Action::Pause(delay) => {
                    thread::sleep(delay);
                    Ok(())
                }
                Action::Close => {
                    let _ = writer.shutdown(Shutdown::Both);
                    return;
                }
            };
            if written.is_err() {
                return;
            }
        }
    }
}
