//! Owns one controller connection: the shared per-session state (`spec.md`
//! §3's `ControlSession`), the write serializer, and the reader loop that
//! drives the dispatcher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::client_id::ClientIdAllocator;
use crate::dispatcher;
use crate::error::SessionError;

/// One accepted external TCP connection being multiplexed to the
/// controller (`spec.md` §3 `ForwardedTCPConnection`).
pub struct TcpConnectionHandle {
    pub listen_port: u16,
    pub initialized: Arc<AtomicBool>,
    pub initialized_notify: Arc<Notify>,
    pub write_half: Arc<AsyncMutex<Option<OwnedWriteHalf>>>,
    pub close_notify: Arc<Notify>,
}

/// A live TCP forward rule (`spec.md` §3 `TCPForwardListener`).
pub struct TcpForwardListener {
    pub acceptor_task: JoinHandle<()>,
}

/// A live UDP forward rule (`spec.md` §3 `UDPForwardListener`).
pub struct UdpForwardListener {
    pub socket: Arc<tokio::net::UdpSocket>,
    pub receiver_task: JoinHandle<()>,
}

/// All state scoped to one controller connection. Constructed fresh per
/// session; nothing here is shared across sessions (`spec.md` §9 "Per-
/// session globals").
pub struct SessionState {
    pub peer: SocketAddr,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub client_ids: SyncMutex<ClientIdAllocator>,
    pub tcp_connections: SyncMutex<HashMap<u32, TcpConnectionHandle>>,
    pub tcp_listeners: SyncMutex<HashMap<u16, TcpForwardListener>>,
    pub udp_listeners: SyncMutex<HashMap<u16, UdpForwardListener>>,
    fatal: Notify,
    fatal_error: SyncMutex<Option<SessionError>>,
}

impl SessionState {
    /// Enqueues a whole frame for the writer task. Producers never touch
    /// the socket directly, so frames from distinct producers can never
    /// interleave (`spec.md` §4.3).
    pub fn send_frame(&self, frame: Vec<u8>) {
        // The writer task only disappears once the session is tearing
        // down, at which point nobody cares whether this last frame made
        // it out.
        let _ = self.writer_tx.send(frame);
    }

    /// Marks the whole session as fatally failed. Callers other than the
    /// reader loop (e.g. a pump that exhausted the client id space,
    /// `spec.md` §4.2/§7) have no direct path to end the session
    /// themselves; this wakes `reader_loop` so it can tear everything
    /// down instead of the failure being silently scoped to one pump.
    pub fn fail(&self, error: SessionError) {
        let mut slot = self.fatal_error.lock();
        if slot.is_none() {
            *slot = Some(error);
            self.fatal.notify_one();
        }
    }
}

/// Runs one controller connection to completion: spawns the write
/// serializer, drives the read loop, then tears down every owned
/// listener and pump before returning.
pub async fn run(stream: TcpStream, peer: SocketAddr) -> Result<(), SessionError> {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();

    let state = Arc::new(SessionState {
        peer,
        writer_tx,
        client_ids: SyncMutex::new(ClientIdAllocator::new()),
        tcp_connections: SyncMutex::new(HashMap::new()),
        tcp_listeners: SyncMutex::new(HashMap::new()),
        udp_listeners: SyncMutex::new(HashMap::new()),
        fatal: Notify::new(),
        fatal_error: SyncMutex::new(None),
    });

    let writer_task = tokio::spawn(writer_loop(write_half, writer_rx));

    let span = tracing::info_span!("control_session", %peer);
    let result = reader_loop(read_half, state.clone()).instrument(span).await;

    shutdown(&state).await;
    writer_task.abort();

    result
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(error) = write_half.write_all(&frame).await {
            tracing::warn!(%error, "controller write failed, ending session");
            break;
        }
    }
}

async fn reader_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    state: Arc<SessionState>,
) -> Result<(), SessionError> {
    loop {
        let mut opcode_byte = [0u8; 1];
        tokio::select! {
            result = read_half.read_exact(&mut opcode_byte) => {
                match result {
                    Ok(_) => {}
                    Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
                        tracing::info!("controller disconnected");
                        return Ok(());
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            _ = state.fatal.notified() => {
                let error = state.fatal_error.lock().take()
                    .expect("fatal notified without a recorded error");
                return Err(error);
            }
        }

        dispatcher::dispatch(opcode_byte[0], &mut read_half, &state).await?;
    }
}

/// Best-effort teardown: stop every listener and pump owned by this
/// session. Does not wait synchronously for pump tasks to finish
/// (`spec.md` §4.4).
async fn shutdown(state: &Arc<SessionState>) {
    for (_, listener) in state.tcp_listeners.lock().drain() {
        listener.acceptor_task.abort();
    }
    for (_, listener) in state.udp_listeners.lock().drain() {
        listener.receiver_task.abort();
    }
    for (_, connection) in state.tcp_connections.lock().drain() {
        connection.initialized.store(true, Ordering::SeqCst);
        connection.initialized_notify.notify_one();
        connection.close_notify.notify_one();
    }
}
