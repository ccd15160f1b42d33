//! Per-external-TCP-connection pump (`spec.md` §4.5): frames inbound
//! bytes onto the control stream and, once the controller has
//! acknowledged the connection, relays its replies back out.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::error::SessionError;
use crate::protocol::{EncodedAddress, Opcode};
use crate::session::{SessionState, TcpConnectionHandle};

/// Largest chunk read per iteration: the wire length field is a `u16`, so
/// nothing larger can ever be framed in one `TCP_MESSAGE` (`spec.md` §4.5).
const MAX_CHUNK: usize = 65535;

/// Accepts ownership of a freshly-accepted external connection, allocates
/// its client id, announces it to the controller, and relays bytes until
/// either side terminates the connection.
pub async fn spawn(stream: TcpStream, peer_addr: SocketAddr, listen_port: u16, state: Arc<SessionState>) {
    let client_id = {
        let mut allocator = state.client_ids.lock();
        let result = allocator.allocate(|id| state.tcp_connections.lock().contains_key(&id));
        match result {
            Ok(id) => id,
            Err(error) => {
                tracing::error!(%error, "client id space exhausted, ending session");
                state.fail(SessionError::ClientIdsExhausted);
                return;
            }
        }
    };

    let (mut read_half, write_half) = stream.into_split();

    let initialized = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let initialized_notify = Arc::new(Notify::new());
    let close_notify = Arc::new(Notify::new());
    let write_half = Arc::new(AsyncMutex::new(Some(write_half)));

    state.tcp_connections.lock().insert(
        client_id,
        TcpConnectionHandle {
            listen_port,
            initialized: initialized.clone(),
            initialized_notify: initialized_notify.clone(),
            write_half: write_half.clone(),
            close_notify: close_notify.clone(),
        },
    );

    tracing::debug!(client_id, %peer_addr, listen_port, "accepted external connection");
    state.send_frame(initiate_connection_frame(peer_addr, listen_port, client_id));

    if !initialized.load(Ordering::SeqCst) {
        tokio::select! {
            _ = initialized_notify.notified() => {}
            _ = close_notify.notified() => {
                finish(&state, client_id, &write_half, false).await;
                return;
            }
        }
    }

    let mut buf = vec![0u8; MAX_CHUNK];
    let terminated_by_peer = loop {
        tokio::select! {
            _ = close_notify.notified() => break false,
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => break true,
                    Ok(n) => {
                        state.send_frame(tcp_message_frame(client_id, &buf[..n]));
                    }
                    Err(error) => {
                        tracing::debug!(client_id, %error, "external connection read error");
                        break true;
                    }
                }
            }
        }
    };

    finish(&state, client_id, &write_half, terminated_by_peer).await;
}

async fn finish(
    state: &Arc<SessionState>,
    client_id: u32,
    write_half: &Arc<AsyncMutex<Option<tokio::net::tcp::OwnedWriteHalf>>>,
    emit_close_frame: bool,
) {
    if let Some(mut half) = write_half.lock().await.take() {
        use tokio::io::AsyncWriteExt;
        let _ = half.shutdown().await;
    }

    // Whoever actually removes a still-live entry owns emitting the close
    // frame; a controller-initiated close or a listener teardown already
    // removed the entry (and does not want an echo), so only do this when
    // the external peer (or its socket) ended the connection itself.
    let removed = state.tcp_connections.lock().remove(&client_id).is_some();
    if removed && emit_close_frame {
        state.send_frame(close_connection_frame(client_id));
    }
    tracing::debug!(client_id, "pump terminated");
}

fn initiate_connection_frame(peer_addr: SocketAddr, listen_port: u16, client_id: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + 17 + 2 + 2 + 4);
    frame.push(Opcode::TcpInitiateConnection.as_byte());
    EncodedAddress(peer_addr.ip()).write_to(&mut frame);
    frame.extend_from_slice(&peer_addr.port().to_be_bytes());
    frame.extend_from_slice(&listen_port.to_be_bytes());
    frame.extend_from_slice(&client_id.to_be_bytes());
    frame
}

fn tcp_message_frame(client_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + 4 + 2 + payload.len());
    frame.push(Opcode::TcpMessage.as_byte());
    frame.extend_from_slice(&client_id.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn close_connection_frame(client_id: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + 4);
    frame.push(Opcode::TcpCloseConnection.as_byte());
    frame.extend_from_slice(&client_id.to_be_bytes());
    frame
}
