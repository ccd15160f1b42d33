//! Reads one opcode from the controller and routes to the handler
//! responsible for it (`spec.md` §4.7). Only fatal I/O errors escape this
//! module; every protocol-level problem is turned into either a STATUS
//! reply or a silent drop.

use std::sync::atomic::Ordering;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use crate::error::SessionError;
use crate::protocol::{status_frame, EncodedAddress, Opcode, Status};
use crate::registry;
use crate::session::SessionState;

pub async fn dispatch(
    opcode_byte: u8,
    controller: &mut OwnedReadHalf,
    state: &std::sync::Arc<SessionState>,
) -> Result<(), SessionError> {
    let Some(opcode) = Opcode::from_byte(opcode_byte) else {
        tracing::warn!(opcode_byte, "unknown opcode from controller");
        state.send_frame(status_frame(Status::UnknownMessage, opcode_byte, &[]));
        return Ok(());
    };

    match opcode {
        Opcode::Status => handle_status(controller, state).await,
        Opcode::TcpInitiateForwardRule => handle_open_rule(controller, state, true).await,
        Opcode::UdpInitiateForwardRule => handle_open_rule(controller, state, false).await,
        Opcode::TcpCloseForwardRule => handle_close_rule(controller, state, true).await,
        Opcode::UdpCloseForwardRule => handle_close_rule(controller, state, false).await,
        Opcode::TcpInitiateConnection => {
            // Server-originated only; receiving it from the controller is
            // a protocol violation, handled like any other unknown frame.
            tracing::warn!("controller sent a server-only TCP_INITIATE_CONNECTION");
            state.send_frame(status_frame(Status::UnknownMessage, opcode.as_byte(), &[]));
            Ok(())
        }
        Opcode::TcpCloseConnection => handle_tcp_close_connection(controller, state).await,
        Opcode::TcpMessage => handle_tcp_message(controller, state).await,
        Opcode::UdpMessage => handle_udp_message(controller, state).await,
        Opcode::Nop => Ok(()),
    }
}

async fn read_u16(controller: &mut OwnedReadHalf) -> Result<u16, SessionError> {
    let mut bytes = [0u8; 2];
    controller.read_exact(&mut bytes).await?;
    Ok(u16::from_be_bytes(bytes))
}

async fn read_u32(controller: &mut OwnedReadHalf) -> Result<u32, SessionError> {
    let mut bytes = [0u8; 4];
    controller.read_exact(&mut bytes).await?;
    Ok(u32::from_be_bytes(bytes))
}

/// Reads one wire-encoded address (tag byte plus its 4 or 16 address
/// octets) and decodes it through the same [`EncodedAddress::decode`]
/// used everywhere else a frame carries this field. Returns `None` for
/// an address tag outside {4, 6}: not live on the wire from this
/// server's own emissions, but the controller could in principle send
/// garbage here, and the caller decides whether that's a silent drop or
/// just discarded context.
async fn read_encoded_address(controller: &mut OwnedReadHalf) -> Result<Option<EncodedAddress>, SessionError> {
    let mut tag = [0u8; 1];
    controller.read_exact(&mut tag).await?;

    let body_len = match tag[0] {
        4 => 4,
        6 => 16,
        _ => return Ok(None),
    };

    let mut buf = vec![0u8; 1 + body_len];
    buf[0] = tag[0];
    controller.read_exact(&mut buf[1..]).await?;

    Ok(EncodedAddress::decode(&buf).ok().map(|(addr, _rest)| addr))
}

async fn handle_status(
    controller: &mut OwnedReadHalf,
    state: &std::sync::Arc<SessionState>,
) -> Result<(), SessionError> {
    let mut status_and_echo = [0u8; 2];
    controller.read_exact(&mut status_and_echo).await?;
    let status = Status::from_byte(status_and_echo[0]);
    let echoed_opcode = status_and_echo[1];

    if echoed_opcode == Opcode::TcpInitiateConnection.as_byte() {
        // Consume the echoed event body: EncodedAddress, srcPort, listenPort, clientId.
        read_encoded_address(controller).await?;
        let mut rest = [0u8; 8]; // srcPort(2) + listenPort(2) + clientId(4)
        controller.read_exact(&mut rest).await?;
        let client_id = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);

        if status == Some(Status::Success) {
            if let Some(connection) = state.tcp_connections.lock().get(&client_id) {
                connection.initialized.store(true, Ordering::SeqCst);
                connection.initialized_notify.notify_one();
            }
        }
    }

    Ok(())
}

async fn handle_open_rule(
    controller: &mut OwnedReadHalf,
    state: &std::sync::Arc<SessionState>,
    is_tcp: bool,
) -> Result<(), SessionError> {
    let port = read_u16(controller).await?;
    let opcode = if is_tcp {
        Opcode::TcpInitiateForwardRule
    } else {
        Opcode::UdpInitiateForwardRule
    };

    let opened = if is_tcp {
        registry::open_tcp(port, state)
    } else {
        registry::open_udp(port, state)
    };

    let context = port.to_be_bytes();
    let frame = if opened {
        status_frame(Status::Success, opcode.as_byte(), &context)
    } else {
        status_frame(Status::GeneralFailure, opcode.as_byte(), &context)
    };
    state.send_frame(frame);
    Ok(())
}

async fn handle_close_rule(
    controller: &mut OwnedReadHalf,
    state: &std::sync::Arc<SessionState>,
    is_tcp: bool,
) -> Result<(), SessionError> {
    let port = read_u16(controller).await?;
    let opcode = if is_tcp {
        Opcode::TcpCloseForwardRule
    } else {
        Opcode::UdpCloseForwardRule
    };

    if is_tcp {
        registry::close_tcp(port, state);
    } else {
        registry::close_udp(port, state);
    }

    state.send_frame(status_frame(Status::Success, opcode.as_byte(), &port.to_be_bytes()));
    Ok(())
}

async fn handle_tcp_close_connection(
    controller: &mut OwnedReadHalf,
    state: &std::sync::Arc<SessionState>,
) -> Result<(), SessionError> {
    let client_id = read_u32(controller).await?;
    if let Some(connection) = state.tcp_connections.lock().remove(&client_id) {
        connection.close_notify.notify_one();
    }
    Ok(())
}

async fn handle_tcp_message(
    controller: &mut OwnedReadHalf,
    state: &std::sync::Arc<SessionState>,
) -> Result<(), SessionError> {
    let client_id = read_u32(controller).await?;
    let length = read_u16(controller).await? as usize;
    let mut payload = vec![0u8; length];
    controller.read_exact(&mut payload).await?;

    let write_half = state
        .tcp_connections
        .lock()
        .get(&client_id)
        .map(|connection| connection.write_half.clone());

    let Some(write_half) = write_half else {
        return Ok(());
    };

    use tokio::io::AsyncWriteExt;
    let mut guard = write_half.lock().await;
    let write_result = match guard.as_mut() {
        Some(half) => half.write_all(&payload).await,
        None => return Ok(()),
    };
    drop(guard);

    if let Err(error) = write_result {
        tracing::debug!(client_id, %error, "write to external socket failed");
        if let Some(connection) = state.tcp_connections.lock().remove(&client_id) {
            connection.close_notify.notify_one();
        }
        state.send_frame(crate::tcp_pump::close_connection_frame(client_id));
    }

    Ok(())
}

async fn handle_udp_message(
    controller: &mut OwnedReadHalf,
    state: &std::sync::Arc<SessionState>,
) -> Result<(), SessionError> {
    let dest_addr = read_encoded_address(controller).await?;

    let dest_port = read_u16(controller).await?;
    let listen_port = read_u16(controller).await?;
    let length = read_u16(controller).await? as usize;
    let mut payload = vec![0u8; length];
    controller.read_exact(&mut payload).await?;

    let Some(dest_addr) = dest_addr else {
        // Unknown address tag: the source silently skips it (`spec.md` §9).
        tracing::warn!("UDP_MESSAGE with unknown address tag");
        return Ok(());
    };

    let socket = state
        .udp_listeners
        .lock()
        .get(&listen_port)
        .map(|listener| listener.socket.clone());

    if let Some(socket) = socket {
        let _ = socket.send_to(&payload, (dest_addr.0, dest_port)).await;
    }

    Ok(())
}
