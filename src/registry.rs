//! Opens and closes TCP/UDP forward rules on behalf of the controller
//! (`spec.md` §4.4). A `listenPort` lives in at most one of
//! `tcp_listeners`/`udp_listeners` at a time; this module is the only
//! place that binds or tears down the underlying sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use crate::session::{SessionState, TcpForwardListener, UdpForwardListener};
use crate::tcp_pump;
use crate::udp_forwarder;

fn bind_reuseaddr_tcp(port: u16) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

fn bind_reuseaddr_udp(port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Binds `0.0.0.0:port` for TCP and, on success, spawns its acceptor.
/// Returns whether the bind succeeded.
pub fn open_tcp(port: u16, state: &Arc<SessionState>) -> bool {
    if state.tcp_listeners.lock().contains_key(&port) || state.udp_listeners.lock().contains_key(&port) {
        return false;
    }

    let std_listener = match bind_reuseaddr_tcp(port) {
        Ok(listener) => listener,
        Err(error) => {
            tracing::warn!(port, %error, "failed to bind TCP forward rule");
            return false;
        }
    };
    std_listener.set_nonblocking(true).ok();
    let listener = match TcpListener::from_std(std_listener) {
        Ok(listener) => listener,
        Err(error) => {
            tracing::warn!(port, %error, "failed to adopt TCP listener into the runtime");
            return false;
        }
    };

    tracing::info!(port, "opened TCP forward rule");
    let acceptor_state = state.clone();
    let acceptor_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let state = acceptor_state.clone();
                    tokio::spawn(tcp_pump::spawn(stream, peer_addr, port, state));
                }
                Err(error) => {
                    tracing::debug!(port, %error, "TCP acceptor ending");
                    break;
                }
            }
        }
    });

    state
        .tcp_listeners
        .lock()
        .insert(port, TcpForwardListener { acceptor_task });
    true
}

/// Binds `0.0.0.0:port` for UDP and, on success, spawns its receiver.
/// Returns whether the bind succeeded.
pub fn open_udp(port: u16, state: &Arc<SessionState>) -> bool {
    if state.tcp_listeners.lock().contains_key(&port) || state.udp_listeners.lock().contains_key(&port) {
        return false;
    }

    let std_socket = match bind_reuseaddr_udp(port) {
        Ok(socket) => socket,
        Err(error) => {
            tracing::warn!(port, %error, "failed to bind UDP forward rule");
            return false;
        }
    };
    std_socket.set_nonblocking(true).ok();
    let socket = match UdpSocket::from_std(std_socket) {
        Ok(socket) => Arc::new(socket),
        Err(error) => {
            tracing::warn!(port, %error, "failed to adopt UDP socket into the runtime");
            return false;
        }
    };

    tracing::info!(port, "opened UDP forward rule");
    let receiver_state = state.clone();
    let receiver_socket = socket.clone();
    let receiver_task = tokio::spawn(udp_forwarder::run(receiver_socket, port, receiver_state));

    state.udp_listeners.lock().insert(
        port,
        UdpForwardListener {
            socket,
            receiver_task,
        },
    );
    true
}

/// Closing an unknown port is a silent no-op (`spec.md` §4.4, §8).
pub fn close_tcp(port: u16, state: &Arc<SessionState>) {
    let listener = state.tcp_listeners.lock().remove(&port);
    if let Some(listener) = listener {
        listener.acceptor_task.abort();
        tracing::info!(port, "closed TCP forward rule");
    }

    let mut connections = state.tcp_connections.lock();
    connections.retain(|_, connection| {
        if connection.listen_port == port {
            connection.close_notify.notify_one();
            false
        } else {
            true
        }
    });
}

pub fn close_udp(port: u16, state: &Arc<SessionState>) {
    if let Some(listener) = state.udp_listeners.lock().remove(&port) {
        listener.receiver_task.abort();
        tracing::info!(port, "closed UDP forward rule");
    }
}
