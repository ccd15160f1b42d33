//! Per-listening-UDP-socket receiver (`spec.md` §4.6): frames every
//! inbound datagram onto the control stream. Outbound sends (controller
//! to external peer) are issued directly by the dispatcher against the
//! listener socket recorded in the registry.

use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::protocol::{EncodedAddress, Opcode};
use crate::session::SessionState;

const MAX_DATAGRAM: usize = 65535;

pub async fn run(socket: Arc<UdpSocket>, listen_port: u16, state: Arc<SessionState>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(error) => {
                tracing::debug!(listen_port, %error, "UDP receiver ending");
                break;
            }
        };

        let frame = udp_message_frame(source.ip(), source.port(), listen_port, &buf[..len]);
        state.send_frame(frame);
    }
}

fn udp_message_frame(
    source_ip: std::net::IpAddr,
    source_port: u16,
    listen_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + 17 + 2 + 2 + 2 + payload.len());
    frame.push(Opcode::UdpMessage.as_byte());
    EncodedAddress(source_ip).write_to(&mut frame);
    frame.extend_from_slice(&source_port.to_be_bytes());
    frame.extend_from_slice(&listen_port.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
