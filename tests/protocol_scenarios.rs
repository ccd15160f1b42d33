//! End-to-end scenarios driving a real `ControlSession` over loopback
//! sockets, mirroring the wire-level scenarios in the design: open/close
//! a forward rule, multiplex an external TCP connection, reject an
//! unknown opcode, relay a UDP datagram, and reject a bind collision.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Spawns a `ControlSession` against a freshly accepted loopback
/// connection and returns the controller-side socket.
async fn spawn_session() -> TcpStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let controller = TcpStream::connect(addr).await.unwrap();
    let (server_side, peer) = listener.accept().await.unwrap();

    tokio::spawn(async move {
        let _ = tunnel_server::session::run(server_side, peer).await;
    });

    controller
}

/// Reserves an ephemeral port by binding and immediately dropping a
/// listener; used to pick a port number the test can then ask the
/// session to forward.
async fn free_tcp_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
}

async fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
}

async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

fn v4_octets(addr: IpAddr) -> [u8; 4] {
    match addr {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(_) => panic!("expected an IPv4 loopback address"),
    }
}

#[tokio::test]
async fn open_and_close_tcp_forward_rule() {
    let mut controller = spawn_session().await;
    let port = free_tcp_port().await;
    let port_bytes = port.to_be_bytes();

    controller.write_all(&[0x01, port_bytes[0], port_bytes[1]]).await.unwrap();
    let reply = read_n(&mut controller, 5).await;
    assert_eq!(reply, [0x00, 0x00, 0x01, port_bytes[0], port_bytes[1]]);

    controller.write_all(&[0x03, port_bytes[0], port_bytes[1]]).await.unwrap();
    let reply = read_n(&mut controller, 5).await;
    assert_eq!(reply, [0x00, 0x00, 0x03, port_bytes[0], port_bytes[1]]);
}

#[tokio::test]
async fn closing_an_unopened_port_is_a_silent_success() {
    let mut controller = spawn_session().await;
    let port = free_tcp_port().await;
    let port_bytes = port.to_be_bytes();

    controller.write_all(&[0x03, port_bytes[0], port_bytes[1]]).await.unwrap();
    let reply = read_n(&mut controller, 5).await;
    assert_eq!(reply, [0x00, 0x00, 0x03, port_bytes[0], port_bytes[1]]);
}

#[tokio::test]
async fn opening_an_already_bound_port_yields_general_failure() {
    let mut controller = spawn_session().await;
    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = blocker.local_addr().unwrap().port();
    let port_bytes = port.to_be_bytes();

    controller.write_all(&[0x01, port_bytes[0], port_bytes[1]]).await.unwrap();
    let reply = read_n(&mut controller, 5).await;
    assert_eq!(reply, [0x00, 0x01, 0x01, port_bytes[0], port_bytes[1]]);

    drop(blocker);
}

#[tokio::test]
async fn unknown_opcode_gets_a_status_reply() {
    let mut controller = spawn_session().await;

    controller.write_all(&[0x77]).await.unwrap();
    let reply = read_n(&mut controller, 3).await;
    assert_eq!(reply, [0x00, 0x02, 0x77]);
}

#[tokio::test]
async fn nop_produces_no_reply() {
    let mut controller = spawn_session().await;
    let port = free_tcp_port().await;
    let port_bytes = port.to_be_bytes();

    controller.write_all(&[0xFF]).await.unwrap();
    controller.write_all(&[0x03, port_bytes[0], port_bytes[1]]).await.unwrap();

    // If NOP had emitted anything, it would land before this reply and
    // throw the byte-for-byte comparison off.
    let reply = read_n(&mut controller, 5).await;
    assert_eq!(reply, [0x00, 0x00, 0x03, port_bytes[0], port_bytes[1]]);
}

#[tokio::test]
async fn external_tcp_connection_is_multiplexed() {
    let mut controller = spawn_session().await;
    let port = free_tcp_port().await;
    let port_bytes = port.to_be_bytes();

    controller.write_all(&[0x01, port_bytes[0], port_bytes[1]]).await.unwrap();
    let _open_reply = read_n(&mut controller, 5).await;

    let mut external = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let external_local = external.local_addr().unwrap();

    let opcode = read_n(&mut controller, 1).await;
    assert_eq!(opcode, [0x05]);
    let addr_tag = read_n(&mut controller, 1).await;
    assert_eq!(addr_tag, [4]);
    let addr_octets = read_n(&mut controller, 4).await;
    assert_eq!(addr_octets, v4_octets(external_local.ip()));
    let src_port_bytes = read_n(&mut controller, 2).await;
    assert_eq!(src_port_bytes, external_local.port().to_be_bytes());
    let listen_port_bytes = read_n(&mut controller, 2).await;
    assert_eq!(listen_port_bytes, port_bytes);
    let client_id_bytes = read_n(&mut controller, 4).await;
    assert_eq!(client_id_bytes, [0, 0, 0, 0]);

    let mut ack = vec![0x00, 0x00, 0x05, 4];
    ack.extend_from_slice(&addr_octets);
    ack.extend_from_slice(&src_port_bytes);
    ack.extend_from_slice(&listen_port_bytes);
    ack.extend_from_slice(&client_id_bytes);
    controller.write_all(&ack).await.unwrap();

    external.write_all(b"hi\n").await.unwrap();

    let opcode = read_n(&mut controller, 1).await;
    assert_eq!(opcode, [0x07]);
    let cid = read_n(&mut controller, 4).await;
    assert_eq!(cid, [0, 0, 0, 0]);
    let len = read_n(&mut controller, 2).await;
    assert_eq!(len, 3u16.to_be_bytes());
    let payload = read_n(&mut controller, 3).await;
    assert_eq!(&payload, b"hi\n");

    let mut reply = vec![0x07, 0, 0, 0, 0];
    reply.extend_from_slice(&2u16.to_be_bytes());
    reply.extend_from_slice(b"OK");
    controller.write_all(&reply).await.unwrap();

    let mut echoed = [0u8; 2];
    external.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"OK");

    drop(external);

    let opcode = read_n(&mut controller, 1).await;
    assert_eq!(opcode, [0x06]);
    let cid = read_n(&mut controller, 4).await;
    assert_eq!(cid, [0, 0, 0, 0]);
}

#[tokio::test]
async fn controller_initiated_close_does_not_echo_a_close_frame() {
    let mut controller = spawn_session().await;
    let port = free_tcp_port().await;
    let port_bytes = port.to_be_bytes();

    controller.write_all(&[0x01, port_bytes[0], port_bytes[1]]).await.unwrap();
    let _ = read_n(&mut controller, 5).await;

    let mut external = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // Drain the initiate-connection frame without decoding its fields;
    // other tests already cover its layout.
    let _ = read_n(&mut controller, 1 + 5 + 2 + 2 + 4).await;

    controller.write_all(&[0x06, 0, 0, 0, 0]).await.unwrap();

    let mut buf = [0u8; 1];
    let n = external.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "external socket should be shut down by the controller-initiated close");

    let result = tokio::time::timeout(Duration::from_millis(200), controller.read(&mut [0u8; 1])).await;
    assert!(result.is_err(), "no frame should follow a controller-initiated close");
}

#[tokio::test]
async fn udp_outbound_is_sent_from_the_listener_socket() {
    let mut controller = spawn_session().await;
    let port = free_udp_port().await;
    let port_bytes = port.to_be_bytes();

    controller.write_all(&[0x02, port_bytes[0], port_bytes[1]]).await.unwrap();
    let reply = read_n(&mut controller, 5).await;
    assert_eq!(reply, [0x00, 0x00, 0x02, port_bytes[0], port_bytes[1]]);

    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();

    let mut frame = vec![0x08, 4];
    frame.extend_from_slice(&v4_octets(target_addr.ip()));
    frame.extend_from_slice(&target_addr.port().to_be_bytes());
    frame.extend_from_slice(&port_bytes);
    frame.extend_from_slice(&2u16.to_be_bytes());
    frame.extend_from_slice(b"hi");
    controller.write_all(&frame).await.unwrap();

    let mut buf = [0u8; 2];
    let (n, from) = target.recv_from(&mut buf).await.unwrap();
    assert_eq!(n, 2);
    assert_eq!(&buf, b"hi");
    assert_eq!(from.port(), port);
}

#[tokio::test]
async fn sequential_external_connections_get_distinct_client_ids() {
    let mut controller = spawn_session().await;
    let port = free_tcp_port().await;
    let port_bytes = port.to_be_bytes();

    controller.write_all(&[0x01, port_bytes[0], port_bytes[1]]).await.unwrap();
    let _ = read_n(&mut controller, 5).await;

    let _first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let first_frame = read_n(&mut controller, 1 + 5 + 2 + 2 + 4).await;
    assert_eq!(&first_frame[first_frame.len() - 4..], [0, 0, 0, 0]);

    let _second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let second_frame = read_n(&mut controller, 1 + 5 + 2 + 2 + 4).await;
    assert_eq!(&second_frame[second_frame.len() - 4..], [0, 0, 0, 1]);
}
