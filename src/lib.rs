//! Reverse-tunneling port-forwarder server.
//!
//! A single long-lived controller connects to this server and asks it to
//! open TCP/UDP listeners on the server's public interface. Every
//! external connection that arrives on those listeners is multiplexed
//! back to the controller as framed messages on the control channel; see
//! `protocol` for the wire format and `session` for the per-controller
//! state machine.

pub mod cli;
pub mod client_id;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod tcp_pump;
pub mod udp_forwarder;

use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;

use cli::Args;

/// Parses arguments, sets up logging, and runs the controller-accepting
/// loop until `SIGINT`. Returns the process exit code.
pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let Some(port) = args.port else {
        eprintln!("Missing port number!");
        std::process::exit(1);
    };

    logging::init(args.verbose);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(port))
}

async fn serve(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening for the controller connection");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::info!(%peer, "controller connected");
                tokio::spawn(async move {
                    if let Err(error) = session::run(stream, peer).await {
                        tracing::error!(%error, "control session ended with an error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                return Ok(());
            }
        }
    }
}
