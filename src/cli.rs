//! The command line for the tunnel server: just the controller listen
//! port (`spec.md` §6 "Process interface").

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tunnel-server", about = "Reverse-tunnel port-forwarder server")]
pub struct Args {
    /// TCP port to listen on for the controller connection, bound to 127.0.0.1.
    ///
    /// Optional at the clap layer so a missing argument exits with code 1
    /// (matching the original tool) rather than clap's own usage-error
    /// exit code.
    pub port: Option<u16>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
