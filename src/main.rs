use tunnel_server::error::PrettyError;

fn main() {
    PrettyError::report(tunnel_server::run());
}
