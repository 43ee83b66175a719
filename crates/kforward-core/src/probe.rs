//! Local port availability probing

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use tracing::debug;

/// Check if a TCP port can be bound on the loopback interface
///
/// Any bind failure counts as "occupied". This is a heuristic only: nothing
/// stops another process from binding the port between this check and the
/// forwarding process's own bind.
pub fn is_port_available(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            debug!(port, "Port check: port appears to be available");
            true
        }
        Err(e) => {
            debug!(port, kind = ?e.kind(), "Port check: cannot listen on {}: {}", addr, e);
            false
        }
    }
}
