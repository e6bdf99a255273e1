//! Checks that a proxy listener is bound before traffic is diverted to it.
//!
//! The classifier never starts the proxy; it only finds it in the kernel socket
//! table. This inspects the same table through `/proc/net` so that a missing
//! listener is reported when the classifier is attached.

use std::net::SocketAddr;

use log::{info, warn};
use procfs::net::TcpState;

/// Whether a TCP and a UDP socket are bound on the wildcard address of the proxy port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStatus {
    pub tcp: bool,
    pub udp: bool,
}

impl ListenerStatus {
    /// Reads the IPv4 and IPv6 socket tables. Dual-stack `[::]` sockets also accept
    /// IPv4 traffic.
    pub fn probe(port: u16) -> Result<Self, anyhow::Error> {
        let tcp = procfs::net::tcp()?
            .into_iter()
            .chain(procfs::net::tcp6().unwrap_or_default())
            .any(|entry| entry.state == TcpState::Listen && is_proxy_addr(&entry.local_address, port));

        let udp = procfs::net::udp()?
            .into_iter()
            .chain(procfs::net::udp6().unwrap_or_default())
            .any(|entry| is_proxy_addr(&entry.local_address, port));

        Ok(Self { tcp, udp })
    }

    pub fn is_ready(&self) -> bool {
        self.tcp && self.udp
    }
}

/// A socket bound to `0.0.0.0:port` or `[::]:port`.
pub fn is_proxy_addr(addr: &SocketAddr, port: u16) -> bool {
    addr.port() == port && addr.ip().is_unspecified()
}

/// Logs whether the proxy listener is ready. Never fails: the classifier degrades to a
/// pass-through when no socket is found.
pub fn check(port: u16) -> ListenerStatus {
    let status = match ListenerStatus::probe(port) {
        Ok(status) => status,
        Err(e) => {
            warn!("failed to inspect the socket table: {}", e);
            return ListenerStatus::default();
        }
    };

    if status.is_ready() {
        info!("proxy listener found on port {}", port);
    } else {
        if !status.tcp {
            warn!("no TCP listener on 0.0.0.0:{}, TCP traffic will not be redirected", port);
        }
        if !status.udp {
            warn!("no UDP socket on 0.0.0.0:{}, UDP traffic will not be redirected", port);
        }
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_addresses() {
        assert!(is_proxy_addr(&"0.0.0.0:9420".parse().unwrap(), 9420));
        assert!(is_proxy_addr(&"[::]:9420".parse().unwrap(), 9420));
        assert!(!is_proxy_addr(&"127.0.0.1:9420".parse().unwrap(), 9420));
        assert!(!is_proxy_addr(&"0.0.0.0:9421".parse().unwrap(), 9420));
    }

    #[test]
    fn readiness() {
        assert!(ListenerStatus { tcp: true, udp: true }.is_ready());
        assert!(!ListenerStatus { tcp: true, udp: false }.is_ready());
        assert!(!ListenerStatus::default().is_ready());
    }
}
