//! Address resolution for whichever endpoint (upstream relay or ACL-bypass target) was
//! selected for a Session. The spec calls for a synchronous `getaddrinfo`-style lookup;
//! the idiomatic async translation is a single awaited resolver call per Session rather
//! than a background worker pool — there is exactly one suspension point, same as the
//! original's one blocking call.

use std::io;
use std::net::SocketAddr;

use tokio::net::lookup_host;

use super::socks5::Address;

/// Resolves a [`Address`] to a single [`SocketAddr`]. Already-literal addresses are
/// returned immediately; domain names go through the host resolver and the first
/// result is used.
pub async fn resolve(addr: &Address) -> io::Result<SocketAddr> {
    match addr {
        Address::SocketAddress(addr) => Ok(*addr),
        Address::DomainNameAddress(host, port) => {
            let mut addrs = lookup_host((host.as_str(), *port)).await?;
            addrs
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("failed to resolve {host}")))
        }
    }
}

/// Resolves a bare `host:port` pair, used for upstream relays configured by domain name.
pub async fn resolve_host_port(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = lookup_host((host, port)).await?;
    addrs.next().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("failed to resolve {host}")))
}
