//! Interface registry: enumerates attached IPv4 interfaces and keeps one
//! broadcast-capable UDP socket per interface.
//!
//! Grounded in the `statime` PTP implementation's `network/linux.rs`, which
//! walks `nix::ifaddrs::getifaddrs` to build its own per-interface socket
//! set; the broadcast/netmask bit arithmetic here follows the same approach.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use nix::ifaddrs::getifaddrs;
use nix::sys::socket::SockaddrIn;

const MAX_INTERFACES: usize = 16;

pub struct InterfaceEntry {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    socket: UdpSocket,
}

impl InterfaceEntry {
    fn subnet_contains(&self, peer: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.address) & mask == u32::from(peer) & mask
    }
}

#[derive(Default)]
pub struct InterfaceRegistry {
    entries: Vec<InterfaceEntry>,
}

fn sockaddr_to_ipv4(addr: &nix::sys::socket::SockaddrStorage) -> Option<Ipv4Addr> {
    let inet: SockaddrIn = (*addr.as_sockaddr_in()?).into();
    Some(Ipv4Addr::from(inet.ip()))
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        InterfaceRegistry { entries: Vec::new() }
    }

    /// Tears down existing sockets then walks OS-reported interfaces,
    /// recording one entry per non-loopback IPv4 address (capped at
    /// `MAX_INTERFACES`; surplus entries are ignored).
    pub fn enumerate(&mut self) -> anyhow::Result<()> {
        self.entries.clear();

        let addrs = getifaddrs()?;
        for ifaddr in addrs {
            if self.entries.len() >= MAX_INTERFACES {
                break;
            }
            let Some(address) = ifaddr.address.as_ref().and_then(sockaddr_to_ipv4) else {
                continue;
            };
            if address.is_loopback() {
                continue;
            }
            let Some(netmask) = ifaddr.netmask.as_ref().and_then(sockaddr_to_ipv4) else {
                continue;
            };
            let broadcast = Ipv4Addr::from(u32::from(address) | !u32::from(netmask));

            let socket = match UdpSocket::bind(SocketAddrV4::new(address, 0)) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(interface = %ifaddr.interface_name, error = %e, "cannot bind interface socket, skipping");
                    continue;
                }
            };
            if let Err(e) = socket.set_broadcast(true) {
                tracing::warn!(interface = %ifaddr.interface_name, error = %e, "cannot enable SO_BROADCAST, skipping");
                continue;
            }
            if let Err(e) = socket.set_nonblocking(true) {
                tracing::warn!(interface = %ifaddr.interface_name, error = %e, "cannot set nonblocking, skipping");
                continue;
            }

            self.entries.push(InterfaceEntry {
                name: ifaddr.interface_name,
                address,
                netmask,
                broadcast,
                socket,
            });
        }
        Ok(())
    }

    pub fn entries(&self) -> &[InterfaceEntry] {
        &self.entries
    }

    /// Sends one datagram per live interface to `(entry.broadcast, port)`.
    /// `build_payload` receives each entry's unicast address so the caller
    /// can stamp a per-interface refid into the outgoing packet. Per-interface
    /// send failures are logged and skipped, never fatal.
    pub fn broadcast(&self, port: u16, mut build_payload: impl FnMut(Ipv4Addr) -> Vec<u8>) {
        for entry in &self.entries {
            let payload = build_payload(entry.address);
            let dest = SocketAddrV4::new(entry.broadcast, port);
            if let Err(e) = entry.socket.send_to(&payload, dest) {
                tracing::warn!(interface = %entry.name, dest = %dest, error = %e, "broadcast send failed");
            }
        }
    }

    /// Returns the unicast address of the interface whose subnet contains
    /// `peer`, or `None` when no registered interface matches.
    pub fn local_match(&self, peer: Ipv4Addr) -> Option<Ipv4Addr> {
        self.entries
            .iter()
            .find(|e| e.subnet_contains(peer))
            .map(|e| e.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: [u8; 4], mask: [u8; 4], sock_port: u16) -> InterfaceEntry {
        InterfaceEntry {
            name: "test0".to_string(),
            address: Ipv4Addr::from(addr),
            netmask: Ipv4Addr::from(mask),
            broadcast: Ipv4Addr::from(
                u32::from(Ipv4Addr::from(addr)) | !u32::from(Ipv4Addr::from(mask)),
            ),
            socket: UdpSocket::bind(("127.0.0.1", sock_port)).unwrap(),
        }
    }

    #[test]
    fn broadcast_address_is_address_or_not_mask() {
        let e = entry([192, 168, 1, 10], [255, 255, 255, 0], 0);
        assert_eq!(e.broadcast, Ipv4Addr::new(192, 168, 1, 255));

        let e2 = entry([10, 0, 0, 5], [255, 0, 0, 0], 0);
        assert_eq!(e2.broadcast, Ipv4Addr::new(10, 255, 255, 255));
    }

    #[test]
    fn local_match_finds_containing_subnet_or_none() {
        let mut reg = InterfaceRegistry::new();
        reg.entries.push(entry([192, 168, 1, 10], [255, 255, 255, 0], 0));
        reg.entries.push(entry([10, 0, 0, 5], [255, 0, 0, 0], 0));

        assert_eq!(
            reg.local_match(Ipv4Addr::new(192, 168, 1, 200)),
            Some(Ipv4Addr::new(192, 168, 1, 10))
        );
        assert_eq!(
            reg.local_match(Ipv4Addr::new(10, 9, 9, 9)),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
        assert_eq!(reg.local_match(Ipv4Addr::new(172, 16, 0, 1)), None);
    }
}
