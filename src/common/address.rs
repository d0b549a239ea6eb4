//! Address and destination types for dispatched connections

use std::net::{IpAddr, SocketAddr};

/// Where a dispatched connection is headed: a resolved socket address,
/// or a domain that stays symbolic until the outbound resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Symbolic address from a host name and port.
    pub fn domain(host: impl Into<String>, port: u16) -> Self {
        Address::Domain(host.into(), port)
    }

    /// Interpret `host` as an IP literal when it parses as one, as a
    /// domain otherwise. Sniffed hosts arrive through here.
    pub fn parse_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match *self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => port,
        }
    }

    /// Whether dispatch may accept this address. A zero port or an
    /// empty host is a programmer error on the inbound side.
    pub fn is_valid(&self) -> bool {
        match self {
            Address::Socket(addr) => addr.port() != 0,
            Address::Domain(host, port) => *port != 0 && !host.is_empty(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => addr.fmt(f),
            Address::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Network type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Destination of a dispatched connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address: Address,
    pub network: Network,
}

impl Destination {
    pub fn tcp(address: Address) -> Self {
        Self {
            address,
            network: Network::Tcp,
        }
    }

    pub fn udp(address: Address) -> Self {
        Self {
            address,
            network: Network::Udp,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.address.is_valid()
    }

    /// Replace the host with a sniffed domain, keeping the port.
    pub fn override_host(&mut self, host: &str) {
        let port = self.address.port();
        self.address = Address::parse_host(host, port);
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_distinguishes_ip_and_domain() {
        assert!(matches!(
            Address::parse_host("1.2.3.4", 443),
            Address::Socket(_)
        ));
        assert!(matches!(
            Address::parse_host("www.example", 443),
            Address::Domain(_, 443)
        ));
    }

    #[test]
    fn validity() {
        assert!(Address::domain("example.com", 80).is_valid());
        assert!(!Address::domain("", 80).is_valid());
        assert!(!Address::domain("example.com", 0).is_valid());
    }

    #[test]
    fn display_keeps_the_host_port_form() {
        assert_eq!(Address::domain("example.com", 80).to_string(), "example.com:80");
        assert_eq!(Address::parse_host("1.2.3.4", 53).to_string(), "1.2.3.4:53");
    }

    #[test]
    fn override_host_keeps_port() {
        let mut dest = Destination::tcp(Address::parse_host("1.2.3.4", 443));
        dest.override_host("www.example");
        assert_eq!(dest.address, Address::domain("www.example", 443));
    }
}
