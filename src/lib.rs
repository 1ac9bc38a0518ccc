//! Port mapping for hosts behind a NAT gateway.
//!
//! Opens externally reachable ports on the local gateway by speaking one of
//! three protocols:
//!
//! * **PCP** ([RFC 6887]): binary requests over UDP, supersedes NAT-PMP.
//! * **NAT-PMP** ([RFC 6886]): binary requests over UDP, IPv4 only.
//! * **UPnP IGD** v1/v2: SOAP actions over HTTP against a device descriptor
//!   discovered via SSDP. Supports IPv4 port mappings and IPv6 firewall
//!   pinholes.
//!
//! All three flavours share the same runtime: a per-gateway task owns the
//! transport, serializes requests, keeps a table of live mappings and
//! re-issues them before their lease runs out. The [`Gateway`] front hides
//! which protocol is in use.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! let gateway = portmapper::pcp_nat("192.168.1.1".parse()?).await?;
//! let mapping = gateway
//!     .map(4001, "192.168.1.10".parse()?, Default::default())
//!     .await?;
//! println!("reachable at {}:{}", mapping.external_host, mapping.external_port);
//! # Ok(())
//! # }
//! ```
//!
//! [RFC 6887]: https://datatracker.ietf.org/doc/html/rfc6887
//! [RFC 6886]: https://datatracker.ietf.org/doc/html/rfc6886

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

use anyhow::Result;

mod discovery;
mod gateway;
mod mapping;
mod nat_pmp;
mod options;
mod pcp;
mod queue;
mod upnp;
mod util;

pub use discovery::{DiscoveredService, ServiceDiscovery, UpnpNat};
pub use gateway::Gateway;
pub use nat_pmp::NatPmpGateway;
pub use options::MapOptions;
pub use pcp::PcpGateway;
pub use upnp::{device::DeviceDescriptor, IgdGateway, UpnpError};

/// Transport protocol of a mapping.
///
/// Parsing is case-insensitive; the canonical rendering is upper-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Transmission Control Protocol.
    Tcp,
    /// User Datagram Protocol.
    Udp,
}

impl Protocol {
    /// The IANA protocol number, as it appears in PCP MAP requests and IGDv2
    /// pinholes.
    pub(crate) const fn number(&self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Error returned when parsing a [`Protocol`] from a string fails.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol {0:?}, expected TCP or UDP")]
pub struct UnknownProtocol(String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Protocol::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Protocol::Udp)
        } else {
            Err(UnknownProtocol(s.to_string()))
        }
    }
}

/// An established port mapping.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{protocol} {internal_host}:{internal_port} -> {external_host}:{external_port}")]
pub struct PortMapping {
    /// Mapped transport protocol.
    pub protocol: Protocol,
    /// Local address traffic is forwarded to.
    pub internal_host: IpAddr,
    /// Local port traffic is forwarded to.
    pub internal_port: u16,
    /// Externally visible address of the mapping.
    pub external_host: IpAddr,
    /// Externally visible port of the mapping.
    pub external_port: u16,
}

/// Create a [`Gateway`] that speaks PCP to the given address.
///
/// The gateway is probed with an ANNOUNCE request before it is returned, so
/// a successful return means a PCP server is answering.
pub async fn pcp_nat(gateway: IpAddr) -> Result<Gateway> {
    let gateway = PcpGateway::spawn(gateway).await?;
    gateway.is_pcp_supported().await?;
    Ok(Gateway::Pcp(gateway))
}

/// Create a [`Gateway`] that speaks NAT-PMP to the given address.
///
/// NAT-PMP is IPv4 only.
pub async fn pmp_nat(gateway: Ipv4Addr) -> Result<Gateway> {
    Ok(Gateway::NatPmp(NatPmpGateway::spawn(gateway).await?))
}

/// Create a UPnP client that turns discovered devices into [`Gateway`]s.
///
/// SSDP search is a collaborator: anything implementing [`ServiceDiscovery`]
/// can feed devices to the returned client.
pub fn upnp_nat(discovery: impl ServiceDiscovery) -> UpnpNat {
    UpnpNat::new(discovery)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parses_any_case() {
        assert_eq!("tcp".parse(), Ok(Protocol::Tcp));
        assert_eq!("TCP".parse(), Ok(Protocol::Tcp));
        assert_eq!("Udp".parse(), Ok(Protocol::Udp));
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn protocol_renders_upper_case() {
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert_eq!(Protocol::Udp.to_string(), "UDP");
    }
}
