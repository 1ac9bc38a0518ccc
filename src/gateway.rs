//! The uniform gateway front shared by the three protocol flavours.

use std::future::Future;
use std::net::{IpAddr, Ipv6Addr};

use anyhow::{bail, Result};
use tracing::debug;

use crate::{IgdGateway, MapOptions, NatPmpGateway, PcpGateway, PortMapping};

/// Address family a gateway operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn of(addr: IpAddr) -> Family {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

fn is_ipv6_link_local(addr: &Ipv6Addr) -> bool {
    // fe80::/10
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Local addresses eligible for mapping: the gateway's family, not loopback
/// and not link-local.
pub(crate) fn local_addresses(family: Family) -> Vec<IpAddr> {
    let mut addrs = Vec::new();
    for iface in netdev::get_interfaces() {
        if iface.is_loopback() {
            continue;
        }
        match family {
            Family::V4 => {
                for net in &iface.ipv4 {
                    let ip = net.addr();
                    if !ip.is_loopback() && !ip.is_link_local() {
                        addrs.push(IpAddr::V4(ip));
                    }
                }
            }
            Family::V6 => {
                for net in &iface.ipv6 {
                    let ip = net.addr();
                    if !ip.is_loopback() && !is_ipv6_link_local(&ip) {
                        addrs.push(IpAddr::V6(ip));
                    }
                }
            }
        }
    }
    addrs
}

/// Maps `internal_port` on every given host, collecting the successes.
///
/// Per-host failures are logged; only a complete miss is an error.
pub(crate) async fn map_hosts<F, Fut>(
    internal_port: u16,
    hosts: Vec<IpAddr>,
    map_one: F,
) -> Result<Vec<PortMapping>>
where
    F: Fn(IpAddr) -> Fut,
    Fut: Future<Output = Result<PortMapping>>,
{
    let mut mapped = Vec::new();
    for host in hosts {
        match map_one(host).await {
            Ok(mapping) => mapped.push(mapping),
            Err(e) => debug!(%host, "failed to map interface: {e:#}"),
        }
    }
    if mapped.is_empty() {
        bail!("all attempts to map port {internal_port} failed");
    }
    Ok(mapped)
}

/// A NAT gateway reachable with one of the supported protocols.
///
/// Obtained from [`pcp_nat`], [`pmp_nat`] or a [`UpnpNat`] client. Cloning is
/// cheap: clones share the underlying gateway task.
///
/// [`pcp_nat`]: crate::pcp_nat
/// [`pmp_nat`]: crate::pmp_nat
/// [`UpnpNat`]: crate::UpnpNat
#[derive(Debug, Clone)]
pub enum Gateway {
    /// A gateway speaking PCP.
    Pcp(PcpGateway),
    /// A gateway speaking NAT-PMP.
    NatPmp(NatPmpGateway),
    /// A UPnP internet gateway device.
    Upnp(IgdGateway),
}

impl Gateway {
    /// Map `internal_port` of `internal_host` on the gateway.
    ///
    /// The returned mapping carries the externally visible address and port,
    /// which may differ from what was requested. With
    /// [`MapOptions::auto_refresh`] the mapping is re-issued before its lease
    /// runs out, until [`unmap`](Self::unmap) or [`stop`](Self::stop).
    pub async fn map(
        &self,
        internal_port: u16,
        internal_host: IpAddr,
        opts: MapOptions,
    ) -> Result<PortMapping> {
        match self {
            Gateway::Pcp(g) => g.map(internal_port, internal_host, opts).await,
            Gateway::NatPmp(g) => g.map(internal_port, internal_host, opts).await,
            Gateway::Upnp(g) => g.map(internal_port, internal_host, opts).await,
        }
    }

    /// Map `internal_port` on every eligible local interface.
    ///
    /// Link-local and loopback addresses are skipped. Fails only if no
    /// interface could be mapped at all.
    pub async fn map_all(&self, internal_port: u16, opts: MapOptions) -> Result<Vec<PortMapping>> {
        let hosts = local_addresses(self.family());
        map_hosts(internal_port, hosts, |host| {
            let opts = opts.clone();
            async move { self.map(internal_port, host, opts).await }
        })
        .await
    }

    /// Release the mapping of `internal_port` on `internal_host`.
    pub async fn unmap(
        &self,
        internal_port: u16,
        internal_host: IpAddr,
        opts: MapOptions,
    ) -> Result<()> {
        match self {
            Gateway::Pcp(g) => g.unmap(internal_port, internal_host, opts).await,
            Gateway::NatPmp(g) => g.unmap(internal_port, internal_host, opts).await,
            Gateway::Upnp(g) => g.unmap(internal_port, internal_host, opts).await,
        }
    }

    /// The externally visible address of this gateway.
    pub async fn external_ip(&self) -> Result<IpAddr> {
        match self {
            Gateway::Pcp(g) => g.external_ip().await,
            Gateway::NatPmp(g) => g.external_ip().await,
            Gateway::Upnp(g) => g.external_ip().await,
        }
    }

    /// Snapshot of the mappings this gateway is maintaining.
    pub async fn mappings(&self) -> Result<Vec<PortMapping>> {
        match self {
            Gateway::Pcp(g) => g.mappings().await,
            Gateway::NatPmp(g) => g.mappings().await,
            Gateway::Upnp(g) => g.mappings().await,
        }
    }

    /// Stop the gateway, releasing every mapping best-effort.
    ///
    /// Further operations on this gateway fail with "gateway is closed".
    pub async fn stop(&self) -> Result<()> {
        match self {
            Gateway::Pcp(g) => g.stop().await,
            Gateway::NatPmp(g) => g.stop().await,
            Gateway::Upnp(g) => g.stop().await,
        }
    }

    fn family(&self) -> Family {
        match self {
            Gateway::Pcp(g) => g.family(),
            Gateway::NatPmp(_) => Family::V4,
            Gateway::Upnp(g) => g.family(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use anyhow::anyhow;

    use super::*;
    use crate::Protocol;

    fn mapping(host: IpAddr, port: u16) -> PortMapping {
        PortMapping {
            protocol: Protocol::Tcp,
            internal_host: host,
            internal_port: port,
            external_host: "20.0.0.1".parse().unwrap(),
            external_port: port,
        }
    }

    #[tokio::test]
    async fn map_hosts_keeps_partial_successes() {
        let good = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let bad = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        let mapped = map_hosts(4000, vec![bad, good], |host| async move {
            if host == bad {
                Err(anyhow!("interface is down"))
            } else {
                Ok(mapping(host, 4000))
            }
        })
        .await
        .unwrap();

        assert_eq!(mapped, vec![mapping(good, 4000)]);
    }

    #[tokio::test]
    async fn map_hosts_fails_when_nothing_mapped() {
        let host = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let err = map_hosts(4000, vec![host], |_| async {
            Err(anyhow!("interface is down"))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("all attempts to map port 4000"));
    }

    #[test]
    fn link_local_detection() {
        assert!(is_ipv6_link_local(&"fe80::1".parse().unwrap()));
        assert!(!is_ipv6_link_local(&"fd00::1".parse().unwrap()));
        assert!(!is_ipv6_link_local(&"2001:db8::1".parse().unwrap()));
    }
}
