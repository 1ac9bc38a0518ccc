//! The table of mappings a gateway maintains.

use std::net::IpAddr;

use rand::RngCore;

use crate::Protocol;

/// One mapping row per internal endpoint.
///
/// A row is created when a mapping request is first sent; the external
/// fields are filled in only by a granted response.
#[derive(Debug, Clone)]
pub(crate) struct Mapping {
    pub protocol: Protocol,
    pub internal_host: IpAddr,
    pub internal_port: u16,
    pub external_host: Option<IpAddr>,
    pub external_port: Option<u16>,
    /// Ties the row to its server-side state. Stable for the lifetime of the
    /// row: PCP requires the same nonce to retarget a mapping on refresh.
    pub nonce: [u8; 12],
    pub auto_refresh: bool,
    /// Wall-clock expiry in unix milliseconds, as granted by the gateway.
    pub expires_at: Option<u64>,
    /// Granted lifetime in seconds.
    pub lifetime: Option<u32>,
}

impl Mapping {
    fn matches(&self, host: IpAddr, port: u16, protocol: Protocol) -> bool {
        self.internal_host == host && self.internal_port == port && self.protocol == protocol
    }
}

/// In-memory set of mappings, keyed by (host, port, protocol) and indexed by
/// nonce.
///
/// The table stays small (one row per mapped endpoint), linear scans are
/// fine.
#[derive(Debug, Default)]
pub(crate) struct MappingTable {
    entries: Vec<Mapping>,
}

impl MappingTable {
    pub(crate) fn get(&self, host: IpAddr, port: u16, protocol: Protocol) -> Option<&Mapping> {
        self.entries.iter().find(|m| m.matches(host, port, protocol))
    }

    pub(crate) fn get_mut(
        &mut self,
        host: IpAddr,
        port: u16,
        protocol: Protocol,
    ) -> Option<&mut Mapping> {
        self.entries
            .iter_mut()
            .find(|m| m.matches(host, port, protocol))
    }

    pub(crate) fn get_by_nonce(&self, nonce: &[u8; 12]) -> Option<&Mapping> {
        self.entries.iter().find(|m| &m.nonce == nonce)
    }

    /// Returns the row for the endpoint, creating one with a fresh random
    /// nonce if none exists yet.
    pub(crate) fn get_or_create(
        &mut self,
        host: IpAddr,
        port: u16,
        protocol: Protocol,
        auto_refresh: bool,
    ) -> &mut Mapping {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|m| m.matches(host, port, protocol))
        {
            return &mut self.entries[idx];
        }
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.entries.push(Mapping {
            protocol,
            internal_host: host,
            internal_port: port,
            external_host: None,
            external_port: None,
            nonce,
            auto_refresh,
            expires_at: None,
            lifetime: None,
        });
        self.entries.last_mut().expect("row was just pushed")
    }

    /// Writes the external fields on every row matching the
    /// (internal port, protocol, nonce) triple.
    ///
    /// Responses are keyed by nonce; the triple check guards against a reply
    /// landing on the wrong row. Returns whether any row matched.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn update(
        &mut self,
        internal_port: u16,
        protocol: Protocol,
        nonce: &[u8; 12],
        external_host: IpAddr,
        external_port: u16,
        expires_at: u64,
        lifetime: u32,
    ) -> bool {
        let mut updated = false;
        for m in self.entries.iter_mut().filter(|m| {
            m.internal_port == internal_port && m.protocol == protocol && &m.nonce == nonce
        }) {
            m.external_host = Some(external_host);
            m.external_port = Some(external_port);
            m.expires_at = Some(expires_at);
            m.lifetime = Some(lifetime);
            updated = true;
        }
        updated
    }

    pub(crate) fn delete(
        &mut self,
        host: IpAddr,
        port: u16,
        protocol: Protocol,
    ) -> Option<Mapping> {
        let idx = self
            .entries
            .iter()
            .position(|m| m.matches(host, port, protocol))?;
        Some(self.entries.remove(idx))
    }

    pub(crate) fn delete_all(&mut self) -> Vec<Mapping> {
        std::mem::take(&mut self.entries)
    }

    /// Rows due for a refresh: auto-refreshed, granted, and with less than
    /// half of their lifetime remaining (RFC 6887 section 11.2.1).
    pub(crate) fn expiring(&self, now_ms: u64) -> impl Iterator<Item = &Mapping> {
        self.entries.iter().filter(move |m| {
            let (Some(expires_at), Some(lifetime)) = (m.expires_at, m.lifetime) else {
                return false;
            };
            m.auto_refresh && expires_at.saturating_sub(now_ms) / 1000 < u64::from(lifetime) / 2
        })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1));

    #[test]
    fn get_or_create_deduplicates() {
        let mut table = MappingTable::default();
        let nonce = table.get_or_create(HOST, 5000, Protocol::Tcp, true).nonce;
        let row = table.get_or_create(HOST, 5000, Protocol::Tcp, true);
        assert_eq!(row.nonce, nonce);
        assert_eq!(table.entries.len(), 1);
    }

    #[test]
    fn nonces_are_distinct_and_stable() {
        let mut table = MappingTable::default();
        let a = table.get_or_create(HOST, 5000, Protocol::Tcp, true).nonce;
        let b = table.get_or_create(HOST, 5001, Protocol::Tcp, true).nonce;
        assert_ne!(a, b);

        // a granted response does not touch the nonce
        assert!(table.update(5000, Protocol::Tcp, &a, "1.2.3.4".parse().unwrap(), 5000, 1, 1));
        assert_eq!(table.get(HOST, 5000, Protocol::Tcp).unwrap().nonce, a);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut table = MappingTable::default();
        table.get_or_create(HOST, 5000, "TCP".parse().unwrap(), true);
        assert!(table.get(HOST, 5000, "tcp".parse().unwrap()).is_some());
        assert!(table.get(HOST, 5000, "Tcp".parse().unwrap()).is_some());
        assert!(table.get(HOST, 5000, "udp".parse().unwrap()).is_none());
    }

    #[test]
    fn update_requires_a_matching_nonce() {
        let mut table = MappingTable::default();
        let nonce = table.get_or_create(HOST, 5000, Protocol::Tcp, true).nonce;

        let wrong = [0xab; 12];
        assert!(!table.update(5000, Protocol::Tcp, &wrong, "1.2.3.4".parse().unwrap(), 6000, 1, 1));
        let row = table.get(HOST, 5000, Protocol::Tcp).unwrap();
        assert_eq!(row.external_host, None);

        let expires_at = 1_700_000_000_000;
        assert!(table.update(
            5000,
            "tcp".parse().unwrap(),
            &nonce,
            "1.2.3.4".parse().unwrap(),
            6000,
            expires_at,
            1234,
        ));
        let row = table.get(HOST, 5000, Protocol::Tcp).unwrap();
        assert_eq!(row.external_host, Some("1.2.3.4".parse().unwrap()));
        assert_eq!(row.external_port, Some(6000));
        assert_eq!(row.expires_at, Some(expires_at));
        assert_eq!(row.lifetime, Some(1234));
    }

    #[test]
    fn expiring_applies_the_half_lifetime_rule() {
        let now = 1_700_000_000_000u64;
        let mut table = MappingTable::default();
        {
            let row = table.get_or_create(HOST, 5000, Protocol::Tcp, true);
            row.lifetime = Some(100);
            row.expires_at = Some(now + 30_000);
        }
        assert_eq!(table.expiring(now).count(), 1);

        table.get_mut(HOST, 5000, Protocol::Tcp).unwrap().expires_at = Some(now + 80_000);
        assert_eq!(table.expiring(now).count(), 0);
    }

    #[test]
    fn expiring_skips_rows_without_refresh_or_grant() {
        let now = 1_700_000_000_000u64;
        let mut table = MappingTable::default();
        // never granted
        table.get_or_create(HOST, 5000, Protocol::Tcp, true);
        // granted but not auto-refreshed
        {
            let row = table.get_or_create(HOST, 5001, Protocol::Tcp, false);
            row.lifetime = Some(100);
            row.expires_at = Some(now);
        }
        assert_eq!(table.expiring(now).count(), 0);
    }

    #[test]
    fn delete_removes_only_the_exact_row() {
        let mut table = MappingTable::default();
        table.get_or_create(HOST, 5000, Protocol::Tcp, true);
        table.get_or_create(HOST, 5000, Protocol::Udp, true);
        assert!(table.delete(HOST, 5000, Protocol::Tcp).is_some());
        assert!(table.get(HOST, 5000, Protocol::Tcp).is_none());
        assert!(table.get(HOST, 5000, Protocol::Udp).is_some());
        assert!(table.delete(HOST, 5000, Protocol::Tcp).is_none());
    }
}
