//! Options accepted by the gateway operations.

use std::{net::IpAddr, time::Duration};

use crate::Protocol;

/// Lease requested from the gateway when no `ttl` is given.
pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Budget for a single mapping or refresh request.
pub(crate) const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long before expiry a mapping is re-issued.
pub(crate) const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(60);

/// Description attached to mappings on protocols that carry one.
pub(crate) const DEFAULT_DESCRIPTION: &str = "portmapper";

/// Options for [`Gateway::map`] and the other gateway operations.
///
/// The defaults request a one hour lease that is automatically refreshed
/// until [`Gateway::unmap`] or [`Gateway::stop`] is called.
///
/// [`Gateway::map`]: crate::Gateway::map
/// [`Gateway::unmap`]: crate::Gateway::unmap
/// [`Gateway::stop`]: crate::Gateway::stop
#[derive(Debug, Clone)]
pub struct MapOptions {
    /// Requested lease duration.
    ///
    /// Converted to whole seconds on the wire. PCP raises this to at least
    /// two minutes, IGDv2 IPv6 pinholes to at least an hour.
    pub ttl: Duration,
    /// Description attached to the mapping (UPnP only).
    pub description: String,
    /// Re-issue the mapping before the lease runs out.
    pub auto_refresh: bool,
    /// Budget for a single refresh request.
    pub refresh_timeout: Duration,
    /// How long before expiry a refresh is due.
    pub refresh_threshold: Duration,
    /// Preferred external port. The gateway may assign a different one.
    pub external_port: Option<u16>,
    /// Restrict the mapping to traffic from this remote host. Unset means
    /// any source.
    pub remote_host: Option<IpAddr>,
    /// Transport protocol to map.
    pub protocol: Protocol,
    /// Budget for the initial request, when the protocol default does not
    /// fit.
    pub timeout: Option<Duration>,
}

impl Default for MapOptions {
    fn default() -> Self {
        MapOptions {
            ttl: DEFAULT_TTL,
            description: DEFAULT_DESCRIPTION.to_string(),
            auto_refresh: true,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            external_port: None,
            remote_host: None,
            protocol: Protocol::Tcp,
            timeout: None,
        }
    }
}

impl MapOptions {
    /// The lease to put on the wire, in seconds, raised to `floor`.
    pub(crate) fn lifetime_seconds(&self, floor: u32) -> u32 {
        u32::try_from(self.ttl.as_secs())
            .unwrap_or(u32::MAX)
            .max(floor)
    }

    /// Budget for the initial request.
    pub(crate) fn request_timeout(&self) -> Duration {
        self.timeout.unwrap_or(self.refresh_timeout)
    }
}
