//! Turning discovered UPnP devices into gateways.
//!
//! SSDP multicast search itself is a collaborator: anything that can produce
//! [`DiscoveredService`]s works, this module only consumes the stream.

use std::{
    collections::HashSet,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use futures_lite::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};
use url::Url;

use crate::{gateway::Gateway, upnp::device::DeviceDescriptor, IgdGateway};

/// Root device type of gateways this crate can drive.
const IGD_DEVICE_SUFFIX: &str = ":InternetGatewayDevice:2";

/// Validity assumed for a descriptor fetched directly, without an SSDP
/// advertisement carrying its own lease.
const DIRECT_DESCRIPTOR_TTL: Duration = Duration::from_secs(30 * 60);

/// Capacity of the gateway stream returned by [`UpnpNat::find_gateways`].
const GATEWAY_CHANNEL_CAPACITY: usize = 16;

/// A device advertisement, as produced by the SSDP collaborator.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    /// Where the device descriptor lives.
    pub location: Url,
    /// The parsed descriptor document.
    pub descriptor: DeviceDescriptor,
    /// Service type the advertisement was for.
    pub service_type: String,
    /// Unique service name, stable across re-advertisements of the same
    /// device.
    pub unique_service_name: String,
    /// When the advertisement stops being valid.
    pub expires: Instant,
}

/// Source of device advertisements, normally an SSDP multicast listener.
pub trait ServiceDiscovery: Send + Sync + 'static {
    /// Stream of advertisements. Each call starts a fresh search.
    fn discover(&self) -> Pin<Box<dyn Stream<Item = DiscoveredService> + Send>>;
}

/// UPnP client: turns discovered internet gateway devices into
/// [`Gateway`]s.
#[derive(Clone)]
pub struct UpnpNat {
    discovery: Arc<dyn ServiceDiscovery>,
    http: reqwest::Client,
}

impl std::fmt::Debug for UpnpNat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpnpNat").finish_non_exhaustive()
    }
}

impl UpnpNat {
    pub(crate) fn new(discovery: impl ServiceDiscovery) -> Self {
        UpnpNat {
            discovery: Arc::new(discovery),
            http: reqwest::Client::new(),
        }
    }

    /// Stream of gateways as the discovery collaborator finds them.
    ///
    /// Only IGDv2 root devices are considered; devices are deduplicated by
    /// descriptor location.
    pub fn find_gateways(&self) -> impl Stream<Item = Result<Gateway>> {
        let discovery = self.discovery.clone();
        let (tx, rx) = mpsc::channel(GATEWAY_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            let mut services = discovery.discover();
            while let Some(service) = services.next().await {
                if !service.service_type.ends_with(IGD_DEVICE_SUFFIX) {
                    trace!(service_type = %service.service_type, "skipping non-gateway device");
                    continue;
                }
                if !seen.insert(service.location.clone()) {
                    trace!(location = %service.location, "skipping duplicate advertisement");
                    continue;
                }
                debug!(location = %service.location, "discovered gateway");
                let gateway =
                    IgdGateway::spawn(service, Some(discovery.clone())).map(Gateway::Upnp);
                if tx.send(gateway).await.is_err() {
                    break;
                }
            }
        });
        ReceiverStream::new(rx)
    }

    /// Builds a gateway from a descriptor URL directly, bypassing SSDP.
    pub async fn get_gateway(&self, location: Url) -> Result<Gateway> {
        let xml = self
            .http
            .get(location.clone())
            .send()
            .await
            .context("failed to fetch device descriptor")?
            .text()
            .await
            .context("failed to read device descriptor")?;
        let descriptor = DeviceDescriptor::parse(&xml, location.clone())?;
        let service = DiscoveredService {
            service_type: descriptor.root.device_type.clone(),
            unique_service_name: format!(
                "{}::{}",
                descriptor.root.udn, descriptor.root.device_type
            ),
            expires: Instant::now() + DIRECT_DESCRIPTOR_TTL,
            descriptor,
            location,
        };
        IgdGateway::spawn(service, Some(self.discovery.clone())).map(Gateway::Upnp)
    }
}
