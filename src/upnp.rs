//! UPnP IGD gateway: SOAP actions against a discovered device descriptor.
//!
//! IPv4 gateways speak `WANIPConnection` (v2 preferred, v1 fallback); IPv6
//! gateways speak `WANIPv6FirewallControl` and punch firewall pinholes
//! instead of translating addresses.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use futures_lite::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span, trace, Instrument};
use url::Url;
use xmltree::Element;

use crate::{
    discovery::{DiscoveredService, ServiceDiscovery},
    gateway::{local_addresses, Family},
    mapping::MappingTable,
    options::{MapOptions, DEFAULT_REFRESH_THRESHOLD, DEFAULT_TTL},
    util::{now_unix_millis, CancelOnDrop, MaybeFuture},
    PortMapping, Protocol,
};

pub(crate) mod device;
pub(crate) mod soap;

pub use soap::UpnpError;

use device::{
    DeviceDescriptor, WAN_IPV6_FIREWALL_CONTROL, WAN_IP_CONNECTION_1, WAN_IP_CONNECTION_2,
};

/// Capacity of the channel to communicate with the gateway task.
const SERVICE_CHANNEL_CAPACITY: usize = 32;

/// Budget for a single SOAP request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for finding a replacement descriptor once the current one expired.
const REDISCOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Pinhole leases shorter than this are raised to it (IGDv2 firewall
/// control).
const MIN_PINHOLE_LEASE_SECONDS: u32 = 3600;

#[derive(derive_more::Debug)]
enum Message {
    Map {
        host: IpAddr,
        port: u16,
        opts: MapOptions,
        #[debug("_")]
        result_tx: oneshot::Sender<Result<PortMapping>>,
    },
    Unmap {
        host: IpAddr,
        port: u16,
        opts: MapOptions,
        #[debug("_")]
        result_tx: oneshot::Sender<Result<()>>,
    },
    ExternalIp {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<IpAddr>>,
    },
    Mappings {
        #[debug("_")]
        result_tx: oneshot::Sender<Vec<PortMapping>>,
    },
    Stop {
        #[debug("_")]
        result_tx: oneshot::Sender<()>,
    },
}

/// Handle to a UPnP internet gateway device.
///
/// Cloning is cheap; the gateway task stops when the last handle is dropped
/// or [`stop`](Self::stop) is called.
#[derive(Debug, Clone)]
pub struct IgdGateway {
    location: Url,
    family: Family,
    service_tx: mpsc::Sender<Message>,
    _service_handle: Arc<CancelOnDrop>,
}

impl IgdGateway {
    pub(crate) fn spawn(
        service: DiscoveredService,
        discovery: Option<Arc<dyn ServiceDiscovery>>,
    ) -> Result<Self> {
        let location = service.location.clone();
        let family = family_of_location(&location);
        let (control_url, service_type) = resolve_service(&service.descriptor, family)?;
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let actor = Service {
            http,
            rx: service_rx,
            discovery,
            service,
            control_url,
            service_type,
            family,
            table: MappingTable::default(),
            extras: HashMap::new(),
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
        };
        let span = info_span!("upnp.service", location = %location);
        let handle = CancelOnDrop::new(
            "upnp.service",
            tokio::spawn(actor.run().instrument(span)).abort_handle(),
        );
        Ok(IgdGateway {
            location,
            family,
            service_tx,
            _service_handle: Arc::new(handle),
        })
    }

    /// The descriptor URL this gateway was built from.
    pub fn location(&self) -> &Url {
        &self.location
    }

    pub(crate) fn family(&self) -> Family {
        self.family
    }

    /// Map `internal_port` of `internal_host` on the gateway.
    pub async fn map(
        &self,
        internal_port: u16,
        internal_host: IpAddr,
        opts: MapOptions,
    ) -> Result<PortMapping> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(Message::Map {
            host: internal_host,
            port: internal_port,
            opts,
            result_tx,
        })
        .await?;
        result_rx.await.map_err(|_| anyhow!("gateway is closed"))?
    }

    /// Release the mapping (or pinhole) of `internal_port`.
    pub async fn unmap(
        &self,
        internal_port: u16,
        internal_host: IpAddr,
        opts: MapOptions,
    ) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(Message::Unmap {
            host: internal_host,
            port: internal_port,
            opts,
            result_tx,
        })
        .await?;
        result_rx.await.map_err(|_| anyhow!("gateway is closed"))?
    }

    /// The externally visible address of the gateway.
    pub async fn external_ip(&self) -> Result<IpAddr> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(Message::ExternalIp { result_tx }).await?;
        result_rx.await.map_err(|_| anyhow!("gateway is closed"))?
    }

    /// Snapshot of the granted mappings.
    pub async fn mappings(&self) -> Result<Vec<PortMapping>> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(Message::Mappings { result_tx }).await?;
        result_rx.await.map_err(|_| anyhow!("gateway is closed"))
    }

    /// Stop the gateway task, releasing every mapping best-effort.
    pub async fn stop(&self) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(Message::Stop { result_tx }).await?;
        result_rx.await.map_err(|_| anyhow!("gateway is closed"))
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.service_tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("gateway is closed"))
    }
}

fn family_of_location(location: &Url) -> Family {
    match location.host() {
        Some(url::Host::Ipv6(_)) => Family::V6,
        _ => Family::V4,
    }
}

fn resolve_service(descriptor: &DeviceDescriptor, family: Family) -> Result<(Url, String)> {
    let service_types: &[&str] = match family {
        Family::V4 => &[WAN_IP_CONNECTION_2, WAN_IP_CONNECTION_1],
        Family::V6 => &[WAN_IPV6_FIREWALL_CONTROL],
    };
    let service = descriptor
        .root
        .find_service(service_types)
        .ok_or_else(|| anyhow!("no compatible WAN service in device descriptor"))?;
    Ok((
        descriptor.control_url(service)?,
        service.service_type.clone(),
    ))
}

/// The gateway does not know the action; IGDv1 devices answer 401, IGDv2
/// devices may answer 602 for optional actions.
fn is_unsupported_action(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<UpnpError>(),
        Some(UpnpError {
            code: 401 | 602,
            ..
        })
    )
}

/// Per-row state that has no place in the mapping table.
#[derive(Debug, Clone)]
struct RowExtra {
    description: String,
    /// Identifies an IPv6 pinhole for update and delete.
    pinhole_id: Option<String>,
}

struct Service {
    http: reqwest::Client,
    rx: mpsc::Receiver<Message>,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
    service: DiscoveredService,
    control_url: Url,
    service_type: String,
    family: Family,
    table: MappingTable,
    extras: HashMap<(IpAddr, u16, Protocol), RowExtra>,
    refresh_threshold: Duration,
}

impl Service {
    async fn run(mut self) {
        debug!("gateway starting");
        loop {
            let refresh_timer = MaybeFuture {
                inner: self
                    .next_refresh_deadline()
                    .map(|deadline| Box::pin(tokio::time::sleep_until(deadline))),
            };
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(Message::Stop { result_tx }) => {
                        self.shutdown().await;
                        let _ = result_tx.send(());
                        break;
                    }
                    Some(msg) => {
                        trace!("tick: msg {msg:?}");
                        self.handle_msg(msg).await;
                    }
                    None => {
                        debug!("all handles dropped, shutting down");
                        self.shutdown().await;
                        break;
                    }
                },
                _ = refresh_timer => self.on_refresh_due().await,
            }
        }
    }

    async fn handle_msg(&mut self, msg: Message) {
        match msg {
            Message::Map {
                host,
                port,
                opts,
                result_tx,
            } => {
                let result = self.do_map(host, port, &opts).await;
                if result.is_err() {
                    self.table.delete(host, port, opts.protocol);
                    self.extras.remove(&(host, port, opts.protocol));
                }
                let _ = result_tx.send(result);
            }
            Message::Unmap {
                host,
                port,
                opts,
                result_tx,
            } => {
                let _ = result_tx.send(self.do_unmap(host, port, &opts).await);
            }
            Message::ExternalIp { result_tx } => {
                let _ = result_tx.send(self.do_external_ip().await);
            }
            Message::Mappings { result_tx } => {
                let _ = result_tx.send(self.snapshot());
            }
            Message::Stop { .. } => unreachable!("handled in the run loop"),
        }
    }

    async fn do_map(&mut self, host: IpAddr, port: u16, opts: &MapOptions) -> Result<PortMapping> {
        if port == 0 {
            bail!("internal port must not be zero");
        }
        self.refresh_threshold = opts.refresh_threshold;
        let nonce = {
            let row = self
                .table
                .get_or_create(host, port, opts.protocol, opts.auto_refresh);
            row.auto_refresh = opts.auto_refresh;
            row.nonce
        };
        self.extras.insert(
            (host, port, opts.protocol),
            RowExtra {
                description: opts.description.clone(),
                pinhole_id: None,
            },
        );

        let (external_host, external_port, lifetime) = match self.family {
            Family::V4 => {
                let lease = opts.lifetime_seconds(0);
                let requested = opts.external_port.unwrap_or(port);
                let assigned = self
                    .add_mapping(
                        opts.remote_host,
                        requested,
                        opts.protocol,
                        port,
                        host,
                        &opts.description,
                        lease,
                    )
                    .await?;
                let external_host = self.get_external_ip().await?;
                (external_host, assigned, lease)
            }
            Family::V6 => {
                let IpAddr::V6(_) = host else {
                    bail!("IPv6 pinholes require an IPv6 internal host");
                };
                let lease = opts.lifetime_seconds(MIN_PINHOLE_LEASE_SECONDS);
                let unique_id = self
                    .add_pinhole(opts.remote_host, opts.protocol, port, host, lease)
                    .await?;
                if let Some(extra) = self.extras.get_mut(&(host, port, opts.protocol)) {
                    extra.pinhole_id = Some(unique_id);
                }
                // a pinhole does not translate: the mapping is reachable at
                // the internal endpoint itself
                (host, port, lease)
            }
        };

        let expires_at = (now_unix_millis() / 1000 + u64::from(lifetime)) * 1000;
        self.table.update(
            port,
            opts.protocol,
            &nonce,
            external_host,
            external_port,
            expires_at,
            lifetime,
        );

        Ok(PortMapping {
            protocol: opts.protocol,
            internal_host: host,
            internal_port: port,
            external_host,
            external_port,
        })
    }

    /// IGDv2 `AddAnyPortMapping`, falling back to IGDv1 `AddPortMapping`
    /// when the gateway does not know the action. Returns the granted
    /// external port.
    #[allow(clippy::too_many_arguments)]
    async fn add_mapping(
        &mut self,
        remote_host: Option<IpAddr>,
        external_port: u16,
        protocol: Protocol,
        internal_port: u16,
        internal_host: IpAddr,
        description: &str,
        lease_seconds: u32,
    ) -> Result<u16> {
        let remote = remote_host.map(|ip| ip.to_string()).unwrap_or_default();
        if self.service_type == WAN_IP_CONNECTION_2 {
            let args = [
                ("NewRemoteHost", remote.clone()),
                ("NewExternalPort", external_port.to_string()),
                ("NewProtocol", protocol.to_string()),
                ("NewInternalPort", internal_port.to_string()),
                ("NewInternalClient", internal_host.to_string()),
                ("NewEnabled", "1".to_string()),
                ("NewPortMappingDescription", description.to_string()),
                ("NewLeaseDuration", lease_seconds.to_string()),
            ];
            match self.perform("AddAnyPortMapping", &args).await {
                Ok(response) => {
                    // the gateway may reserve a different port than requested
                    return soap::child_text(&response, "NewReservedPort")
                        .and_then(|port| port.parse().ok())
                        .ok_or_else(|| anyhow!("AddAnyPortMapping returned no reserved port"));
                }
                Err(e) if is_unsupported_action(&e) => {
                    debug!("AddAnyPortMapping not supported, falling back to AddPortMapping");
                }
                Err(e) => return Err(e),
            }
        }
        let args = [
            ("NewRemoteHost", remote),
            ("NewExternalPort", external_port.to_string()),
            ("NewProtocol", protocol.to_string()),
            ("NewInternalPort", internal_port.to_string()),
            ("NewInternalClient", internal_host.to_string()),
            ("NewEnabled", "1".to_string()),
            ("NewPortMappingDescription", description.to_string()),
            ("NewLeaseDuration", lease_seconds.to_string()),
        ];
        self.perform("AddPortMapping", &args).await?;
        Ok(external_port)
    }

    /// IGDv2 `AddPinhole`, returning the pinhole's `UniqueID`.
    async fn add_pinhole(
        &mut self,
        remote_host: Option<IpAddr>,
        protocol: Protocol,
        internal_port: u16,
        internal_host: IpAddr,
        lease_seconds: u32,
    ) -> Result<String> {
        let remote = remote_host.map(|ip| ip.to_string()).unwrap_or_default();
        let args = [
            ("RemoteHost", remote),
            ("RemotePort", "0".to_string()),
            ("InternalClient", internal_host.to_string()),
            ("InternalPort", internal_port.to_string()),
            ("Protocol", protocol.number().to_string()),
            ("LeaseTime", lease_seconds.to_string()),
        ];
        let response = self.perform("AddPinhole", &args).await?;
        soap::child_text(&response, "UniqueID")
            .ok_or_else(|| anyhow!("AddPinhole returned no UniqueID"))
    }

    async fn do_unmap(&mut self, host: IpAddr, port: u16, opts: &MapOptions) -> Result<()> {
        let protocol = opts.protocol;
        let Some(row) = self.table.get(host, port, protocol) else {
            bail!("no mapping for {protocol} {host}:{port}");
        };
        let external_port = row
            .external_port
            .or(opts.external_port)
            .unwrap_or(port);
        let extra = self.extras.remove(&(host, port, protocol));
        self.table.delete(host, port, protocol);

        match self.family {
            Family::V4 => {
                let args = [
                    ("NewRemoteHost", String::new()),
                    ("NewExternalPort", external_port.to_string()),
                    ("NewProtocol", protocol.to_string()),
                ];
                self.perform("DeletePortMapping", &args).await?;
            }
            Family::V6 => {
                let unique_id = extra
                    .and_then(|extra| extra.pinhole_id)
                    .ok_or_else(|| anyhow!("no pinhole id for {protocol} {host}:{port}"))?;
                self.perform("DeletePinhole", &[("UniqueID", unique_id)])
                    .await?;
            }
        }
        Ok(())
    }

    async fn do_external_ip(&mut self) -> Result<IpAddr> {
        match self.family {
            Family::V4 => self.get_external_ip().await,
            // pinholes do not translate addresses, the host is reachable at
            // its own global address
            Family::V6 => local_addresses(Family::V6)
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no global IPv6 address on this host")),
        }
    }

    async fn get_external_ip(&mut self) -> Result<IpAddr> {
        let response = self.perform("GetExternalIPAddress", &[]).await?;
        let address = soap::child_text(&response, "NewExternalIPAddress")
            .ok_or_else(|| anyhow!("gateway returned no external address"))?;
        address
            .parse()
            .with_context(|| format!("gateway returned invalid external address {address:?}"))
    }

    /// Earliest instant at which some mapping wants to be refreshed.
    fn next_refresh_deadline(&self) -> Option<tokio::time::Instant> {
        let threshold_ms = self.refresh_threshold.as_millis() as u64;
        let now = now_unix_millis();
        self.table
            .iter()
            .filter(|m| m.auto_refresh)
            .filter_map(|m| m.expires_at)
            .map(|expires_at| expires_at.saturating_sub(threshold_ms))
            .min()
            .map(|due_ms| {
                tokio::time::Instant::now() + Duration::from_millis(due_ms.saturating_sub(now))
            })
    }

    /// Re-issues every mapping whose one-shot refresh timer fired: IPv4 rows
    /// repeat the mapping action, IPv6 pinholes are updated in place. A
    /// failed refresh disarms the row's timer.
    async fn on_refresh_due(&mut self) {
        let threshold_ms = self.refresh_threshold.as_millis() as u64;
        let now = now_unix_millis();
        let due: Vec<_> = self
            .table
            .iter()
            .filter(|m| {
                m.auto_refresh
                    && m.expires_at
                        .is_some_and(|expires_at| expires_at.saturating_sub(threshold_ms) <= now)
            })
            .map(|m| {
                (
                    m.internal_host,
                    m.internal_port,
                    m.protocol,
                    m.external_port,
                    m.lifetime,
                )
            })
            .collect();
        for (host, port, protocol, external_port, lifetime) in due {
            trace!(%host, port, "refreshing mapping");
            let result = self
                .refresh_row(host, port, protocol, external_port, lifetime)
                .await;
            match result {
                Ok(lifetime) => {
                    let expires_at = (now_unix_millis() / 1000 + u64::from(lifetime)) * 1000;
                    if let Some(row) = self.table.get_mut(host, port, protocol) {
                        row.expires_at = Some(expires_at);
                        row.lifetime = Some(lifetime);
                    }
                }
                Err(e) => {
                    debug!(%host, port, "refresh failed, disarming: {e:#}");
                    if let Some(row) = self.table.get_mut(host, port, protocol) {
                        row.auto_refresh = false;
                    }
                }
            }
        }
    }

    async fn refresh_row(
        &mut self,
        host: IpAddr,
        port: u16,
        protocol: Protocol,
        external_port: Option<u16>,
        lifetime: Option<u32>,
    ) -> Result<u32> {
        let extra = self
            .extras
            .get(&(host, port, protocol))
            .cloned()
            .ok_or_else(|| anyhow!("row state lost"))?;
        match self.family {
            Family::V4 => {
                let lease = lifetime.unwrap_or(DEFAULT_TTL.as_secs() as u32);
                self.add_mapping(
                    None,
                    external_port.unwrap_or(port),
                    protocol,
                    port,
                    host,
                    &extra.description,
                    lease,
                )
                .await?;
                Ok(lease)
            }
            Family::V6 => {
                let lease = lifetime
                    .unwrap_or(MIN_PINHOLE_LEASE_SECONDS)
                    .max(MIN_PINHOLE_LEASE_SECONDS);
                let unique_id = extra
                    .pinhole_id
                    .ok_or_else(|| anyhow!("no pinhole id for {protocol} {host}:{port}"))?;
                let args = [
                    ("UniqueID", unique_id),
                    ("NewLeaseTime", lease.to_string()),
                ];
                self.perform("UpdatePinhole", &args).await?;
                Ok(lease)
            }
        }
    }

    /// POSTs one SOAP action to the control URL, renewing the descriptor
    /// first if its advertisement expired.
    async fn perform(&mut self, action: &str, args: &[(&str, String)]) -> Result<Element> {
        self.ensure_descriptor().await?;
        let body = soap::envelope(&self.service_type, action, args);
        let response = self
            .http
            .post(self.control_url.clone())
            .header("SOAPACTION", soap::action_header(&self.service_type, action))
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .body(body)
            .send()
            .await
            .with_context(|| format!("{action} request failed"))?;
        let text = response
            .text()
            .await
            .with_context(|| format!("failed to read {action} response"))?;
        soap::parse_response(&text, action)
    }

    /// Re-discovers the device when its SSDP advertisement ran out, matching
    /// on the unique service name.
    async fn ensure_descriptor(&mut self) -> Result<()> {
        if self.service.expires > Instant::now() {
            return Ok(());
        }
        let Some(discovery) = self.discovery.clone() else {
            bail!("could not resolve gateway");
        };
        debug!("descriptor expired, rediscovering");
        let mut stream = discovery.discover();
        let deadline = tokio::time::Instant::now() + REDISCOVER_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(found)) => {
                    if found.unique_service_name == self.service.unique_service_name
                        && family_of_location(&found.location) == self.family
                    {
                        let (control_url, service_type) =
                            resolve_service(&found.descriptor, self.family)?;
                        self.control_url = control_url;
                        self.service_type = service_type;
                        self.service = found;
                        return Ok(());
                    }
                }
                Ok(None) | Err(_) => bail!("could not resolve gateway"),
            }
        }
    }

    fn snapshot(&self) -> Vec<PortMapping> {
        self.table
            .iter()
            .filter_map(|m| {
                Some(PortMapping {
                    protocol: m.protocol,
                    internal_host: m.internal_host,
                    internal_port: m.internal_port,
                    external_host: m.external_host?,
                    external_port: m.external_port?,
                })
            })
            .collect()
    }

    /// Best-effort release of every mapping.
    async fn shutdown(&mut self) {
        for row in self.table.delete_all() {
            let key = (row.internal_host, row.internal_port, row.protocol);
            let extra = self.extras.remove(&key);
            let result = match self.family {
                Family::V4 => {
                    let args = [
                        ("NewRemoteHost", String::new()),
                        (
                            "NewExternalPort",
                            row.external_port.unwrap_or(row.internal_port).to_string(),
                        ),
                        ("NewProtocol", row.protocol.to_string()),
                    ];
                    self.perform("DeletePortMapping", &args).await.map(|_| ())
                }
                Family::V6 => match extra.and_then(|extra| extra.pinhole_id) {
                    Some(unique_id) => self
                        .perform("DeletePinhole", &[("UniqueID", unique_id)])
                        .await
                        .map(|_| ()),
                    None => Ok(()),
                },
            };
            if let Err(e) = result {
                debug!("failed to release mapping: {e:#}");
            }
        }
    }
}
