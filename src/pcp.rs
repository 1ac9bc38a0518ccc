//! PCP gateway (RFC 6887): mappings with epoch tracking and automatic
//! remapping when the server loses its state.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::{
    gateway::{local_addresses, Family},
    mapping::MappingTable,
    options::{MapOptions, DEFAULT_REFRESH_TIMEOUT, DEFAULT_TTL},
    queue::{PendingRequest, RequestQueue},
    util::{ephemeral_port, now_unix_millis, CancelOnDrop, MaybeFuture},
    PortMapping, Protocol,
};

mod protocol;

/// Capacity of the channel to communicate with the gateway task.
const SERVICE_CHANNEL_CAPACITY: usize = 32;

/// Per-address budget for the ANNOUNCE handshake.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the refresh scheduler scans for expiring mappings.
const REFRESH_TICK: Duration = Duration::from_secs(15);

/// Smallest lease a mapping request will ask for, in seconds.
const MIN_LIFETIME_SECONDS: u32 = 120;

/// Lease of the throwaway mapping used to learn the external address.
const EXTERNAL_IP_LIFETIME_SECONDS: u32 = 120;

/// Tolerated drift between the projected server epoch and the stored one.
const EPOCH_DRIFT_SECONDS: u64 = 10;

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
        protocol: Protocol,
        timeout: Duration,
        #[debug("_")]
        result_tx: oneshot::Sender<Result<()>>,
    },
    ExternalIp {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<IpAddr>>,
    },
    Probe {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<()>>,
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

/// Handle to a PCP gateway.
///
/// Cloning is cheap; the gateway task stops when the last handle is dropped
/// or [`stop`](Self::stop) is called.
#[derive(Debug, Clone)]
pub struct PcpGateway {
    gateway: SocketAddr,
    service_tx: mpsc::Sender<Message>,
    _service_handle: Arc<CancelOnDrop>,
}

impl PcpGateway {
    /// Bind a socket and spawn the gateway task for the PCP server expected
    /// at `gateway_ip`.
    pub(crate) async fn spawn(gateway_ip: IpAddr) -> Result<Self> {
        Self::spawn_at(SocketAddr::new(gateway_ip, protocol::SERVER_PORT)).await
    }

    pub(crate) async fn spawn_at(gateway: SocketAddr) -> Result<Self> {
        let bind_addr: SocketAddr = match gateway.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let service = Service::new(gateway, socket, service_rx);
        let handle = CancelOnDrop::new(
            "pcp.service",
            tokio::spawn(
                service
                    .run()
                    .instrument(info_span!("pcp.service", %gateway)),
            )
            .abort_handle(),
        );
        Ok(PcpGateway {
            gateway,
            service_tx,
            _service_handle: Arc::new(handle),
        })
    }

    pub(crate) fn family(&self) -> Family {
        Family::of(self.gateway.ip())
    }

    /// Checks that a PCP server is answering at the gateway address.
    ///
    /// Sends an ANNOUNCE request from each eligible local address in turn,
    /// with a three second budget per attempt.
    pub async fn is_pcp_supported(&self) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send(Message::Probe { result_tx }).await?;
        result_rx.await.map_err(|_| anyhow!("gateway is closed"))?
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

    /// Release a mapping: a MAP request with a zero lifetime, reusing the
    /// row's nonce.
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
            protocol: opts.protocol,
            timeout: opts.request_timeout(),
            result_tx,
        })
        .await?;
        result_rx.await.map_err(|_| anyhow!("gateway is closed"))?
    }

    /// The externally visible address, learned through a short-lived
    /// throwaway mapping.
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

#[derive(derive_more::Debug)]
enum MapKind {
    User {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<PortMapping>>,
    },
    Refresh,
    ExternalIp {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<IpAddr>>,
        rest: Vec<IpAddr>,
    },
}

/// State carried by a queued request, settled exactly once.
#[derive(derive_more::Debug)]
enum Pending {
    Announce {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<()>>,
        rest: Vec<IpAddr>,
    },
    Map {
        host: IpAddr,
        port: u16,
        protocol: Protocol,
        kind: MapKind,
    },
    Unmap {
        host: IpAddr,
        port: u16,
        protocol: Protocol,
        #[debug("_")]
        result_tx: oneshot::Sender<Result<()>>,
    },
}

impl Pending {
    /// Whether the caller stopped waiting on this request.
    fn caller_gone(&self) -> bool {
        match self {
            Pending::Announce { result_tx, .. } => result_tx.is_closed(),
            Pending::Map {
                kind: MapKind::User { result_tx },
                ..
            } => result_tx.is_closed(),
            Pending::Map {
                kind: MapKind::ExternalIp { result_tx, .. },
                ..
            } => result_tx.is_closed(),
            Pending::Map {
                kind: MapKind::Refresh,
                ..
            } => false,
            Pending::Unmap { result_tx, .. } => result_tx.is_closed(),
        }
    }
}

#[derive(Debug)]
struct Service {
    gateway: SocketAddr,
    socket: UdpSocket,
    rx: mpsc::Receiver<Message>,
    queue: RequestQueue<protocol::Opcode, Pending>,
    table: MappingTable,
    /// Server boot time projected onto the local clock, in unix seconds.
    known_epoch: Option<u64>,
}

impl Service {
    fn new(gateway: SocketAddr, socket: UdpSocket, rx: mpsc::Receiver<Message>) -> Self {
        Service {
            gateway,
            socket,
            rx,
            queue: RequestQueue::new(),
            table: MappingTable::default(),
            known_epoch: None,
        }
    }

    async fn run(mut self) {
        debug!("gateway starting");
        let mut refresh = tokio::time::interval(REFRESH_TICK);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // oversized packets land truncated above MAX_SIZE and are rejected
        let mut buf = vec![0u8; protocol::Response::MAX_SIZE + 4];
        loop {
            let request_timeout = MaybeFuture {
                inner: self
                    .queue
                    .deadline()
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
                        self.handle_msg(msg);
                    }
                    None => {
                        debug!("all handles dropped, shutting down");
                        self.shutdown().await;
                        break;
                    }
                },
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok((len, from)) => self.on_datagram(from, &buf[..len]),
                    Err(e) => {
                        warn!("socket error, closing gateway: {e}");
                        self.fail_pending("gateway socket failed");
                        break;
                    }
                },
                _ = request_timeout => self.on_request_timeout(),
                _ = refresh.tick() => self.on_refresh_tick(),
            }
            self.pump().await;
        }
    }

    fn handle_msg(&mut self, msg: Message) {
        match msg {
            Message::Map {
                host,
                port,
                opts,
                result_tx,
            } => {
                if port == 0 {
                    let _ = result_tx.send(Err(anyhow!("internal port must not be zero")));
                    return;
                }
                self.start_map(
                    host,
                    port,
                    opts.protocol,
                    opts.lifetime_seconds(MIN_LIFETIME_SECONDS),
                    opts.external_port,
                    opts.request_timeout(),
                    Some(opts.auto_refresh),
                    MapKind::User { result_tx },
                );
            }
            Message::Unmap {
                host,
                port,
                protocol,
                timeout,
                result_tx,
            } => {
                let Some(row) = self.table.get(host, port, protocol) else {
                    let _ =
                        result_tx.send(Err(anyhow!("no mapping for {protocol} {host}:{port}")));
                    return;
                };
                // deletion reuses the nonce and zeroes lifetime and
                // suggestions
                let request = protocol::Request::mapping(
                    row.nonce,
                    protocol,
                    port,
                    host,
                    Some(0),
                    None,
                    0,
                );
                self.queue.push(PendingRequest {
                    opcode: protocol::Opcode::Map,
                    bytes: request.encode(),
                    timeout,
                    ctx: Pending::Unmap {
                        host,
                        port,
                        protocol,
                        result_tx,
                    },
                });
            }
            Message::ExternalIp { result_tx } => {
                let mut addrs = self.candidate_addresses();
                let first = addrs.remove(0);
                self.start_external_ip_probe(first, addrs, result_tx);
            }
            Message::Probe { result_tx } => {
                let mut addrs = self.candidate_addresses();
                let first = addrs.remove(0);
                self.push_announce(first, addrs, result_tx);
            }
            Message::Mappings { result_tx } => {
                let _ = result_tx.send(self.snapshot());
            }
            Message::Stop { .. } => unreachable!("handled in the run loop"),
        }
    }

    /// Local addresses usable as the PCP client address. Falls back to
    /// localhost when the host has nothing better to offer.
    fn candidate_addresses(&self) -> Vec<IpAddr> {
        let family = Family::of(self.gateway.ip());
        let mut addrs = local_addresses(family);
        if addrs.is_empty() {
            debug!("no address suitable for port mapping found, using localhost");
            addrs.push(match family {
                Family::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
                Family::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        addrs
    }

    #[allow(clippy::too_many_arguments)]
    fn start_map(
        &mut self,
        host: IpAddr,
        port: u16,
        protocol: Protocol,
        lifetime_seconds: u32,
        suggested_port: Option<u16>,
        timeout: Duration,
        auto_refresh: Option<bool>,
        kind: MapKind,
    ) {
        let (nonce, suggested_port, suggested_host) = {
            let row = self
                .table
                .get_or_create(host, port, protocol, auto_refresh.unwrap_or(true));
            if let Some(auto_refresh) = auto_refresh {
                row.auto_refresh = auto_refresh;
            }
            (
                row.nonce,
                suggested_port.or(row.external_port),
                row.external_host,
            )
        };
        let request = protocol::Request::mapping(
            nonce,
            protocol,
            port,
            host,
            suggested_port,
            suggested_host,
            lifetime_seconds,
        );
        self.queue.push(PendingRequest {
            opcode: protocol::Opcode::Map,
            bytes: request.encode(),
            timeout,
            ctx: Pending::Map {
                host,
                port,
                protocol,
                kind,
            },
        });
    }

    fn start_external_ip_probe(
        &mut self,
        host: IpAddr,
        rest: Vec<IpAddr>,
        result_tx: oneshot::Sender<Result<IpAddr>>,
    ) {
        self.start_map(
            host,
            ephemeral_port(),
            Protocol::Udp,
            EXTERNAL_IP_LIFETIME_SECONDS,
            None,
            DEFAULT_REFRESH_TIMEOUT,
            Some(false),
            MapKind::ExternalIp { result_tx, rest },
        );
    }

    fn push_announce(
        &mut self,
        client_addr: IpAddr,
        rest: Vec<IpAddr>,
        result_tx: oneshot::Sender<Result<()>>,
    ) {
        let request = protocol::Request::announce(client_addr);
        self.queue.push(PendingRequest {
            opcode: protocol::Opcode::Announce,
            bytes: request.encode(),
            timeout: ANNOUNCE_TIMEOUT,
            ctx: Pending::Announce { result_tx, rest },
        });
    }

    fn on_datagram(&mut self, from: SocketAddr, buf: &[u8]) {
        if self.queue.is_empty() {
            trace!("dropping datagram, nothing pending");
            return;
        }
        if from != self.gateway {
            trace!(%from, "dropping datagram from unexpected source");
            return;
        }
        let Some(opcode) = protocol::Response::peek_opcode(buf) else {
            debug!("ignoring malformed datagram");
            return;
        };
        let head_opcode = self.queue.head_opcode().expect("queue is not empty");
        if opcode != head_opcode {
            // a stale reply, most likely to a request that timed out earlier
            debug!(?opcode, "ignoring reply that does not match the head request");
            return;
        }
        if let Some(epoch) = protocol::Response::peek_epoch(buf) {
            self.observe_epoch(epoch);
        }
        let request = self.queue.pop_head().expect("queue is not empty");
        let response = protocol::Response::decode(buf);
        self.settle(request.ctx, response);
    }

    /// Projects the server epoch onto the local clock and compares it to the
    /// last projection. A projection that went backwards or drifted too far
    /// means the server rebooted and lost its mappings: re-issue all of them.
    fn observe_epoch(&mut self, epoch_seconds: u32) {
        let now_seconds = now_unix_millis() / 1000;
        let projected = now_seconds.saturating_sub(u64::from(epoch_seconds));
        match self.known_epoch {
            None => self.known_epoch = Some(projected),
            Some(known)
                if projected < known || projected.abs_diff(known) > EPOCH_DRIFT_SECONDS =>
            {
                debug!(known, projected, "server epoch changed, re-issuing all mappings");
                self.known_epoch = Some(projected);
                self.remap();
            }
            Some(_) => {}
        }
    }

    /// Re-issues a MAP request for every row in the table. Failures of
    /// individual rows are logged and do not abort the sweep.
    fn remap(&mut self) {
        let rows: Vec<_> = self
            .table
            .iter()
            .map(|m| (m.internal_host, m.internal_port, m.protocol, m.lifetime))
            .collect();
        for (host, port, protocol, lifetime) in rows {
            self.start_map(
                host,
                port,
                protocol,
                lifetime.unwrap_or(DEFAULT_TTL.as_secs() as u32),
                None,
                DEFAULT_REFRESH_TIMEOUT,
                None,
                MapKind::Refresh,
            );
        }
    }

    /// Scans for mappings entering the second half of their lifetime and
    /// re-issues them (RFC 6887 section 11.2.1).
    fn on_refresh_tick(&mut self) {
        let now = now_unix_millis();
        let due: Vec<_> = self
            .table
            .expiring(now)
            .filter(|m| !self.has_pending_map(m.internal_host, m.internal_port, m.protocol))
            .map(|m| (m.internal_host, m.internal_port, m.protocol, m.lifetime))
            .collect();
        for (host, port, protocol, lifetime) in due {
            trace!(%host, port, "refreshing mapping");
            self.start_map(
                host,
                port,
                protocol,
                lifetime.unwrap_or(DEFAULT_TTL.as_secs() as u32),
                None,
                DEFAULT_REFRESH_TIMEOUT,
                None,
                MapKind::Refresh,
            );
        }
    }

    fn has_pending_map(&self, host: IpAddr, port: u16, protocol: Protocol) -> bool {
        self.queue.iter_ctx().any(|ctx| {
            matches!(ctx, Pending::Map { host: h, port: p, protocol: proto, .. }
                if *h == host && *p == port && *proto == protocol)
        })
    }

    fn settle(&mut self, ctx: Pending, response: Result<protocol::Response, protocol::Error>) {
        match ctx {
            Pending::Announce { result_tx, rest } => match response {
                Ok(_) => {
                    let _ = result_tx.send(Ok(()));
                }
                Err(e) => {
                    debug!("announce failed: {e}");
                    self.next_announce(rest, result_tx);
                }
            },
            Pending::Unmap {
                host,
                port,
                protocol,
                result_tx,
            } => {
                self.table.delete(host, port, protocol);
                let result = response.map(|_| ()).map_err(|e| {
                    anyhow::Error::new(e)
                        .context(format!("failed to release {protocol} {host}:{port}"))
                });
                let _ = result_tx.send(result);
            }
            Pending::Map {
                host,
                port,
                protocol,
                kind,
            } => {
                let outcome = response
                    .map_err(anyhow::Error::new)
                    .and_then(|response| self.apply_map_response(host, port, protocol, response));
                match kind {
                    MapKind::User { result_tx } => match outcome {
                        Ok(mapping) => {
                            let _ = result_tx.send(Ok(mapping));
                        }
                        Err(e) => {
                            // drop the row so a retry allocates a fresh nonce
                            self.table.delete(host, port, protocol);
                            let _ = result_tx.send(Err(e));
                        }
                    },
                    MapKind::Refresh => {
                        if let Err(e) = outcome {
                            debug!(%host, port, "refresh failed: {e:#}");
                        }
                    }
                    MapKind::ExternalIp { result_tx, rest } => {
                        self.table.delete(host, port, protocol);
                        match outcome {
                            Ok(mapping) => {
                                let _ = result_tx.send(Ok(mapping.external_host));
                            }
                            Err(e) => {
                                debug!("external address probe failed: {e:#}");
                                self.next_external_ip(rest, result_tx);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Validates a MAP response against the request and writes the grant
    /// into the table.
    fn apply_map_response(
        &mut self,
        host: IpAddr,
        port: u16,
        protocol: Protocol,
        response: protocol::Response,
    ) -> Result<PortMapping> {
        let protocol::Response {
            lifetime_seconds,
            epoch_time: _,
            data,
        } = response;
        let protocol::OpcodeData::MapData(map_data) = data else {
            bail!("received an announce response for a map request");
        };
        let protocol::MapData {
            nonce,
            protocol: wire_protocol,
            internal_port,
            external_port,
            external_address,
        } = map_data;

        if self.table.get_by_nonce(&nonce).is_none() {
            bail!("received nonce does not match any mapping");
        }
        if wire_protocol != protocol.number() {
            bail!("received mapping is for a different protocol");
        }
        if internal_port != port {
            bail!("received mapping is for a local port that does not match the requested one");
        }
        if external_port == 0 {
            bail!("received 0 external port for mapping");
        }
        let external_host = match host {
            IpAddr::V4(_) => IpAddr::V4(
                external_address
                    .to_ipv4_mapped()
                    .ok_or_else(|| anyhow!("received external address is not ipv4"))?,
            ),
            IpAddr::V6(_) => IpAddr::V6(external_address),
        };

        let expires_at = (now_unix_millis() / 1000 + u64::from(lifetime_seconds)) * 1000;
        if !self.table.update(
            port,
            protocol,
            &nonce,
            external_host,
            external_port,
            expires_at,
            lifetime_seconds,
        ) {
            bail!("no mapping row matches the response");
        }

        Ok(PortMapping {
            protocol,
            internal_host: host,
            internal_port: port,
            external_host,
            external_port,
        })
    }

    fn next_announce(&mut self, mut rest: Vec<IpAddr>, result_tx: oneshot::Sender<Result<()>>) {
        if rest.is_empty() {
            let _ = result_tx.send(Err(anyhow!("no PCP server found at {}", self.gateway)));
        } else {
            let next = rest.remove(0);
            self.push_announce(next, rest, result_tx);
        }
    }

    fn next_external_ip(
        &mut self,
        mut rest: Vec<IpAddr>,
        result_tx: oneshot::Sender<Result<IpAddr>>,
    ) {
        if rest.is_empty() {
            let _ = result_tx.send(Err(anyhow!("could not determine external address")));
        } else {
            let next = rest.remove(0);
            self.start_external_ip_probe(next, rest, result_tx);
        }
    }

    fn on_request_timeout(&mut self) {
        let Some(request) = self.queue.pop_head() else {
            return;
        };
        trace!("request timed out: {:?}", request.ctx);
        self.fail_request(request.ctx, "timed out waiting for the gateway");
    }

    fn fail_request(&mut self, ctx: Pending, reason: &str) {
        match ctx {
            Pending::Announce { result_tx, rest } => self.next_announce(rest, result_tx),
            Pending::Unmap {
                host,
                port,
                protocol,
                result_tx,
            } => {
                self.table.delete(host, port, protocol);
                let _ = result_tx.send(Err(anyhow!("{reason}")));
            }
            Pending::Map {
                host,
                port,
                protocol,
                kind,
            } => match kind {
                MapKind::User { result_tx } => {
                    self.table.delete(host, port, protocol);
                    let _ = result_tx.send(Err(anyhow!("{reason}")));
                }
                MapKind::Refresh => debug!(%host, port, "refresh failed: {reason}"),
                MapKind::ExternalIp { result_tx, rest } => {
                    self.table.delete(host, port, protocol);
                    self.next_external_ip(rest, result_tx);
                }
            },
        }
    }

    /// Terminal rejection of everything still queued.
    fn fail_pending(&mut self, reason: &str) {
        for request in self.queue.drain_all() {
            match request.ctx {
                Pending::Announce { result_tx, .. } => {
                    let _ = result_tx.send(Err(anyhow!("{reason}")));
                }
                Pending::Unmap { result_tx, .. } => {
                    let _ = result_tx.send(Err(anyhow!("{reason}")));
                }
                Pending::Map { kind, .. } => match kind {
                    MapKind::User { result_tx } => {
                        let _ = result_tx.send(Err(anyhow!("{reason}")));
                    }
                    MapKind::Refresh => {}
                    MapKind::ExternalIp { result_tx, .. } => {
                        let _ = result_tx.send(Err(anyhow!("{reason}")));
                    }
                },
            }
        }
    }

    /// Sends the head of the queue if nothing is in flight.
    ///
    /// Requests whose caller went away are dropped first; their MAP rows are
    /// deleted so a retry allocates a fresh nonce.
    async fn pump(&mut self) {
        for request in self.queue.remove_where(Pending::caller_gone) {
            trace!("dropping cancelled request {:?}", request.ctx);
            if let Pending::Map {
                host,
                port,
                protocol,
                ..
            } = request.ctx
            {
                self.table.delete(host, port, protocol);
            }
        }
        loop {
            let sent = match self.queue.start_send() {
                Some(bytes) => self.socket.send_to(bytes, self.gateway).await,
                None => break,
            };
            match sent {
                Ok(_) => break,
                Err(e) => {
                    debug!("failed to send request: {e}");
                    if let Some(request) = self.queue.pop_head() {
                        self.fail_request(request.ctx, "failed to send request to the gateway");
                    }
                }
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

    /// Best-effort release of every mapping before the socket is dropped.
    ///
    /// Deletion is a notification, there is no point in waiting for the
    /// responses.
    async fn shutdown(&mut self) {
        self.fail_pending("gateway is closed");
        for row in self.table.delete_all() {
            let request = protocol::Request::mapping(
                row.nonce,
                row.protocol,
                row.internal_port,
                row.internal_host,
                Some(0),
                None,
                0,
            );
            if let Err(e) = self.socket.send_to(&request.encode(), self.gateway).await {
                debug!("failed to release mapping: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    use super::*;

    /// A request observed by the mock server.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Announce,
        Map {
            nonce: [u8; 12],
            protocol: u8,
            internal_port: u16,
            lifetime: u32,
        },
    }

    /// Speaks just enough PCP to drive the gateway task. Grants every
    /// request, walking through `epochs` one response at a time (the last
    /// entry repeats).
    async fn spawn_mock(
        epochs: Vec<u32>,
        external: Ipv4Addr,
    ) -> (SocketAddr, UnboundedReceiver<Seen>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = unbounded_channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let mut responses = 0usize;
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let epoch = epochs[responses.min(epochs.len() - 1)];
                responses += 1;
                let req = &buf[..len];
                match req[1] {
                    0 => {
                        let _ = tx.send(Seen::Announce);
                        let mut resp = vec![0u8; 24];
                        resp[0] = 2;
                        resp[1] = 0x80;
                        resp[8..12].copy_from_slice(&epoch.to_be_bytes());
                        socket.send_to(&resp, from).await.ok();
                    }
                    1 => {
                        let nonce: [u8; 12] = req[24..36].try_into().unwrap();
                        let protocol = req[36];
                        let internal_port = u16::from_be_bytes(req[40..42].try_into().unwrap());
                        let suggested_port = u16::from_be_bytes(req[42..44].try_into().unwrap());
                        let lifetime = u32::from_be_bytes(req[4..8].try_into().unwrap());
                        let _ = tx.send(Seen::Map {
                            nonce,
                            protocol,
                            internal_port,
                            lifetime,
                        });
                        let granted_port = if suggested_port == 0 {
                            internal_port
                        } else {
                            suggested_port
                        };
                        let mut resp = vec![0u8; 60];
                        resp[0] = 2;
                        resp[1] = 0x81;
                        resp[4..8].copy_from_slice(&lifetime.to_be_bytes());
                        resp[8..12].copy_from_slice(&epoch.to_be_bytes());
                        resp[24..36].copy_from_slice(&nonce);
                        resp[36] = protocol;
                        resp[40..42].copy_from_slice(&internal_port.to_be_bytes());
                        resp[42..44].copy_from_slice(&granted_port.to_be_bytes());
                        resp[44..60].copy_from_slice(&external.to_ipv6_mapped().octets());
                        socket.send_to(&resp, from).await.ok();
                    }
                    _ => {}
                }
            }
        });
        (addr, rx)
    }

    async fn recv_seen(rx: &mut UnboundedReceiver<Seen>) -> Option<Seen> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn no_refresh() -> MapOptions {
        MapOptions {
            auto_refresh: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn probe_and_map() {
        let (addr, mut seen) = spawn_mock(vec![1000], Ipv4Addr::new(2, 2, 2, 2)).await;
        let gateway = PcpGateway::spawn_at(addr).await.unwrap();

        gateway.is_pcp_supported().await.unwrap();
        assert_eq!(recv_seen(&mut seen).await, Some(Seen::Announce));

        let host: IpAddr = "127.0.0.1".parse().unwrap();
        let mapping = gateway.map(5001, host, no_refresh()).await.unwrap();
        assert_eq!(mapping.internal_port, 5001);
        assert_eq!(mapping.external_port, 5001);
        assert_eq!(mapping.external_host, "2.2.2.2".parse::<IpAddr>().unwrap());
        assert_eq!(mapping.protocol, Protocol::Tcp);

        let mappings = gateway.mappings().await.unwrap();
        assert_eq!(mappings, vec![mapping]);
    }

    #[tokio::test]
    async fn epoch_change_triggers_remap() {
        // the second grant pretends the server just rebooted
        let (addr, mut seen) = spawn_mock(vec![1000, 5], Ipv4Addr::new(2, 2, 2, 2)).await;
        let gateway = PcpGateway::spawn_at(addr).await.unwrap();
        let host: IpAddr = "127.0.0.1".parse().unwrap();

        gateway.map(5001, host, no_refresh()).await.unwrap();
        gateway.map(5002, host, no_refresh()).await.unwrap();

        // the deviating epoch makes the gateway re-issue every mapping on
        // its own: both ports must be requested a second time
        let mut counts: HashMap<u16, usize> = HashMap::new();
        for _ in 0..4 {
            match recv_seen(&mut seen).await {
                Some(Seen::Map { internal_port, .. }) => {
                    *counts.entry(internal_port).or_default() += 1
                }
                other => panic!("expected a map request, got {other:?}"),
            }
        }
        assert_eq!(counts.get(&5001), Some(&2));
        assert_eq!(counts.get(&5002), Some(&2));
    }

    #[tokio::test]
    async fn external_ip_uses_a_throwaway_mapping() {
        let (addr, mut seen) = spawn_mock(vec![1000], Ipv4Addr::new(84, 84, 84, 84)).await;
        let gateway = PcpGateway::spawn_at(addr).await.unwrap();

        let ip = gateway.external_ip().await.unwrap();
        assert_eq!(ip, "84.84.84.84".parse::<IpAddr>().unwrap());

        match recv_seen(&mut seen).await {
            Some(Seen::Map {
                protocol,
                internal_port,
                lifetime,
                ..
            }) => {
                assert_eq!(protocol, Protocol::Udp.number());
                assert!((49152..=65535).contains(&internal_port));
                assert_eq!(lifetime, EXTERNAL_IP_LIFETIME_SECONDS);
            }
            other => panic!("expected a map request, got {other:?}"),
        }

        // the probe mapping does not linger in the table
        assert!(gateway.mappings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmap_reuses_the_nonce_with_zero_lifetime() {
        let (addr, mut seen) = spawn_mock(vec![1000], Ipv4Addr::new(2, 2, 2, 2)).await;
        let gateway = PcpGateway::spawn_at(addr).await.unwrap();
        let host: IpAddr = "127.0.0.1".parse().unwrap();

        gateway.map(5001, host, no_refresh()).await.unwrap();
        let Some(Seen::Map { nonce, .. }) = recv_seen(&mut seen).await else {
            panic!("expected a map request");
        };

        gateway.unmap(5001, host, no_refresh()).await.unwrap();
        match recv_seen(&mut seen).await {
            Some(Seen::Map {
                nonce: released,
                lifetime,
                ..
            }) => {
                assert_eq!(released, nonce);
                assert_eq!(lifetime, 0);
            }
            other => panic!("expected a map request, got {other:?}"),
        }

        assert!(gateway.mappings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_releases_mappings_and_closes() {
        let (addr, mut seen) = spawn_mock(vec![1000], Ipv4Addr::new(2, 2, 2, 2)).await;
        let gateway = PcpGateway::spawn_at(addr).await.unwrap();
        let host: IpAddr = "127.0.0.1".parse().unwrap();

        gateway.map(5001, host, no_refresh()).await.unwrap();
        let _ = recv_seen(&mut seen).await;

        gateway.stop().await.unwrap();
        // the mapping is released on the way out
        match recv_seen(&mut seen).await {
            Some(Seen::Map { lifetime, .. }) => assert_eq!(lifetime, 0),
            other => panic!("expected a release, got {other:?}"),
        }

        let err = gateway.map(5002, host, no_refresh()).await.unwrap_err();
        assert!(err.to_string().contains("gateway is closed"));
    }

    #[tokio::test]
    async fn map_rejects_port_zero() {
        let (addr, _seen) = spawn_mock(vec![1000], Ipv4Addr::new(2, 2, 2, 2)).await;
        let gateway = PcpGateway::spawn_at(addr).await.unwrap();
        let err = gateway
            .map(0, "127.0.0.1".parse().unwrap(), no_refresh())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("internal port"));
    }
}
