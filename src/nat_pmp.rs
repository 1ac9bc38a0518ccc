//! NAT-PMP gateway (RFC 6886). IPv4 only.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
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
    mapping::MappingTable,
    options::{MapOptions, DEFAULT_REFRESH_THRESHOLD},
    queue::{PendingRequest, RequestQueue},
    util::{now_unix_millis, CancelOnDrop, MaybeFuture},
    PortMapping, Protocol,
};

mod protocol;

/// Capacity of the channel to communicate with the gateway task.
const SERVICE_CHANNEL_CAPACITY: usize = 32;

/// Recommended mapping lifetime (RFC 6886 section 3.3), used when the caller
/// does not provide a usable one.
const RECOMMENDED_LIFETIME_SECONDS: u32 = 7200;

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
    Mappings {
        #[debug("_")]
        result_tx: oneshot::Sender<Vec<PortMapping>>,
    },
    Stop {
        #[debug("_")]
        result_tx: oneshot::Sender<()>,
    },
}

/// Handle to a NAT-PMP gateway.
///
/// Cloning is cheap; the gateway task stops when the last handle is dropped
/// or [`stop`](Self::stop) is called.
#[derive(Debug, Clone)]
pub struct NatPmpGateway {
    service_tx: mpsc::Sender<Message>,
    _service_handle: Arc<CancelOnDrop>,
}

impl NatPmpGateway {
    /// Bind a socket and spawn the gateway task for the NAT-PMP server
    /// expected at `gateway_ip`.
    pub(crate) async fn spawn(gateway_ip: Ipv4Addr) -> Result<Self> {
        Self::spawn_at(SocketAddr::new(IpAddr::V4(gateway_ip), protocol::SERVER_PORT)).await
    }

    pub(crate) async fn spawn_at(gateway: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let service = Service::new(gateway, socket, service_rx);
        let handle = CancelOnDrop::new(
            "nat_pmp.service",
            tokio::spawn(
                service
                    .run()
                    .instrument(info_span!("nat_pmp.service", %gateway)),
            )
            .abort_handle(),
        );
        Ok(NatPmpGateway {
            service_tx,
            _service_handle: Arc::new(handle),
        })
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

    /// Release a mapping: a MAP request with zero lifetime and external
    /// port.
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

    /// The externally visible address, from the dedicated opcode.
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
enum ExternalKind {
    User {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<IpAddr>>,
    },
    /// Resolving the address a mapping response will be combined with.
    Internal,
}

#[derive(derive_more::Debug)]
enum MapKind {
    User {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<PortMapping>>,
    },
    Refresh,
}

/// State carried by a queued request, settled exactly once.
#[derive(derive_more::Debug)]
enum Pending {
    ExternalAddress {
        kind: ExternalKind,
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
    fn caller_gone(&self) -> bool {
        match self {
            Pending::ExternalAddress {
                kind: ExternalKind::User { result_tx },
            } => result_tx.is_closed(),
            Pending::ExternalAddress {
                kind: ExternalKind::Internal,
            } => false,
            Pending::Map {
                kind: MapKind::User { result_tx },
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
    /// Last public address reported by the gateway.
    external_ip: Option<Ipv4Addr>,
    refresh_threshold: Duration,
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
            external_ip: None,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
        }
    }

    async fn run(mut self) {
        debug!("gateway starting");
        let mut buf = vec![0u8; protocol::Response::MAX_SIZE + 4];
        loop {
            let request_timeout = MaybeFuture {
                inner: self
                    .queue
                    .deadline()
                    .map(|deadline| Box::pin(tokio::time::sleep_until(deadline))),
            };
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
                _ = refresh_timer => self.on_refresh_due(),
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
                if !host.is_ipv4() {
                    let _ = result_tx.send(Err(anyhow!("NAT-PMP supports IPv4 only")));
                    return;
                }
                self.refresh_threshold = opts.refresh_threshold;
                // the mapping response carries no address, so the public
                // address is resolved first
                if self.external_ip.is_none() && !self.has_pending_external() {
                    self.push_external(ExternalKind::Internal, opts.request_timeout());
                }
                {
                    let row = self
                        .table
                        .get_or_create(host, port, opts.protocol, opts.auto_refresh);
                    row.auto_refresh = opts.auto_refresh;
                }
                self.push_map(
                    host,
                    port,
                    opts.protocol,
                    opts.external_port,
                    lifetime_seconds(&opts),
                    opts.request_timeout(),
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
                if self.table.get(host, port, protocol).is_none() {
                    let _ =
                        result_tx.send(Err(anyhow!("no mapping for {protocol} {host}:{port}")));
                    return;
                }
                let request = protocol::Request::Mapping {
                    protocol,
                    internal_port: port,
                    external_port: 0,
                    lifetime_seconds: 0,
                };
                self.queue.push(PendingRequest {
                    opcode: request.opcode(),
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
                self.push_external(
                    ExternalKind::User { result_tx },
                    MapOptions::default().request_timeout(),
                );
            }
            Message::Mappings { result_tx } => {
                let _ = result_tx.send(self.snapshot());
            }
            Message::Stop { .. } => unreachable!("handled in the run loop"),
        }
    }

    fn has_pending_external(&self) -> bool {
        self.queue
            .iter_ctx()
            .any(|ctx| matches!(ctx, Pending::ExternalAddress { .. }))
    }

    fn has_pending_map(&self, host: IpAddr, port: u16, protocol: Protocol) -> bool {
        self.queue.iter_ctx().any(|ctx| {
            matches!(ctx, Pending::Map { host: h, port: p, protocol: proto, .. }
                if *h == host && *p == port && *proto == protocol)
        })
    }

    fn push_external(&mut self, kind: ExternalKind, timeout: Duration) {
        let request = protocol::Request::ExternalAddress;
        self.queue.push(PendingRequest {
            opcode: request.opcode(),
            bytes: request.encode(),
            timeout,
            ctx: Pending::ExternalAddress { kind },
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn push_map(
        &mut self,
        host: IpAddr,
        port: u16,
        protocol: Protocol,
        external_port: Option<u16>,
        lifetime_seconds: u32,
        timeout: Duration,
        kind: MapKind,
    ) {
        let external_port = external_port
            .or_else(|| self.table.get(host, port, protocol).and_then(|m| m.external_port))
            .unwrap_or(0);
        let request = protocol::Request::Mapping {
            protocol,
            internal_port: port,
            external_port,
            lifetime_seconds,
        };
        self.queue.push(PendingRequest {
            opcode: request.opcode(),
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

    /// A projection that went backwards or drifted too far means the gateway
    /// rebooted and lost its mappings: re-issue all of them (RFC 6886
    /// section 3.6).
    fn observe_epoch(&mut self, epoch_seconds: u32) {
        let now_seconds = now_unix_millis() / 1000;
        let projected = now_seconds.saturating_sub(u64::from(epoch_seconds));
        match self.known_epoch {
            None => self.known_epoch = Some(projected),
            Some(known)
                if projected < known || projected.abs_diff(known) > EPOCH_DRIFT_SECONDS =>
            {
                debug!(known, projected, "gateway epoch changed, re-issuing all mappings");
                self.known_epoch = Some(projected);
                self.remap();
            }
            Some(_) => {}
        }
    }

    fn remap(&mut self) {
        let rows: Vec<_> = self
            .table
            .iter()
            .map(|m| (m.internal_host, m.internal_port, m.protocol, m.lifetime))
            .collect();
        for (host, port, protocol, lifetime) in rows {
            self.push_map(
                host,
                port,
                protocol,
                None,
                lifetime.unwrap_or(RECOMMENDED_LIFETIME_SECONDS),
                MapOptions::default().request_timeout(),
                MapKind::Refresh,
            );
        }
    }

    /// Earliest instant at which some mapping wants to be refreshed. Rows
    /// with a request already queued don't count.
    fn next_refresh_deadline(&self) -> Option<tokio::time::Instant> {
        let threshold_ms = self.refresh_threshold.as_millis() as u64;
        let now = now_unix_millis();
        self.table
            .iter()
            .filter(|m| {
                m.auto_refresh
                    && !self.has_pending_map(m.internal_host, m.internal_port, m.protocol)
            })
            .filter_map(|m| m.expires_at)
            .map(|expires_at| expires_at.saturating_sub(threshold_ms))
            .min()
            .map(|due_ms| {
                tokio::time::Instant::now() + Duration::from_millis(due_ms.saturating_sub(now))
            })
    }

    /// Re-issues every mapping whose one-shot refresh timer fired.
    fn on_refresh_due(&mut self) {
        let threshold_ms = self.refresh_threshold.as_millis() as u64;
        let now = now_unix_millis();
        let due: Vec<_> = self
            .table
            .iter()
            .filter(|m| {
                m.auto_refresh
                    && m.expires_at
                        .is_some_and(|expires_at| expires_at.saturating_sub(threshold_ms) <= now)
                    && !self.has_pending_map(m.internal_host, m.internal_port, m.protocol)
            })
            .map(|m| (m.internal_host, m.internal_port, m.protocol, m.lifetime))
            .collect();
        for (host, port, protocol, lifetime) in due {
            trace!(%host, port, "refreshing mapping");
            self.push_map(
                host,
                port,
                protocol,
                None,
                lifetime.unwrap_or(RECOMMENDED_LIFETIME_SECONDS),
                MapOptions::default().request_timeout(),
                MapKind::Refresh,
            );
        }
    }

    fn settle(&mut self, ctx: Pending, response: Result<protocol::Response, protocol::Error>) {
        match ctx {
            Pending::ExternalAddress { kind } => {
                let outcome = response.map_err(anyhow::Error::new).and_then(|response| {
                    let protocol::Response::PublicAddress { public_ip, .. } = response else {
                        bail!("received a mapping response for an address request");
                    };
                    Ok(public_ip)
                });
                match &outcome {
                    Ok(public_ip) => {
                        self.external_ip = Some(*public_ip);
                    }
                    Err(e) => debug!("external address request failed: {e:#}"),
                }
                if let ExternalKind::User { result_tx } = kind {
                    let _ = result_tx.send(outcome.map(IpAddr::V4));
                }
            }
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
                            self.table.delete(host, port, protocol);
                            let _ = result_tx.send(Err(e));
                        }
                    },
                    MapKind::Refresh => {
                        if let Err(e) = outcome {
                            debug!(%host, port, "refresh failed, disarming: {e:#}");
                            if let Some(row) = self.table.get_mut(host, port, protocol) {
                                row.auto_refresh = false;
                            }
                        }
                    }
                }
            }
        }
    }

    fn apply_map_response(
        &mut self,
        host: IpAddr,
        port: u16,
        protocol: Protocol,
        response: protocol::Response,
    ) -> Result<PortMapping> {
        let protocol::Response::PortMap {
            protocol: wire_protocol,
            epoch_time: _,
            internal_port,
            external_port,
            lifetime_seconds,
        } = response
        else {
            bail!("received an address response for a map request");
        };
        if wire_protocol != protocol {
            bail!("received mapping is for a different protocol");
        }
        if internal_port != port {
            bail!("received mapping is for a local port that does not match the requested one");
        }
        if external_port == 0 {
            bail!("received 0 external port for mapping");
        }
        let Some(external_ip) = self.external_ip else {
            bail!("gateway did not report its external address");
        };
        let external_host = IpAddr::V4(external_ip);

        let nonce = self
            .table
            .get(host, port, protocol)
            .map(|m| m.nonce)
            .ok_or_else(|| anyhow!("no mapping row matches the response"))?;
        let expires_at = (now_unix_millis() / 1000 + u64::from(lifetime_seconds)) * 1000;
        self.table.update(
            port,
            protocol,
            &nonce,
            external_host,
            external_port,
            expires_at,
            lifetime_seconds,
        );

        Ok(PortMapping {
            protocol,
            internal_host: host,
            internal_port: port,
            external_host,
            external_port,
        })
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
            Pending::ExternalAddress { kind } => {
                if let ExternalKind::User { result_tx } = kind {
                    let _ = result_tx.send(Err(anyhow!("{reason}")));
                }
            }
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
                MapKind::Refresh => {
                    debug!(%host, port, "refresh failed, disarming: {reason}");
                    if let Some(row) = self.table.get_mut(host, port, protocol) {
                        row.auto_refresh = false;
                    }
                }
            },
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        for request in self.queue.drain_all() {
            match request.ctx {
                Pending::ExternalAddress { kind } => {
                    if let ExternalKind::User { result_tx } = kind {
                        let _ = result_tx.send(Err(anyhow!("{reason}")));
                    }
                }
                Pending::Unmap { result_tx, .. } => {
                    let _ = result_tx.send(Err(anyhow!("{reason}")));
                }
                Pending::Map { kind, .. } => {
                    if let MapKind::User { result_tx } = kind {
                        let _ = result_tx.send(Err(anyhow!("{reason}")));
                    }
                }
            }
        }
    }

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
    async fn shutdown(&mut self) {
        self.fail_pending("gateway is closed");
        for row in self.table.delete_all() {
            let request = protocol::Request::Mapping {
                protocol: row.protocol,
                internal_port: row.internal_port,
                external_port: 0,
                lifetime_seconds: 0,
            };
            if let Err(e) = self.socket.send_to(&request.encode(), self.gateway).await {
                debug!("failed to release mapping: {e}");
            }
        }
    }
}

/// The lease to request, defaulting to the RFC recommendation when the
/// caller's ttl does not convert to a usable number of seconds.
fn lifetime_seconds(opts: &MapOptions) -> u32 {
    match u32::try_from(opts.ttl.as_secs()) {
        Ok(0) => RECOMMENDED_LIFETIME_SECONDS,
        Ok(seconds) => seconds,
        Err(_) => u32::MAX,
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    use super::*;

    /// A request observed by the mock server.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        ExternalAddress,
        Map {
            opcode: u8,
            internal_port: u16,
            external_port: u16,
            lifetime: u32,
        },
    }

    /// Grants every request, announcing `external` as the public address.
    async fn spawn_mock(
        epochs: Vec<u32>,
        external: Ipv4Addr,
    ) -> (SocketAddr, UnboundedReceiver<Seen>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = unbounded_channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
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
                        let _ = tx.send(Seen::ExternalAddress);
                        let mut resp = vec![0u8, 128, 0, 0];
                        resp.extend_from_slice(&epoch.to_be_bytes());
                        resp.extend_from_slice(&external.octets());
                        socket.send_to(&resp, from).await.ok();
                    }
                    opcode @ (1 | 2) => {
                        let internal_port = u16::from_be_bytes(req[4..6].try_into().unwrap());
                        let external_port = u16::from_be_bytes(req[6..8].try_into().unwrap());
                        let lifetime = u32::from_be_bytes(req[8..12].try_into().unwrap());
                        let _ = tx.send(Seen::Map {
                            opcode,
                            internal_port,
                            external_port,
                            lifetime,
                        });
                        let granted_port = if external_port == 0 {
                            internal_port
                        } else {
                            external_port
                        };
                        let mut resp = vec![0u8, 128 + opcode, 0, 0];
                        resp.extend_from_slice(&epoch.to_be_bytes());
                        resp.extend_from_slice(&internal_port.to_be_bytes());
                        resp.extend_from_slice(&granted_port.to_be_bytes());
                        resp.extend_from_slice(&lifetime.to_be_bytes());
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
    async fn map_resolves_the_external_address_first() {
        let (addr, mut seen) = spawn_mock(vec![1000], Ipv4Addr::new(9, 9, 9, 9)).await;
        let gateway = NatPmpGateway::spawn_at(addr).await.unwrap();
        let host: IpAddr = "127.0.0.1".parse().unwrap();

        let mapping = gateway.map(5000, host, no_refresh()).await.unwrap();
        assert_eq!(mapping.external_host, "9.9.9.9".parse::<IpAddr>().unwrap());
        assert_eq!(mapping.external_port, 5000);
        assert_eq!(mapping.protocol, Protocol::Tcp);

        assert_eq!(recv_seen(&mut seen).await, Some(Seen::ExternalAddress));
        assert_eq!(
            recv_seen(&mut seen).await,
            Some(Seen::Map {
                opcode: 2,
                internal_port: 5000,
                external_port: 0,
                lifetime: 3600,
            })
        );
    }

    #[tokio::test]
    async fn external_ip_uses_the_dedicated_opcode() {
        let (addr, mut seen) = spawn_mock(vec![1000], Ipv4Addr::new(84, 84, 84, 84)).await;
        let gateway = NatPmpGateway::spawn_at(addr).await.unwrap();

        let ip = gateway.external_ip().await.unwrap();
        assert_eq!(ip, "84.84.84.84".parse::<IpAddr>().unwrap());
        assert_eq!(recv_seen(&mut seen).await, Some(Seen::ExternalAddress));
    }

    #[tokio::test]
    async fn unmap_zeroes_lifetime_and_external_port() {
        let (addr, mut seen) = spawn_mock(vec![1000], Ipv4Addr::new(9, 9, 9, 9)).await;
        let gateway = NatPmpGateway::spawn_at(addr).await.unwrap();
        let host: IpAddr = "127.0.0.1".parse().unwrap();

        let opts = MapOptions {
            protocol: Protocol::Udp,
            ..no_refresh()
        };
        gateway.map(5000, host, opts.clone()).await.unwrap();
        let _ = recv_seen(&mut seen).await; // external address
        let _ = recv_seen(&mut seen).await; // map

        gateway.unmap(5000, host, opts).await.unwrap();
        assert_eq!(
            recv_seen(&mut seen).await,
            Some(Seen::Map {
                opcode: 1,
                internal_port: 5000,
                external_port: 0,
                lifetime: 0,
            })
        );
        assert!(gateway.mappings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn epoch_regression_triggers_remap() {
        // responses: external address, map grant, then a reboot epoch
        let (addr, mut seen) = spawn_mock(vec![1000, 1000, 5], Ipv4Addr::new(9, 9, 9, 9)).await;
        let gateway = NatPmpGateway::spawn_at(addr).await.unwrap();
        let host: IpAddr = "127.0.0.1".parse().unwrap();

        gateway.map(5000, host, no_refresh()).await.unwrap();
        let _ = recv_seen(&mut seen).await; // external address
        let _ = recv_seen(&mut seen).await; // map

        // the reboot epoch arrives on this response and triggers the sweep
        gateway.external_ip().await.unwrap();
        let _ = recv_seen(&mut seen).await; // external address

        match recv_seen(&mut seen).await {
            Some(Seen::Map { internal_port, .. }) => assert_eq!(internal_port, 5000),
            other => panic!("expected a remap request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn map_rejects_ipv6_hosts() {
        let (addr, _seen) = spawn_mock(vec![1000], Ipv4Addr::new(9, 9, 9, 9)).await;
        let gateway = NatPmpGateway::spawn_at(addr).await.unwrap();
        let err = gateway
            .map(5000, "::1".parse().unwrap(), no_refresh())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("IPv4"));
    }
}
