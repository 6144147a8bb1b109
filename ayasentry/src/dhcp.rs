use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use ayasentry_common::dhcp as layout;

use crate::config::{Config, DhcpConfig};
use crate::error::{DecodeError, Result};
use crate::events::{
    DhcpAckEvent, DhcpDiscoverEvent, DhcpEvent, DhcpOfferEvent, DhcpRequestEvent, Endpoints,
};
use crate::handler::{dispatch, Handler, Slot};
use crate::source::{consume, ktime_now_ns, EventLoader, ProgramSpec, TrackingTable};
use crate::stats::{add, inc, DhcpStats, DhcpStatsSnapshot};
use crate::task::{spawn_periodic, Tasks};
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpKind {
    Discover,
    Offer,
    Request,
    Ack,
}

impl DhcpKind {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            layout::DISCOVER => Some(Self::Discover),
            layout::OFFER => Some(Self::Offer),
            layout::REQUEST => Some(Self::Request),
            layout::ACK => Some(Self::Ack),
            _ => None,
        }
    }

    /// Discover and Request come from clients and must carry a MAC.
    fn is_client(self) -> bool {
        matches!(self, Self::Discover | Self::Request)
    }
}

/// Every field of a `dhcp_events` record, before it is split by kind.
#[derive(Debug, Clone)]
pub struct DhcpRecord {
    pub kind: DhcpKind,
    pub endpoints: Endpoints,
    pub xid: u32,
    pub mac: [u8; 6],
    pub your_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_time: u32,
    pub renewal_time: u32,
    pub rebinding_time: u32,
    pub requested_ip: Ipv4Addr,
    pub hostname: String,
    pub vendor_class: String,
    pub packet_size: u16,
}

pub fn decode(record: &[u8]) -> std::result::Result<DhcpRecord, DecodeError> {
    if record.len() < layout::MIN_RECORD_LEN {
        return Err(DecodeError::TooShort {
            kind: "dhcp",
            len: record.len(),
            min: layout::MIN_RECORD_LEN,
        });
    }
    let raw_kind = wire::u8_at(record, layout::EVENT_TYPE);
    let kind = DhcpKind::from_wire(raw_kind).ok_or(DecodeError::UnknownEventType {
        kind: "dhcp",
        value: raw_kind,
    })?;

    let dns_servers = (0..layout::DNS_SERVER_COUNT)
        .map(|i| wire::ipv4(record, layout::DNS_SERVERS + i * 4))
        .filter(|ip| !ip.is_unspecified())
        .collect();

    Ok(DhcpRecord {
        kind,
        endpoints: Endpoints::decode(record),
        xid: wire::u32_le(record, layout::XID),
        mac: wire::mac(record, layout::MAC),
        your_ip: wire::ipv4(record, layout::YOUR_IP),
        server_ip: wire::ipv4(record, layout::SERVER_IP),
        subnet_mask: wire::ipv4(record, layout::SUBNET_MASK),
        router: wire::ipv4(record, layout::ROUTER),
        dns_servers,
        lease_time: wire::u32_le(record, layout::LEASE_TIME),
        renewal_time: wire::u32_le(record, layout::RENEWAL_TIME),
        rebinding_time: wire::u32_le(record, layout::REBINDING_TIME),
        requested_ip: wire::ipv4(record, layout::REQUESTED_IP),
        hostname: wire::prefixed_string(
            record,
            wire::u8_at(record, layout::HOSTNAME_LEN),
            layout::HOSTNAME,
            layout::HOSTNAME_CAP,
        ),
        vendor_class: wire::prefixed_string(
            record,
            wire::u8_at(record, layout::VENDOR_CLASS_LEN),
            layout::VENDOR_CLASS,
            layout::VENDOR_CLASS_CAP,
        ),
        packet_size: wire::u16_le(record, layout::PACKET_SIZE),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalid {
    PacketTooSmall(u16),
    ZeroMac,
}

/// Structural checks applied before dispatch.
pub fn validate(record: &DhcpRecord) -> std::result::Result<(), Invalid> {
    if record.packet_size < layout::MIN_PACKET_SIZE {
        return Err(Invalid::PacketTooSmall(record.packet_size));
    }
    if record.kind.is_client() && record.mac == [0u8; 6] {
        return Err(Invalid::ZeroMac);
    }
    Ok(())
}

/// Whether `server` may hand out leases. A non-empty allow list admits only
/// its members; the deny list wins over the allow list.
pub fn is_server_allowed(server: Ipv4Addr, allowed: &[Ipv4Addr], denied: &[Ipv4Addr]) -> bool {
    if !allowed.is_empty() && !allowed.contains(&server) {
        return false;
    }
    !denied.contains(&server)
}

#[derive(Debug, Clone, Serialize)]
pub struct RogueServer {
    pub server_ip: Ipv4Addr,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sightings: u64,
}

pub fn program_spec(config: &Config) -> ProgramSpec {
    config.program_spec(
        &config.dhcp.object,
        layout::PROGRAM,
        layout::MAP_EVENTS,
        ayasentry_common::DHCP_TRACKING_TABLES.to_vec(),
    )
}

pub struct DhcpFilter {
    config: DhcpConfig,
    spec: ProgramSpec,
    stats: DhcpStats,
    rogue_servers: DashMap<Ipv4Addr, RogueServer>,
    on_discover: Slot<Handler<DhcpDiscoverEvent>>,
    on_offer: Slot<Handler<DhcpOfferEvent>>,
    on_request: Slot<Handler<DhcpRequestEvent>>,
    on_ack: Slot<Handler<DhcpAckEvent>>,
    tasks: Tasks,
}

impl DhcpFilter {
    pub fn new(config: DhcpConfig, spec: ProgramSpec) -> Arc<Self> {
        Arc::new(Self {
            config,
            spec,
            stats: DhcpStats::default(),
            rogue_servers: DashMap::new(),
            on_discover: Slot::default(),
            on_offer: Slot::default(),
            on_request: Slot::default(),
            on_ack: Slot::default(),
            tasks: Tasks::default(),
        })
    }

    pub fn set_discover_handler(&self, handler: Arc<Handler<DhcpDiscoverEvent>>) {
        self.on_discover.set(handler);
    }

    pub fn set_offer_handler(&self, handler: Arc<Handler<DhcpOfferEvent>>) {
        self.on_offer.set(handler);
    }

    pub fn set_request_handler(&self, handler: Arc<Handler<DhcpRequestEvent>>) {
        self.on_request.set(handler);
    }

    pub fn set_ack_handler(&self, handler: Arc<Handler<DhcpAckEvent>>) {
        self.on_ack.set(handler);
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    pub fn statistics(&self) -> DhcpStatsSnapshot {
        self.stats.snapshot()
    }

    /// Servers that failed the allow/deny check, most recent first.
    pub fn rogue_servers(&self) -> Vec<RogueServer> {
        let mut servers: Vec<RogueServer> =
            self.rogue_servers.iter().map(|e| e.value().clone()).collect();
        servers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        servers
    }

    pub fn start(self: &Arc<Self>, loader: &dyn EventLoader, parent: &CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("DHCP filter disabled");
            return Ok(());
        }
        if self.tasks.is_running() {
            return Ok(());
        }

        let attachment = loader.attach(&self.spec)?;
        let cancel = parent.child_token();

        let this = self.clone();
        let mut handles = vec![tokio::spawn(consume(
            attachment.source,
            cancel.clone(),
            "dhcp",
            move |record| this.handle_record(record),
        ))];

        if !attachment.tables.is_empty() {
            let this = self.clone();
            let mut tables = attachment.tables;
            let timeout = self.config.transaction_timeout();
            handles.push(spawn_periodic(cancel.clone(), timeout / 2, move || {
                this.expire_transactions(&mut tables, ktime_now_ns());
            }));
        }

        self.tasks.install(cancel, handles);
        tracing::info!("DHCP filter started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.tasks.stop().await?;
        tracing::info!("DHCP filter stopped");
        Ok(())
    }

    /// Prune kernel transaction entries older than the configured timeout.
    pub fn expire_transactions(&self, tables: &mut [Box<dyn TrackingTable>], now_ns: u64) -> usize {
        let max_age = self.config.transaction_timeout().as_nanos() as u64;
        let mut total = 0;
        for table in tables.iter_mut() {
            match table.expire(now_ns, max_age) {
                Ok(n) => total += n,
                Err(e) => tracing::warn!(table = table.name(), error = %e, "transaction sweep failed"),
            }
        }
        if total > 0 {
            add(&self.stats.transactions_expired, total as u64);
            tracing::debug!(expired = total, "expired DHCP transactions");
        }
        total
    }

    pub fn handle_record(&self, record: &[u8]) {
        let record = match decode(record) {
            Ok(record) => record,
            Err(DecodeError::UnknownEventType { value, .. }) => {
                inc(&self.stats.unknown_event_types);
                tracing::trace!(event_type = value, "ignoring unknown DHCP event type");
                return;
            }
            Err(e) => {
                inc(&self.stats.parse_errors);
                tracing::warn!(error = %e, "dropping malformed DHCP record");
                return;
            }
        };

        if self.config.validate_packets {
            if let Err(reason) = validate(&record) {
                inc(&self.stats.invalid_packets_blocked);
                tracing::debug!(
                    kind = ?record.kind,
                    mac = %wire::format_mac(&record.mac),
                    ?reason,
                    "rejected invalid DHCP packet"
                );
                return;
            }
        }

        let rogue = matches!(record.kind, DhcpKind::Offer | DhcpKind::Ack)
            && self.config.detect_rogue_servers
            && !is_server_allowed(
                record.server_ip,
                &self.config.allowed_servers,
                &self.config.denied_servers,
            );
        if rogue {
            inc(&self.stats.rogue_servers_detected);
            self.record_rogue(record.server_ip);
            tracing::warn!(
                server = %record.server_ip,
                kind = ?record.kind,
                blocked = self.config.block_invalid,
                "rogue DHCP server detected"
            );
            if self.config.block_invalid {
                return;
            }
        }

        self.deliver(record, rogue);
    }

    fn record_rogue(&self, server_ip: Ipv4Addr) {
        let now = Utc::now();
        self.rogue_servers
            .entry(server_ip)
            .and_modify(|s| {
                s.last_seen = now;
                s.sightings += 1;
            })
            .or_insert_with(|| RogueServer {
                server_ip,
                first_seen: now,
                last_seen: now,
                sightings: 1,
            });
    }

    fn deliver(&self, record: DhcpRecord, rogue: bool) {
        let mac_address = wire::format_mac(&record.mac);
        match into_event(record, mac_address, rogue) {
            DhcpEvent::Discover(event) => {
                inc(&self.stats.discovers);
                dispatch(&self.on_discover, "dhcp_discover", &event);
            }
            DhcpEvent::Offer(event) => {
                inc(&self.stats.offers);
                dispatch(&self.on_offer, "dhcp_offer", &event);
            }
            DhcpEvent::Request(event) => {
                inc(&self.stats.requests);
                dispatch(&self.on_request, "dhcp_request", &event);
            }
            DhcpEvent::Ack(event) => {
                inc(&self.stats.acks);
                dispatch(&self.on_ack, "dhcp_ack", &event);
            }
        }
    }
}

fn into_event(r: DhcpRecord, mac_address: String, rogue: bool) -> DhcpEvent {
    match r.kind {
        DhcpKind::Discover => DhcpEvent::Discover(DhcpDiscoverEvent {
            endpoints: r.endpoints,
            transaction_id: r.xid,
            mac_address,
            hostname: r.hostname,
            vendor_class: r.vendor_class,
            requested_ip: (!r.requested_ip.is_unspecified()).then_some(r.requested_ip),
            packet_size: r.packet_size,
        }),
        DhcpKind::Offer => DhcpEvent::Offer(DhcpOfferEvent {
            endpoints: r.endpoints,
            transaction_id: r.xid,
            mac_address,
            offered_ip: r.your_ip,
            server_ip: r.server_ip,
            subnet_mask: r.subnet_mask,
            router: r.router,
            dns_servers: r.dns_servers,
            lease_time: r.lease_time,
            packet_size: r.packet_size,
            rogue,
        }),
        DhcpKind::Request => DhcpEvent::Request(DhcpRequestEvent {
            endpoints: r.endpoints,
            transaction_id: r.xid,
            mac_address,
            requested_ip: r.requested_ip,
            server_ip: r.server_ip,
            hostname: r.hostname,
            packet_size: r.packet_size,
        }),
        DhcpKind::Ack => DhcpEvent::Ack(DhcpAckEvent {
            endpoints: r.endpoints,
            transaction_id: r.xid,
            mac_address,
            assigned_ip: r.your_ip,
            server_ip: r.server_ip,
            subnet_mask: r.subnet_mask,
            router: r.router,
            dns_servers: r.dns_servers,
            lease_time: r.lease_time,
            renewal_time: r.renewal_time,
            rebinding_time: r.rebinding_time,
            packet_size: r.packet_size,
            rogue,
        }),
    }
}
