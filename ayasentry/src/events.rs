use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ayasentry_common::header;

use crate::wire;

pub const DNS_TYPE_A: u16 = 1;
pub const DNS_TYPE_AAAA: u16 = 28;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;

/// Fields common to every kernel record. `timestamp` is assigned in
/// userspace when the record is decoded; `kernel_ns` is the raw monotonic
/// stamp from the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoints {
    pub timestamp: DateTime<Utc>,
    pub kernel_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Endpoints {
    /// Read the common header. Callers check the record length first.
    pub fn decode(record: &[u8]) -> Self {
        Self {
            timestamp: Utc::now(),
            kernel_ns: wire::u64_le(record, header::TIMESTAMP),
            pid: wire::u32_le(record, header::PID),
            tid: wire::u32_le(record, header::TID),
            src_ip: wire::ipv4(record, header::SRC_IP),
            dst_ip: wire::ipv4(record, header::DST_IP),
            src_port: wire::u16_le(record, header::SRC_PORT),
            dst_port: wire::u16_le(record, header::DST_PORT),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsQueryEvent {
    #[serde(flatten)]
    pub endpoints: Endpoints,
    pub query_id: u16,
    pub query_type: u16,
    pub query_class: u16,
    pub domain: String,
    pub packet_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsAnswer {
    pub name: String,
    pub record_type: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: String,
}

impl DnsAnswer {
    /// The resolved address for A/AAAA records.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.record_type {
            DNS_TYPE_A | DNS_TYPE_AAAA => self.data.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsResponseEvent {
    #[serde(flatten)]
    pub endpoints: Endpoints,
    pub query_id: u16,
    pub query_type: u16,
    pub response_code: u8,
    pub answer_count: u16,
    pub domain: String,
    pub packet_size: u16,
    pub response_time: Duration,
    pub answers: Vec<DnsAnswer>,
}

#[derive(Debug, Clone)]
pub enum DnsEvent {
    Query(DnsQueryEvent),
    Response(DnsResponseEvent),
}

#[derive(Debug, Clone, Serialize)]
pub struct DhcpDiscoverEvent {
    #[serde(flatten)]
    pub endpoints: Endpoints,
    pub transaction_id: u32,
    pub mac_address: String,
    pub hostname: String,
    pub vendor_class: String,
    pub requested_ip: Option<Ipv4Addr>,
    pub packet_size: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct DhcpOfferEvent {
    #[serde(flatten)]
    pub endpoints: Endpoints,
    pub transaction_id: u32,
    pub mac_address: String,
    pub offered_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_time: u32,
    pub packet_size: u16,
    /// Set when the server failed the allow/deny check but was still
    /// dispatched because invalid packets are not being blocked.
    pub rogue: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DhcpRequestEvent {
    #[serde(flatten)]
    pub endpoints: Endpoints,
    pub transaction_id: u32,
    pub mac_address: String,
    pub requested_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub hostname: String,
    pub packet_size: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct DhcpAckEvent {
    #[serde(flatten)]
    pub endpoints: Endpoints,
    pub transaction_id: u32,
    pub mac_address: String,
    pub assigned_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_time: u32,
    pub renewal_time: u32,
    pub rebinding_time: u32,
    pub packet_size: u16,
    pub rogue: bool,
}

#[derive(Debug, Clone)]
pub enum DhcpEvent {
    Discover(DhcpDiscoverEvent),
    Offer(DhcpOfferEvent),
    Request(DhcpRequestEvent),
    Ack(DhcpAckEvent),
}

#[derive(Debug, Clone, Serialize)]
pub struct TlsHandshakeEvent {
    #[serde(flatten)]
    pub endpoints: Endpoints,
    pub version: u16,
    pub cipher_suite: u16,
    pub sni: String,
    pub ja3_hash: String,
    pub packet_size: u16,
}

pub fn tls_version_name(version: u16) -> &'static str {
    match version {
        0x0300 => "SSL 3.0",
        0x0301 => "TLS 1.0",
        0x0302 => "TLS 1.1",
        0x0303 => "TLS 1.2",
        0x0304 => "TLS 1.3",
        _ => "unknown",
    }
}

#[cfg(test)]
pub(crate) fn test_endpoints() -> Endpoints {
    Endpoints {
        timestamp: Utc::now(),
        kernel_ns: 0,
        pid: 0,
        tid: 0,
        src_ip: Ipv4Addr::new(192, 168, 1, 10),
        dst_ip: Ipv4Addr::new(192, 168, 1, 1),
        src_port: 53000,
        dst_port: 53,
    }
}
