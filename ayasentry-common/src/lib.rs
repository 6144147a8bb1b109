#![no_std]

//! Binary contract between the kernel socket filters and userspace.
//!
//! Records arrive through ring buffers as packed byte strings. Integers are
//! little endian; IPv4 addresses are the raw network-order bytes copied out
//! of the packet. Userspace decodes them field by field at the offsets
//! below instead of casting the buffer, so a kernel-side layout change has
//! to bump [`LAYOUT_VERSION`] and the constants together.

/// Revision of the record layouts described in this crate.
pub const LAYOUT_VERSION: u32 = 1;

/// Fields shared by every record type.
pub mod header {
    pub const TIMESTAMP: usize = 0;
    pub const PID: usize = 8;
    pub const TID: usize = 12;
    pub const SRC_IP: usize = 16;
    pub const DST_IP: usize = 20;
    pub const SRC_PORT: usize = 24;
    pub const DST_PORT: usize = 26;
}

/// `dns_events` ring buffer records.
pub mod dns {
    pub const QUERY_ID: usize = 28;
    pub const IS_RESPONSE: usize = 30;
    /// Unaligned: the kernel struct is packed.
    pub const QUERY_TYPE: usize = 31;
    pub const QUERY_CLASS: usize = 33;
    pub const RESPONSE_CODE: usize = 35;
    pub const ANSWER_COUNT: usize = 36;
    pub const DOMAIN: usize = 38;
    pub const DOMAIN_LEN: usize = 253;
    pub const PACKET_SIZE: usize = DOMAIN + DOMAIN_LEN;
    pub const RESPONSE_TIME_NS: usize = PACKET_SIZE + 2;

    /// Everything up to the start of the domain buffer must be present.
    pub const MIN_RECORD_LEN: usize = DOMAIN;
    pub const RECORD_LEN: usize = RESPONSE_TIME_NS + 8;

    pub const MAP_EVENTS: &str = "dns_events";
    pub const MAP_QUERIES: &str = "dns_queries";
    pub const MAP_RESPONSES: &str = "dns_responses";
    pub const PROGRAM: &str = "dns_socket_filter";
}

/// `dhcp_events` ring buffer records.
pub mod dhcp {
    pub const EVENT_TYPE: usize = 28;
    pub const XID: usize = 32;
    pub const MAC: usize = 36;
    pub const MAC_LEN: usize = 6;
    pub const YOUR_IP: usize = 44;
    pub const SERVER_IP: usize = 48;
    pub const SUBNET_MASK: usize = 52;
    pub const ROUTER: usize = 56;
    pub const DNS_SERVERS: usize = 60;
    pub const DNS_SERVER_COUNT: usize = 4;
    pub const LEASE_TIME: usize = 76;
    pub const RENEWAL_TIME: usize = 80;
    pub const REBINDING_TIME: usize = 84;
    pub const REQUESTED_IP: usize = 88;
    pub const HOSTNAME_LEN: usize = 92;
    pub const HOSTNAME: usize = 93;
    pub const HOSTNAME_CAP: usize = 64;
    pub const VENDOR_CLASS_LEN: usize = 157;
    pub const VENDOR_CLASS: usize = 158;
    pub const VENDOR_CLASS_CAP: usize = 64;
    pub const PACKET_SIZE: usize = 222;

    pub const MIN_RECORD_LEN: usize = 224;

    pub const DISCOVER: u8 = 1;
    pub const OFFER: u8 = 2;
    pub const REQUEST: u8 = 3;
    pub const ACK: u8 = 4;

    /// Smallest BOOTP/DHCP payload a well-formed packet can carry.
    pub const MIN_PACKET_SIZE: u16 = 240;

    pub const MAP_EVENTS: &str = "dhcp_events";
    pub const PROGRAM: &str = "dhcp_socket_filter";
}

/// `tls_events` ring buffer records.
pub mod tls {
    pub const VERSION: usize = 28;
    pub const CIPHER_SUITE: usize = 30;
    pub const SNI: usize = 32;
    pub const SNI_LEN: usize = 64;
    pub const JA3: usize = 96;
    pub const JA3_WORDS: usize = 4;
    pub const PACKET_SIZE: usize = 112;

    pub const MIN_RECORD_LEN: usize = 114;

    pub const MAP_EVENTS: &str = "tls_events";
    pub const MAP_HANDSHAKES: &str = "tls_handshakes";
    pub const PROGRAM: &str = "tls_socket_filter";
}

/// A kernel-side DHCP transaction table: name, value size, and where the
/// value's `timestamp` (kernel monotonic ns) lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingTable {
    pub name: &'static str,
    pub value_len: usize,
    pub timestamp_offset: usize,
}

pub const DHCP_DISCOVERS: TrackingTable = TrackingTable {
    name: "dhcp_discovers",
    value_len: 152,
    timestamp_offset: 144,
};

pub const DHCP_OFFERS: TrackingTable = TrackingTable {
    name: "dhcp_offers",
    value_len: 48,
    timestamp_offset: 40,
};

pub const DHCP_REQUESTS: TrackingTable = TrackingTable {
    name: "dhcp_requests",
    value_len: 96,
    timestamp_offset: 88,
};

pub const DHCP_ACKS: TrackingTable = TrackingTable {
    name: "dhcp_acks",
    value_len: 56,
    timestamp_offset: 48,
};

pub const DHCP_TRACKING_TABLES: [TrackingTable; 4] =
    [DHCP_DISCOVERS, DHCP_OFFERS, DHCP_REQUESTS, DHCP_ACKS];

/// Key of the DHCP transaction tables.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct DhcpKey {
    pub xid: u32,
    pub mac: [u8; 6],
    /// Padding to maintain alignment.
    pub _pad: u16,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for DhcpKey {}
