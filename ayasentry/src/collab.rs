//! Seams to the services the sensor reports into: device persistence,
//! query logging, alerting, the learning engine and IP blocking.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

use crate::discovery::DeviceInfo;
use crate::error::Result;
use crate::events::{DnsQueryEvent, DnsResponseEvent, Endpoints};

/// Persistence for the device inventory. Errors are logged by callers and
/// not retried.
pub trait DeviceStore: Send + Sync {
    fn store(&self, device: &DeviceInfo) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<DeviceInfo>>;
    fn list(&self) -> Result<Vec<DeviceInfo>>;
    /// Returns whether a device was removed.
    fn delete(&self, key: &str) -> Result<bool>;
}

/// Fire-and-forget DNS query/response log.
pub trait QueryLog: Send + Sync {
    fn log_query(&self, event: &DnsQueryEvent);
    fn log_response(&self, event: &DnsResponseEvent, blocked: bool, reason: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn trigger(&self, alert: AlertEvent);
}

/// Writes alerts to the log. Used when no other sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerts;

impl AlertSink for LogAlerts {
    fn trigger(&self, alert: AlertEvent) {
        match alert.severity {
            Severity::Info => tracing::info!(id = %alert.id, name = %alert.name, "{}", alert.message),
            Severity::Warning => tracing::warn!(id = %alert.id, name = %alert.name, "{}", alert.message),
            Severity::Critical => tracing::error!(id = %alert.id, name = %alert.name, "{}", alert.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Flattened observation handed to the learning engine. `payload` carries
/// the interesting application field (queried domain, TLS SNI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketInfo {
    pub timestamp: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub size: u16,
    pub payload: String,
}

impl PacketInfo {
    pub fn from_endpoints(endpoints: &Endpoints, protocol: Protocol, size: u16, payload: &str) -> Self {
        Self {
            timestamp: endpoints.timestamp,
            src_ip: IpAddr::V4(endpoints.src_ip),
            dst_ip: IpAddr::V4(endpoints.dst_ip),
            src_port: endpoints.src_port,
            dst_port: endpoints.dst_port,
            protocol,
            size,
            payload: payload.to_string(),
        }
    }
}

pub trait LearningService: Send + Sync {
    fn is_running(&self) -> bool;
    fn ingest_packet(&self, packet: PacketInfo);
    fn handle_dns_response(&self, domain: &str, ip: IpAddr, ttl: u32);
}

/// Enforcement callback: block traffic to/from `ip` for `reason`.
pub type IpBlocker = dyn Fn(IpAddr, &str) -> anyhow::Result<()> + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_endpoints;

    #[test]
    fn test_packet_info_from_endpoints() {
        let endpoints = test_endpoints();
        let packet = PacketInfo::from_endpoints(&endpoints, Protocol::Udp, 64, "example.com");
        assert_eq!(packet.src_ip, IpAddr::V4(endpoints.src_ip));
        assert_eq!(packet.dst_port, 53);
        assert_eq!(packet.payload, "example.com");
    }

    #[test]
    fn test_severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
