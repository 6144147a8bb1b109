//! Device inventory built from DHCP traffic.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use crate::collab::{AlertEvent, AlertSink, Severity};
use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::events::{DhcpAckEvent, DhcpDiscoverEvent};
use crate::handler::{dispatch, Handler, Slot};
use crate::stats::{add, inc, DiscoveryStats, DiscoveryStatsSnapshot};
use crate::task::{spawn_periodic, Tasks};
use crate::vendor::{classify, lookup_vendor, DeviceType, UNKNOWN_VENDOR};

pub const OPTION_VENDOR_CLASS: &str = "vendor_class";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Identity in the inventory; never changes once assigned.
    pub key: String,
    pub mac_address: String,
    pub ip_address: Option<Ipv4Addr>,
    pub hostname: String,
    pub vendor: String,
    pub device_type: DeviceType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub lease_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dhcp_options: BTreeMap<String, String>,
}

impl DeviceInfo {
    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = self.last_seen.max(now);
    }

    fn matches(&self, needle: &str) -> bool {
        self.mac_address.to_lowercase().contains(needle)
            || self.hostname.to_lowercase().contains(needle)
            || self.vendor.to_lowercase().contains(needle)
            || self.device_type.as_str().to_lowercase().contains(needle)
            || self
                .ip_address
                .is_some_and(|ip| ip.to_string().contains(needle))
    }
}

/// How a caller identifies a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceQuery {
    Mac(String),
    Ip(Ipv4Addr),
}

impl FromStr for DeviceQuery {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.parse::<Ipv4Addr>() {
            Ok(ip) => DeviceQuery::Ip(ip),
            Err(_) => DeviceQuery::Mac(s.to_lowercase()),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryStatistics {
    #[serde(flatten)]
    pub stats: DiscoveryStatsSnapshot,
    pub database_size: usize,
}

pub struct DeviceDiscovery {
    config: DiscoveryConfig,
    devices: RwLock<HashMap<String, DeviceInfo>>,
    stats: DiscoveryStats,
    on_new: Slot<Handler<DeviceInfo>>,
    on_update: Slot<Handler<DeviceInfo>>,
    alerts: Slot<dyn AlertSink>,
    tasks: Tasks,
}

enum Change {
    New(DeviceInfo),
    Updated(DeviceInfo),
}

impl DeviceDiscovery {
    pub fn new(config: DiscoveryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            devices: RwLock::default(),
            stats: DiscoveryStats::default(),
            on_new: Slot::default(),
            on_update: Slot::default(),
            alerts: Slot::default(),
            tasks: Tasks::default(),
        })
    }

    pub fn set_new_device_handler(&self, handler: Arc<Handler<DeviceInfo>>) {
        self.on_new.set(handler);
    }

    pub fn set_update_handler(&self, handler: Arc<Handler<DeviceInfo>>) {
        self.on_update.set(handler);
    }

    pub fn set_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        self.alerts.set(sink);
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    pub fn statistics(&self) -> DiscoveryStatistics {
        DiscoveryStatistics {
            stats: self.stats.snapshot(),
            database_size: self.read().len(),
        }
    }

    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("device discovery disabled");
            return Ok(());
        }
        if self.tasks.is_running() {
            return Ok(());
        }

        let cancel = parent.child_token();
        let this = self.clone();
        let sweeper = spawn_periodic(cancel.clone(), self.config.cleanup_interval(), move || {
            this.expire_stale();
        });
        self.tasks.install(cancel, vec![sweeper]);
        tracing::info!(max_devices = self.config.max_devices, "device discovery started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.tasks.stop().await?;
        tracing::info!("device discovery stopped");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceInfo>> {
        match self.devices.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceInfo>> {
        match self.devices.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn key_for(&self, mac: &str, hostname: &str) -> Option<String> {
        if self.config.track_by_mac && !mac.is_empty() {
            Some(mac.to_lowercase())
        } else if self.config.track_by_hostname && !hostname.is_empty() {
            Some(hostname.to_lowercase())
        } else {
            None
        }
    }

    pub fn process_discover(&self, event: &DhcpDiscoverEvent) {
        self.process_discover_at(event, Utc::now());
    }

    pub(crate) fn process_discover_at(&self, event: &DhcpDiscoverEvent, now: DateTime<Utc>) {
        if !self.config.enabled {
            return;
        }
        let Some(key) = self.key_for(&event.mac_address, &event.hostname) else {
            return;
        };

        let change = {
            let mut devices = self.write();
            if let Some(device) = devices.get_mut(&key) {
                device.touch(now);
                if !event.hostname.is_empty() && device.hostname != event.hostname {
                    device.hostname = event.hostname.clone();
                }
                if !event.vendor_class.is_empty() {
                    device
                        .dhcp_options
                        .insert(OPTION_VENDOR_CLASS.to_string(), event.vendor_class.clone());
                }
                Change::Updated(device.clone())
            } else {
                if devices.len() >= self.config.max_devices {
                    inc(&self.stats.devices_rejected);
                    tracing::warn!(key = %key, limit = self.config.max_devices, "device inventory full");
                    return;
                }
                let device = self.new_device(key.clone(), event, now);
                devices.insert(key, device.clone());
                Change::New(device)
            }
        };
        self.announce(change);
    }

    fn new_device(&self, key: String, event: &DhcpDiscoverEvent, now: DateTime<Utc>) -> DeviceInfo {
        let mut dhcp_options = BTreeMap::new();
        if !event.vendor_class.is_empty() {
            dhcp_options.insert(OPTION_VENDOR_CLASS.to_string(), event.vendor_class.clone());
        }

        let mut vendor = String::new();
        if self.config.lookup_vendors {
            inc(&self.stats.vendor_lookups);
            vendor = match lookup_vendor(&event.mac_address) {
                Some(name) => {
                    inc(&self.stats.vendor_matches);
                    name.to_string()
                }
                None => UNKNOWN_VENDOR.to_string(),
            };
        }

        // Type is decided once here and not revisited on later sightings.
        let mut device_type = DeviceType::Unknown;
        if self.config.classify_devices {
            inc(&self.stats.classifications);
            device_type = classify(&vendor, &event.hostname, &event.vendor_class);
        }

        DeviceInfo {
            key,
            mac_address: event.mac_address.clone(),
            ip_address: event.requested_ip.filter(|_| self.config.track_by_ip),
            hostname: event.hostname.clone(),
            vendor,
            device_type,
            first_seen: now,
            last_seen: now,
            lease_expiry: None,
            dhcp_options,
        }
    }

    pub fn process_ack(&self, event: &DhcpAckEvent) {
        self.process_ack_at(event, Utc::now());
    }

    pub(crate) fn process_ack_at(&self, event: &DhcpAckEvent, now: DateTime<Utc>) {
        if !self.config.enabled || event.mac_address.is_empty() {
            return;
        }
        let key = event.mac_address.to_lowercase();

        let updated = {
            let mut devices = self.write();
            // An Ack for a device never seen in a Discover is not enough to
            // create one.
            let Some(device) = devices.get_mut(&key) else {
                tracing::trace!(mac = %event.mac_address, "ack for unknown device");
                return;
            };
            device.touch(now);
            if self.config.track_by_ip && !event.assigned_ip.is_unspecified() {
                device.ip_address = Some(event.assigned_ip);
            }
            if event.lease_time > 0 {
                device.lease_expiry = Some(now + ChronoDuration::seconds(i64::from(event.lease_time)));
            }
            tracing::debug!(
                mac = %device.mac_address,
                ip = ?device.ip_address,
                lease_expiry = ?device.lease_expiry,
                "device lease updated"
            );
            device.clone()
        };
        self.announce(Change::Updated(updated));
    }

    /// Record a DHCP server outside the trusted set as a device of type
    /// [`DeviceType::Rogue`], keyed `rogue:<ip>`.
    pub fn record_rogue_server(&self, server: Ipv4Addr) {
        self.record_rogue_server_at(server, Utc::now());
    }

    pub(crate) fn record_rogue_server_at(&self, server: Ipv4Addr, now: DateTime<Utc>) {
        let key = format!("rogue:{server}");
        let change = {
            let mut devices = self.write();
            if let Some(device) = devices.get_mut(&key) {
                device.touch(now);
                Change::Updated(device.clone())
            } else {
                if devices.len() >= self.config.max_devices {
                    inc(&self.stats.devices_rejected);
                    return;
                }
                let device = DeviceInfo {
                    key: key.clone(),
                    mac_address: String::new(),
                    ip_address: Some(server),
                    hostname: String::new(),
                    vendor: UNKNOWN_VENDOR.to_string(),
                    device_type: DeviceType::Rogue,
                    first_seen: now,
                    last_seen: now,
                    lease_expiry: None,
                    dhcp_options: BTreeMap::new(),
                };
                devices.insert(key, device.clone());
                Change::New(device)
            }
        };
        self.announce(change);
    }

    /// Handlers and alerts run after the inventory lock is released.
    fn announce(&self, change: Change) {
        match change {
            Change::New(device) => {
                inc(&self.stats.devices_discovered);
                tracing::info!(
                    mac = %device.mac_address,
                    hostname = %device.hostname,
                    vendor = %device.vendor,
                    device_type = %device.device_type,
                    "new device discovered"
                );
                dispatch(&self.on_new, "new_device", &device);
                if self.config.alert_on_new_device {
                    self.alert_new_device(&device);
                }
            }
            Change::Updated(device) => {
                inc(&self.stats.devices_updated);
                dispatch(&self.on_update, "device_update", &device);
            }
        }
    }

    fn alert_new_device(&self, device: &DeviceInfo) {
        let alert = AlertEvent::new(
            format!("new-device-{}", device.key),
            "New Device Discovered",
            Severity::Info,
            format!("New device discovered: {} ({})", device.mac_address, device.hostname),
        );
        match self.alerts.get() {
            Some(sink) => sink.trigger(alert),
            None => tracing::info!(id = %alert.id, "{}", alert.message),
        }
        inc(&self.stats.alerts_sent);
    }

    /// Remove devices idle for longer than the configured timeout.
    pub fn expire_stale(&self) -> usize {
        self.expire_stale_at(Utc::now())
    }

    pub(crate) fn expire_stale_at(&self, now: DateTime<Utc>) -> usize {
        let timeout =
            ChronoDuration::from_std(self.config.device_timeout()).unwrap_or(ChronoDuration::MAX);
        let mut devices = self.write();
        let before = devices.len();
        devices.retain(|_, device| now.signed_duration_since(device.last_seen) <= timeout);
        let removed = before - devices.len();
        if removed > 0 {
            add(&self.stats.devices_expired, removed as u64);
            tracing::debug!(count = removed, "expired idle devices");
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<DeviceInfo> {
        self.read().get(&key.to_lowercase()).cloned()
    }

    pub fn lookup(&self, query: &DeviceQuery) -> Option<DeviceInfo> {
        let devices = self.read();
        match query {
            DeviceQuery::Mac(mac) => {
                let mac = mac.to_lowercase();
                devices
                    .get(&mac)
                    .or_else(|| devices.values().find(|d| d.mac_address.to_lowercase() == mac))
                    .cloned()
            }
            DeviceQuery::Ip(ip) => devices.values().find(|d| d.ip_address == Some(*ip)).cloned(),
        }
    }

    /// Case-insensitive substring match over MAC, hostname, vendor, type and IP.
    pub fn search(&self, query: &str) -> Vec<DeviceInfo> {
        let needle = query.trim().to_lowercase();
        self.collect(|d| d.matches(&needle))
    }

    pub fn devices_by_type(&self, device_type: DeviceType) -> Vec<DeviceInfo> {
        self.collect(|d| d.device_type == device_type)
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.collect(|_| true)
    }

    fn collect(&self, keep: impl Fn(&DeviceInfo) -> bool) -> Vec<DeviceInfo> {
        let mut found: Vec<DeviceInfo> = self.read().values().filter(|d| keep(d)).cloned().collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        found
    }
}
