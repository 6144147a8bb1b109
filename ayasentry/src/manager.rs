//! Owns every sub-component, starts and stops them in order, and routes
//! their events to each other and to the external collaborators.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::collab::{AlertEvent, AlertSink, IpBlocker, LearningService, LogAlerts, PacketInfo, Protocol, Severity};
use crate::collab::{DeviceStore, QueryLog};
use crate::config::Config;
use crate::dhcp::{self, DhcpFilter, RogueServer};
use crate::discovery::{DeviceDiscovery, DeviceInfo, DiscoveryStatistics};
use crate::dns::{self, DnsFilter};
use crate::error::{Error, Result};
use crate::events::{
    Endpoints,
    DhcpAckEvent, DhcpDiscoverEvent, DhcpOfferEvent, DhcpRequestEvent, DnsQueryEvent,
    DnsResponseEvent, TlsHandshakeEvent, DNS_TYPE_A, DNS_TYPE_AAAA,
};
use crate::handler::{Handler, Slot};
use crate::response::{self, ResponseFilter, ResponseFilterStatus, Verdict};
use crate::source::EventLoader;
use crate::stats::{DhcpStatsSnapshot, DnsStatsSnapshot, QueryLogStatsSnapshot, TlsStatsSnapshot};
use crate::storage::{QueryLogger, Storage};
use crate::task::{spawn_periodic, Tasks};
use crate::tls::{self, TlsFilter};
use crate::vendor::DeviceType;

const RETENTION_SWEEP: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatistics {
    pub state: ManagerState,
    pub last_update: DateTime<Utc>,
    pub dns: Option<DnsStatsSnapshot>,
    pub dhcp: Option<DhcpStatsSnapshot>,
    pub rogue_servers: Vec<RogueServer>,
    pub tls: Option<TlsStatsSnapshot>,
    pub response_filter: Option<ResponseFilterStatus>,
    pub discovery: Option<DiscoveryStatistics>,
    pub query_log: Option<QueryLogStatsSnapshot>,
}

#[derive(Clone, Default)]
struct Parts {
    storage: Option<Storage>,
    query_log: Option<Arc<QueryLogger>>,
    response: Option<Arc<ResponseFilter>>,
    dhcp: Option<Arc<DhcpFilter>>,
    dns: Option<Arc<DnsFilter>>,
    tls: Option<Arc<TlsFilter>>,
    discovery: Option<Arc<DeviceDiscovery>>,
}

struct Shared {
    config: Config,
    loader: Arc<dyn EventLoader>,
    state: Mutex<ManagerState>,
    cancel: Mutex<Option<CancellationToken>>,
    parts: RwLock<Parts>,
    learning: Slot<dyn LearningService>,
    blocker: Slot<IpBlocker>,
    alerts: Slot<dyn AlertSink>,
    db_tasks: Tasks,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Wrap a `Shared` method as an event handler without keeping the
/// manager alive from inside its own components.
fn bind<E: 'static>(weak: &Weak<Shared>, f: fn(&Shared, &E) -> anyhow::Result<()>) -> Arc<Handler<E>> {
    let weak = weak.clone();
    Arc::new(move |event: &E| -> anyhow::Result<()> {
        match weak.upgrade() {
            Some(shared) => f(&shared, event),
            None => Ok(()),
        }
    })
}

pub struct Manager {
    shared: Arc<Shared>,
}

impl Manager {
    pub fn new(config: Config, loader: Arc<dyn EventLoader>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                loader,
                state: Mutex::new(ManagerState::Stopped),
                cancel: Mutex::new(None),
                parts: RwLock::default(),
                learning: Slot::default(),
                blocker: Slot::default(),
                alerts: Slot::default(),
                db_tasks: Tasks::default(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn state(&self) -> ManagerState {
        *lock(&self.shared.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    pub fn set_learning_service(&self, service: Arc<dyn LearningService>) {
        self.shared.learning.set(service);
    }

    pub fn set_block_handler(&self, handler: Arc<IpBlocker>) {
        self.shared.blocker.set(handler);
    }

    pub fn set_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        if let Some(discovery) = self.discovery() {
            discovery.set_alert_sink(sink.clone());
        }
        self.shared.alerts.set(sink);
    }

    /// Hand `ip` to block enforcement. Without a registered handler this
    /// only logs.
    pub fn block_ip(&self, ip: IpAddr, reason: &str) -> anyhow::Result<()> {
        self.shared.block_ip(ip, reason)
    }

    pub fn storage(&self) -> Option<Storage> {
        self.shared.part(|p| p.storage.clone())
    }

    pub fn query_logger(&self) -> Option<Arc<QueryLogger>> {
        self.shared.part(|p| p.query_log.clone())
    }

    pub fn response_filter(&self) -> Option<Arc<ResponseFilter>> {
        self.shared.part(|p| p.response.clone())
    }

    pub fn dhcp_filter(&self) -> Option<Arc<DhcpFilter>> {
        self.shared.part(|p| p.dhcp.clone())
    }

    pub fn dns_filter(&self) -> Option<Arc<DnsFilter>> {
        self.shared.part(|p| p.dns.clone())
    }

    pub fn tls_filter(&self) -> Option<Arc<TlsFilter>> {
        self.shared.part(|p| p.tls.clone())
    }

    pub fn discovery(&self) -> Option<Arc<DeviceDiscovery>> {
        self.shared.part(|p| p.discovery.clone())
    }

    pub fn statistics(&self) -> ManagerStatistics {
        let parts = self.shared.parts();
        ManagerStatistics {
            state: self.state(),
            last_update: Utc::now(),
            dns: parts.dns.as_ref().map(|f| f.statistics()),
            dhcp: parts.dhcp.as_ref().map(|f| f.statistics()),
            rogue_servers: parts.dhcp.as_ref().map(|f| f.rogue_servers()).unwrap_or_default(),
            tls: parts.tls.as_ref().map(|f| f.statistics()),
            response_filter: parts.response.as_ref().map(|f| f.status()),
            discovery: parts.discovery.as_ref().map(|d| d.statistics()),
            query_log: parts.query_log.as_ref().map(|l| l.statistics()),
        }
    }

    /// Start every enabled component: database, response filter, DHCP,
    /// DNS, TLS, then discovery. On the first failure nothing after it is
    /// started, the components already up are stopped again and the error
    /// is returned with the manager back in `Stopped`.
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
        let shared = &self.shared;
        if !shared.config.enabled {
            tracing::info!("socket filter manager disabled");
            return Ok(());
        }
        {
            let mut state = lock(&shared.state);
            if *state != ManagerState::Stopped {
                return Ok(());
            }
            *state = ManagerState::Starting;
        }

        let cancel = parent.child_token();
        *lock(&shared.cancel) = Some(cancel.clone());
        if let Err(e) = self.start_components(&cancel).await {
            tracing::error!(error = %e, "socket filter manager failed to start");
            self.teardown().await;
            *lock(&shared.state) = ManagerState::Stopped;
            return Err(e);
        }
        *lock(&shared.state) = ManagerState::Running;
        tracing::info!("socket filter manager started");
        Ok(())
    }

    async fn start_components(&self, cancel: &CancellationToken) -> Result<()> {
        let shared = &self.shared;
        let config = &shared.config;
        let weak = Arc::downgrade(shared);

        // ── Database ───────────────────────────────────────────
        let storage = Storage::open(&config.db_path).map_err(|e| Error::start("database", e))?;
        let db_cancel = cancel.child_token();
        let mut db_handles = Vec::new();
        if config.query_log.enabled {
            let (logger, rx) = QueryLogger::new(storage.clone(), config.query_log.clone());
            db_handles.push(tokio::spawn(logger.clone().run_writer(rx, db_cancel.clone())));
            if config.query_log.retention_seconds.is_some() {
                let pruner = logger.clone();
                db_handles.push(spawn_periodic(db_cancel.clone(), RETENTION_SWEEP, move || {
                    pruner.prune();
                }));
            }
            shared.update(|p| p.query_log = Some(logger));
        }
        shared.db_tasks.install(db_cancel, db_handles);
        shared.update(|p| p.storage = Some(storage));

        // ── Response filter ────────────────────────────────────
        if config.response_filter.enabled {
            let filter = ResponseFilter::new(config.response_filter.clone())
                .map_err(|e| Error::start("response filter", e))?;
            let w = weak.clone();
            filter.set_block_handler(Arc::new(
                move |event: &DnsResponseEvent, reason: &str| -> anyhow::Result<()> {
                    if let Some(shared) = w.upgrade() {
                        shared.on_blocked_response(event, reason);
                    }
                    Ok(())
                },
            ));
            filter
                .start(cancel)
                .await
                .map_err(|e| Error::start("response filter", e))?;
            shared.update(|p| p.response = Some(filter));
        }

        // ── DHCP ───────────────────────────────────────────────
        if config.dhcp.enabled {
            let filter = DhcpFilter::new(config.dhcp.clone(), dhcp::program_spec(config));
            filter.set_discover_handler(bind(&weak, Shared::on_dhcp_discover));
            filter.set_offer_handler(bind(&weak, Shared::on_dhcp_offer));
            filter.set_request_handler(bind(&weak, Shared::on_dhcp_request));
            filter.set_ack_handler(bind(&weak, Shared::on_dhcp_ack));
            filter
                .start(shared.loader.as_ref(), cancel)
                .map_err(|e| Error::start("dhcp", e))?;
            shared.update(|p| p.dhcp = Some(filter));
        }

        // ── DNS ────────────────────────────────────────────────
        if config.dns.enabled {
            let filter = DnsFilter::new(config.dns.clone(), dns::program_spec(config));
            filter.set_query_handler(bind(&weak, Shared::on_dns_query));
            filter.set_response_handler(bind(&weak, Shared::on_dns_response));
            filter
                .start(shared.loader.as_ref(), cancel)
                .map_err(|e| Error::start("dns", e))?;
            shared.update(|p| p.dns = Some(filter));
        }

        // ── TLS ────────────────────────────────────────────────
        if config.tls.enabled {
            let filter = TlsFilter::new(config.tls.clone(), tls::program_spec(config));
            filter.set_handshake_handler(bind(&weak, Shared::on_tls_handshake));
            filter
                .start(shared.loader.as_ref(), cancel)
                .map_err(|e| Error::start("tls", e))?;
            shared.update(|p| p.tls = Some(filter));
        }

        // ── Device discovery ───────────────────────────────────
        if config.discovery.enabled {
            let discovery = DeviceDiscovery::new(config.discovery.clone());
            if let Some(sink) = shared.alerts.get() {
                discovery.set_alert_sink(sink);
            }
            discovery.set_new_device_handler(bind(&weak, Shared::on_new_device));
            discovery.set_update_handler(bind(&weak, Shared::on_device_update));
            discovery.start(cancel).map_err(|e| Error::start("discovery", e))?;
            shared.update(|p| p.discovery = Some(discovery));
        }

        Ok(())
    }

    /// Stop everything in reverse start order. A component that fails to
    /// stop is logged and the rest are still stopped.
    pub async fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = lock(&shared.state);
            if *state != ManagerState::Running {
                return Ok(());
            }
            *state = ManagerState::Stopping;
        }

        self.teardown().await;
        *lock(&shared.state) = ManagerState::Stopped;
        tracing::info!("socket filter manager stopped");
        Ok(())
    }

    /// Cancel the manager token and stop every started component in
    /// reverse start order.
    async fn teardown(&self) {
        let shared = &self.shared;
        if let Some(cancel) = lock(&shared.cancel).take() {
            cancel.cancel();
        }
        let parts = {
            let mut guard = match shared.parts.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };

        if let Some(discovery) = &parts.discovery {
            log_stop("discovery", discovery.stop().await);
        }
        if let Some(filter) = &parts.tls {
            log_stop("tls", filter.stop().await);
        }
        if let Some(filter) = &parts.dns {
            log_stop("dns", filter.stop().await);
        }
        if let Some(filter) = &parts.dhcp {
            log_stop("dhcp", filter.stop().await);
        }
        if let Some(filter) = &parts.response {
            log_stop("response filter", filter.stop().await);
        }
        log_stop("database", shared.db_tasks.stop().await);
    }
}

fn log_stop(component: &str, result: Result<()>) {
    if let Err(e) = result {
        tracing::warn!(component, error = %e, "component did not stop cleanly");
    }
}

impl Shared {
    fn parts(&self) -> Parts {
        match self.parts.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn part<T>(&self, pick: impl FnOnce(&Parts) -> Option<T>) -> Option<T> {
        match self.parts.read() {
            Ok(guard) => pick(&guard),
            Err(poisoned) => pick(&poisoned.into_inner()),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut Parts)) {
        match self.parts.write() {
            Ok(mut guard) => apply(&mut guard),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }

    /// The learning service, if forwarding is on and the service is live.
    fn learning(&self) -> Option<Arc<dyn LearningService>> {
        if !self.config.forward_to_learning {
            return None;
        }
        self.learning.get().filter(|service| service.is_running())
    }

    fn block_ip(&self, ip: IpAddr, reason: &str) -> anyhow::Result<()> {
        match self.blocker.get() {
            Some(handler) => handler(ip, reason),
            None => {
                tracing::info!(%ip, reason, "blocking IP (no handler)");
                Ok(())
            }
        }
    }

    fn alert(&self, alert: AlertEvent) {
        match self.alerts.get() {
            Some(sink) => sink.trigger(alert),
            None => LogAlerts.trigger(alert),
        }
    }

    fn on_dns_query(&self, event: &DnsQueryEvent) -> anyhow::Result<()> {
        if let Some(log) = self.part(|p| p.query_log.clone()) {
            log.log_query(event);
        }
        if let Some(learning) = self.learning() {
            learning.ingest_packet(PacketInfo::from_endpoints(
                &event.endpoints,
                Protocol::Udp,
                event.packet_size,
                &event.domain,
            ));
        }
        Ok(())
    }

    fn on_dns_response(&self, event: &DnsResponseEvent) -> anyhow::Result<()> {
        let verdict = match self.part(|p| p.response.clone()) {
            Some(filter) => filter.filter(event),
            None => Verdict {
                allowed: true,
                reason: response::REASON_DISABLED.to_string(),
            },
        };

        if !verdict.allowed && self.config.enforce_blocks {
            let reason = format!("DNS blocklist: {} ({})", event.domain, verdict.reason);
            let ips = event
                .answers
                .iter()
                .filter(|a| a.record_type == DNS_TYPE_A || a.record_type == DNS_TYPE_AAAA)
                .filter_map(|a| a.ip());
            for ip in ips {
                if let Err(e) = self.block_ip(ip, &reason) {
                    tracing::warn!(%ip, error = %e, "block handler failed");
                }
            }
        }

        if let Some(log) = self.part(|p| p.query_log.clone()) {
            log.log_response(event, !verdict.allowed, &verdict.reason);
        }

        if let Some(learning) = self.learning() {
            for answer in event.answers.iter().filter(|a| a.record_type == DNS_TYPE_A) {
                if let Some(ip) = answer.ip() {
                    learning.handle_dns_response(&event.domain, ip, answer.ttl);
                }
            }
        }
        Ok(())
    }

    fn on_blocked_response(&self, event: &DnsResponseEvent, reason: &str) {
        tracing::info!(
            domain = %event.domain,
            response_code = event.response_code,
            reason,
            "DNS response blocked"
        );
        self.alert(AlertEvent::new(
            format!("dns-blocked-{}", event.domain),
            "DNS Domain Blocked",
            Severity::Warning,
            format!("DNS response for {} was blocked: {}", event.domain, reason),
        ));
    }

    fn ingest_udp(&self, endpoints: &Endpoints, size: u16, payload: &str) {
        if let Some(learning) = self.learning() {
            learning.ingest_packet(PacketInfo::from_endpoints(endpoints, Protocol::Udp, size, payload));
        }
    }

    fn on_dhcp_discover(&self, event: &DhcpDiscoverEvent) -> anyhow::Result<()> {
        tracing::debug!(
            mac = %event.mac_address,
            hostname = %event.hostname,
            vendor_class = %event.vendor_class,
            "DHCP discover observed"
        );
        if let Some(discovery) = self.part(|p| p.discovery.clone()) {
            discovery.process_discover(event);
        }
        self.ingest_udp(&event.endpoints, event.packet_size, &event.hostname);
        Ok(())
    }

    fn on_dhcp_offer(&self, event: &DhcpOfferEvent) -> anyhow::Result<()> {
        if event.rogue {
            self.on_rogue_server(event.server_ip);
        }
        self.ingest_udp(&event.endpoints, event.packet_size, "");
        Ok(())
    }

    fn on_dhcp_request(&self, event: &DhcpRequestEvent) -> anyhow::Result<()> {
        self.ingest_udp(&event.endpoints, event.packet_size, &event.hostname);
        Ok(())
    }

    fn on_dhcp_ack(&self, event: &DhcpAckEvent) -> anyhow::Result<()> {
        if let Some(discovery) = self.part(|p| p.discovery.clone()) {
            discovery.process_ack(event);
        }
        if event.rogue {
            self.on_rogue_server(event.server_ip);
        }
        self.ingest_udp(&event.endpoints, event.packet_size, "");
        Ok(())
    }

    fn on_rogue_server(&self, server: Ipv4Addr) {
        if self.config.dhcp.alert_on_rogue_server {
            self.alert(AlertEvent::new(
                format!("rogue-dhcp-{server}"),
                "Rogue DHCP Server",
                Severity::Critical,
                format!("Untrusted DHCP server {server} answered on the network"),
            ));
        }
        if let Some(discovery) = self.part(|p| p.discovery.clone()) {
            discovery.record_rogue_server(server);
        }
    }

    fn on_tls_handshake(&self, event: &TlsHandshakeEvent) -> anyhow::Result<()> {
        if let Some(learning) = self.learning() {
            learning.ingest_packet(PacketInfo::from_endpoints(
                &event.endpoints,
                Protocol::Tcp,
                event.packet_size,
                &event.sni,
            ));
        }
        Ok(())
    }

    fn persist(&self, device: &DeviceInfo) {
        if let Some(storage) = self.part(|p| p.storage.clone()) {
            if let Err(e) = storage.store(device) {
                tracing::warn!(key = %device.key, error = %e, "failed to store device");
            }
        }
    }

    fn on_new_device(&self, device: &DeviceInfo) -> anyhow::Result<()> {
        self.persist(device);
        if device.device_type == DeviceType::Rogue && self.config.enforce_blocks {
            if let Some(ip) = device.ip_address {
                self.block_ip(IpAddr::V4(ip), "Rogue DHCP server detected")?;
            }
        }
        Ok(())
    }

    fn on_device_update(&self, device: &DeviceInfo) -> anyhow::Result<()> {
        self.persist(device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::tests::{dhcp_record, MAC};
    use crate::dns::tests::dns_record;
    use crate::domains::{DomainList, RuleAction};
    use crate::events::{test_endpoints, DnsAnswer, RCODE_NOERROR};
    use crate::response::ListKind;
    use crate::source::testing::MockLoader;
    use ayasentry_common::{dhcp as dhcp_layout, dns as dns_layout, tls as tls_layout};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_config() -> Config {
        Config {
            db_path: ":memory:".to_string(),
            ..Config::default()
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[derive(Default)]
    struct Recorder {
        running: AtomicBool,
        packets: Mutex<Vec<PacketInfo>>,
        resolved: Mutex<Vec<(String, IpAddr, u32)>>,
    }

    impl LearningService for Recorder {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn ingest_packet(&self, packet: PacketInfo) {
            self.packets.lock().unwrap().push(packet);
        }

        fn handle_dns_response(&self, domain: &str, ip: IpAddr, ttl: u32) {
            self.resolved.lock().unwrap().push((domain.to_string(), ip, ttl));
        }
    }

    #[derive(Default)]
    struct Alerts(Mutex<Vec<AlertEvent>>);

    impl AlertSink for Alerts {
        fn trigger(&self, alert: AlertEvent) {
            self.0.lock().unwrap().push(alert);
        }
    }

    type Blocked = Arc<Mutex<Vec<(IpAddr, String)>>>;

    fn record_blocks(manager: &Manager) -> Blocked {
        let blocked: Blocked = Arc::default();
        let b = blocked.clone();
        manager.set_block_handler(Arc::new(move |ip: IpAddr, reason: &str| -> anyhow::Result<()> {
            b.lock().unwrap().push((ip, reason.to_string()));
            Ok(())
        }));
        blocked
    }

    fn blocked_response(domain: &str) -> DnsResponseEvent {
        let answer = |record_type, data: &str| DnsAnswer {
            name: domain.to_string(),
            record_type,
            class: 1,
            ttl: 300,
            data: data.to_string(),
        };
        DnsResponseEvent {
            endpoints: test_endpoints(),
            query_id: 9,
            query_type: DNS_TYPE_A,
            response_code: RCODE_NOERROR,
            answer_count: 2,
            domain: domain.to_string(),
            packet_size: 120,
            response_time: Duration::from_millis(4),
            answers: vec![answer(DNS_TYPE_A, "203.0.113.7"), answer(DNS_TYPE_AAAA, "2001:db8::7")],
        }
    }

    #[tokio::test]
    async fn test_start_attaches_in_order_and_stop_is_idempotent() {
        let loader = MockLoader::new();
        let manager = Manager::new(test_config(), loader.clone());
        let parent = CancellationToken::new();

        manager.start(&parent).await.unwrap();
        assert_eq!(manager.state(), ManagerState::Running);
        assert_eq!(
            loader.attached(),
            vec![dhcp_layout::PROGRAM, dns_layout::PROGRAM, tls_layout::PROGRAM]
        );
        assert!(manager.discovery().unwrap().is_running());
        assert!(manager.storage().is_some());

        // Second start is a no-op.
        manager.start(&parent).await.unwrap();
        assert_eq!(loader.attached().len(), 3);

        manager.stop().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(manager.discovery().is_none());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_manager_never_starts() {
        let loader = MockLoader::new();
        let manager = Manager::new(
            Config {
                enabled: false,
                ..test_config()
            },
            loader.clone(),
        );
        manager.start(&CancellationToken::new()).await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(loader.attached().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_propagates_and_halts() {
        let loader = MockLoader::new();
        loader.fail(dns_layout::PROGRAM);
        let manager = Manager::new(test_config(), loader.clone());

        let err = manager.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Start { component: "dns", .. }));
        assert_eq!(loader.attached(), vec![dhcp_layout::PROGRAM]);
        assert!(manager.tls_filter().is_none());
        assert!(manager.discovery().is_none());

        assert!(manager.dhcp_filter().is_none());
        assert!(manager.storage().is_none());
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(!manager.is_running());

        // A retry attempts the whole sequence again and fails the same way.
        let err = manager.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Start { component: "dns", .. }));
        assert_eq!(
            loader.attached(),
            vec![dhcp_layout::PROGRAM, dhcp_layout::PROGRAM]
        );
        assert!(!manager.is_running());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_stops_started_components() {
        let loader = MockLoader::new();
        loader.fail(tls_layout::PROGRAM);
        let dhcp_tx = loader.channel(dhcp_layout::PROGRAM);
        let manager = Manager::new(test_config(), loader.clone());

        let err = manager.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Start { component: "tls", .. }));
        assert!(manager.dhcp_filter().is_none());
        assert!(dhcp_tx.is_closed());
        assert!(manager.dns_filter().is_none());
        assert_eq!(manager.statistics().state, ManagerState::Stopped);
    }

    #[tokio::test]
    async fn test_blocked_response_enforces_answers() {
        let manager = Manager::new(test_config(), MockLoader::new());
        manager.start(&CancellationToken::new()).await.unwrap();
        let blocked = record_blocks(&manager);
        let alerts = Arc::new(Alerts::default());
        manager.set_alert_sink(alerts.clone());

        let mut list = DomainList::default();
        list.insert_domain("ads.example");
        manager.response_filter().unwrap().replace_list(ListKind::Blocklist, list);

        manager.shared.on_dns_response(&blocked_response("ads.example")).unwrap();
        manager.shared.on_dns_response(&blocked_response("news.example")).unwrap();

        let blocked = blocked.lock().unwrap();
        assert_eq!(blocked.len(), 2);
        assert_eq!(blocked[0].0, "203.0.113.7".parse::<IpAddr>().unwrap());
        assert_eq!(blocked[1].0, "2001:db8::7".parse::<IpAddr>().unwrap());
        assert_eq!(blocked[0].1, "DNS blocklist: ads.example (blocked domain)");

        let alerts = alerts.0.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, "dns-blocked-ads.example");
        assert_eq!(alerts[0].severity, Severity::Warning);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_blocks_not_enforced_when_disabled() {
        let manager = Manager::new(
            Config {
                enforce_blocks: false,
                ..test_config()
            },
            MockLoader::new(),
        );
        manager.start(&CancellationToken::new()).await.unwrap();
        let blocked = record_blocks(&manager);
        let mut list = DomainList::default();
        list.parse_into("/^ads-/", RuleAction::Block, "blocked domain", "test");
        manager.response_filter().unwrap().replace_list(ListKind::Blocklist, list);

        manager.shared.on_dns_response(&blocked_response("ads-1.example")).unwrap();
        assert!(blocked.lock().unwrap().is_empty());
        assert_eq!(
            manager.response_filter().unwrap().statistics().responses_blocked,
            1
        );
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_learning_forwarding_is_gated() {
        let loader = MockLoader::new();
        let dns_tx = loader.channel(dns_layout::PROGRAM);
        let manager = Manager::new(test_config(), loader.clone());
        let learning = Arc::new(Recorder::default());
        manager.set_learning_service(learning.clone());
        manager.start(&CancellationToken::new()).await.unwrap();
        let dns = manager.dns_filter().unwrap();

        dns_tx.send(dns_record(false, "quiet.example")).unwrap();
        eventually(|| dns.statistics().queries_processed == 1).await;
        assert!(learning.packets.lock().unwrap().is_empty());

        learning.running.store(true, Ordering::SeqCst);
        dns_tx.send(dns_record(false, "learn.example")).unwrap();
        eventually(|| learning.packets.lock().unwrap().len() == 1).await;
        let packet = learning.packets.lock().unwrap()[0].clone();
        assert_eq!(packet.payload, "learn.example");
        assert_eq!(packet.protocol, Protocol::Udp);
        assert_eq!(packet.dst_port, 53);

        manager.shared.on_dns_response(&blocked_response("ok.example")).unwrap();
        assert_eq!(
            *learning.resolved.lock().unwrap(),
            vec![("ok.example".to_string(), "203.0.113.7".parse::<IpAddr>().unwrap(), 300)]
        );
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_learning_forwarding_disabled_by_config() {
        let manager = Manager::new(
            Config {
                forward_to_learning: false,
                ..test_config()
            },
            MockLoader::new(),
        );
        let learning = Arc::new(Recorder::default());
        learning.running.store(true, Ordering::SeqCst);
        manager.set_learning_service(learning.clone());

        manager.shared.on_dns_response(&blocked_response("ok.example")).unwrap();
        assert!(learning.resolved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discover_and_ack_are_persisted() {
        let loader = MockLoader::new();
        let dhcp_tx = loader.channel(dhcp_layout::PROGRAM);
        let manager = Manager::new(test_config(), loader.clone());
        manager.start(&CancellationToken::new()).await.unwrap();
        let storage = manager.storage().unwrap();

        dhcp_tx.send(dhcp_record(dhcp_layout::DISCOVER, MAC, [192, 168, 1, 1])).unwrap();
        dhcp_tx.send(dhcp_record(dhcp_layout::ACK, MAC, [192, 168, 1, 1])).unwrap();

        eventually(|| {
            storage
                .get("aa:bb:cc:dd:ee:ff")
                .unwrap()
                .is_some_and(|d| d.lease_expiry.is_some())
        })
        .await;
        let device = storage.get("aa:bb:cc:dd:ee:ff").unwrap().unwrap();
        assert_eq!(device.hostname, "iphone-12");
        assert_eq!(device.device_type, DeviceType::Mobile);
        assert_eq!(device.ip_address, Some(Ipv4Addr::new(192, 168, 1, 50)));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rogue_dhcp_server_alerted_and_blocked() {
        let mut config = test_config();
        config.dhcp.denied_servers = vec![Ipv4Addr::new(192, 168, 1, 66)];
        config.dhcp.alert_on_rogue_server = true;
        let loader = MockLoader::new();
        let dhcp_tx = loader.channel(dhcp_layout::PROGRAM);
        let manager = Manager::new(config, loader.clone());
        let alerts = Arc::new(Alerts::default());
        manager.set_alert_sink(alerts.clone());
        let blocked = record_blocks(&manager);
        manager.start(&CancellationToken::new()).await.unwrap();

        dhcp_tx.send(dhcp_record(dhcp_layout::OFFER, MAC, [192, 168, 1, 66])).unwrap();
        eventually(|| !blocked.lock().unwrap().is_empty()).await;

        assert_eq!(
            *blocked.lock().unwrap(),
            vec![(
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 66)),
                "Rogue DHCP server detected".to_string()
            )]
        );
        let alerts = alerts.0.lock().unwrap();
        assert!(alerts
            .iter()
            .any(|a| a.name == "Rogue DHCP Server" && a.severity == Severity::Critical));
        let rogue = manager.storage().unwrap().get("rogue:192.168.1.66").unwrap().unwrap();
        assert_eq!(rogue.device_type, DeviceType::Rogue);

        let stats = manager.statistics();
        assert_eq!(stats.dhcp.unwrap().rogue_servers_detected, 1);
        assert_eq!(stats.rogue_servers.len(), 1);
        manager.stop().await.unwrap();
    }
}
