//! SQLite persistence: the device inventory and the buffered DNS query log.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use crate::addr::is_private;
use crate::collab::{DeviceStore, QueryLog};
use crate::config::QueryLogConfig;
use crate::discovery::DeviceInfo;
use crate::error::{Error, Result};
use crate::events::{DnsQueryEvent, DnsResponseEvent};
use crate::stats::{add, inc, QueryLogStats, QueryLogStatsSnapshot};
use crate::vendor::DeviceType;

#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        if db_path != ":memory:" {
            let _: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        }
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS devices (
                key TEXT PRIMARY KEY,
                mac_address TEXT NOT NULL,
                ip_address TEXT,
                hostname TEXT NOT NULL,
                vendor TEXT NOT NULL,
                device_type TEXT NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                lease_expiry INTEGER,
                dhcp_options TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS dns_log (
                id INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                kind TEXT NOT NULL,
                client_ip TEXT NOT NULL,
                server_ip TEXT NOT NULL,
                domain TEXT NOT NULL,
                query_type INTEGER NOT NULL,
                response_code INTEGER,
                answer_count INTEGER,
                response_time_ms REAL,
                blocked INTEGER NOT NULL,
                reason TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_dns_log_timestamp ON dns_log(timestamp)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert `entries` in one transaction.
    pub fn write_log(&self, entries: &[LogEntry]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO dns_log (timestamp, kind, client_ip, server_ip, domain, query_type,
                                      response_code, answer_count, response_time_ms, blocked, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.timestamp.timestamp_millis(),
                    entry.kind.as_str(),
                    entry.client_ip.to_string(),
                    entry.server_ip.to_string(),
                    entry.domain,
                    entry.query_type,
                    entry.response_code,
                    entry.answer_count,
                    entry.response_time_ms,
                    entry.blocked,
                    entry.reason,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent log entries, newest first.
    pub fn query_log_history(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT timestamp, kind, client_ip, server_ip, domain, query_type,
                    response_code, answer_count, response_time_ms, blocked, reason
             FROM dns_log ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            Ok(LogEntry {
                timestamp: from_millis(row.get(0)?),
                kind: if row.get::<_, String>(1)? == "response" {
                    EntryKind::Response
                } else {
                    EntryKind::Query
                },
                client_ip: parse_ip(row.get(2)?),
                server_ip: parse_ip(row.get(3)?),
                domain: row.get(4)?,
                query_type: row.get(5)?,
                response_code: row.get(6)?,
                answer_count: row.get(7)?,
                response_time_ms: row.get(8)?,
                blocked: row.get(9)?,
                reason: row.get(10)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_old_log(&self, older_than_seconds: u64) -> Result<usize> {
        let cutoff_ms = Utc::now().timestamp_millis() - (older_than_seconds as i64 * 1000);
        let deleted = self
            .conn()
            .execute("DELETE FROM dns_log WHERE timestamp < ?1", params![cutoff_ms])?;
        Ok(deleted)
    }

    /// Render the latest `limit` log entries as `format` ("json" or "text").
    pub fn export_log(&self, limit: usize, format: &str) -> Result<String> {
        let format: QueryLogFormat = format.parse()?;
        format.render(&self.query_log_history(limit)?)
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn parse_ip(text: String) -> IpAddr {
    text.parse().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceInfo> {
    let ip: Option<String> = row.get(2)?;
    let device_type: String = row.get(5)?;
    let options: String = row.get(9)?;
    Ok(DeviceInfo {
        key: row.get(0)?,
        mac_address: row.get(1)?,
        ip_address: ip.and_then(|ip| ip.parse().ok()),
        hostname: row.get(3)?,
        vendor: row.get(4)?,
        device_type: DeviceType::from_str(&device_type).unwrap_or_default(),
        first_seen: from_millis(row.get(6)?),
        last_seen: from_millis(row.get(7)?),
        lease_expiry: row.get::<_, Option<i64>>(8)?.map(from_millis),
        dhcp_options: serde_json::from_str::<BTreeMap<String, String>>(&options).unwrap_or_default(),
    })
}

const DEVICE_COLUMNS: &str = "key, mac_address, ip_address, hostname, vendor, device_type,
                              first_seen, last_seen, lease_expiry, dhcp_options";

impl DeviceStore for Storage {
    fn store(&self, device: &DeviceInfo) -> Result<()> {
        let options = serde_json::to_string(&device.dhcp_options)?;
        self.conn().execute(
            "INSERT INTO devices (key, mac_address, ip_address, hostname, vendor, device_type,
                                  first_seen, last_seen, lease_expiry, dhcp_options)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(key) DO UPDATE SET
                mac_address = excluded.mac_address,
                ip_address = excluded.ip_address,
                hostname = excluded.hostname,
                vendor = excluded.vendor,
                device_type = excluded.device_type,
                last_seen = excluded.last_seen,
                lease_expiry = excluded.lease_expiry,
                dhcp_options = excluded.dhcp_options",
            params![
                device.key,
                device.mac_address,
                device.ip_address.map(|ip| ip.to_string()),
                device.hostname,
                device.vendor,
                device.device_type.as_str(),
                device.first_seen.timestamp_millis(),
                device.last_seen.timestamp_millis(),
                device.lease_expiry.map(|t| t.timestamp_millis()),
                options,
            ],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<DeviceInfo>> {
        let conn = self.conn();
        let device = conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE key = ?1"),
                [key],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn list(&self) -> Result<Vec<DeviceInfo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY key"))?;
        let rows = stmt.query_map([], device_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let deleted = self.conn().execute("DELETE FROM devices WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Query,
    Response,
}

impl EntryKind {
    fn as_str(self) -> &'static str {
        match self {
            EntryKind::Query => "query",
            EntryKind::Response => "response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub client_ip: IpAddr,
    pub server_ip: IpAddr,
    pub domain: String,
    pub query_type: u16,
    pub response_code: Option<u8>,
    pub answer_count: Option<u16>,
    pub response_time_ms: Option<f64>,
    pub blocked: bool,
    pub reason: String,
}

impl LogEntry {
    pub fn from_query(event: &DnsQueryEvent) -> Self {
        Self {
            timestamp: event.endpoints.timestamp,
            kind: EntryKind::Query,
            client_ip: IpAddr::V4(event.endpoints.src_ip),
            server_ip: IpAddr::V4(event.endpoints.dst_ip),
            domain: event.domain.clone(),
            query_type: event.query_type,
            response_code: None,
            answer_count: None,
            response_time_ms: None,
            blocked: false,
            reason: String::new(),
        }
    }

    /// Responses travel server to client, so the client is the destination.
    pub fn from_response(event: &DnsResponseEvent, blocked: bool, reason: &str) -> Self {
        Self {
            timestamp: event.endpoints.timestamp,
            kind: EntryKind::Response,
            client_ip: IpAddr::V4(event.endpoints.dst_ip),
            server_ip: IpAddr::V4(event.endpoints.src_ip),
            domain: event.domain.clone(),
            query_type: event.query_type,
            response_code: Some(event.response_code),
            answer_count: Some(event.answer_count),
            response_time_ms: Some(event.response_time.as_secs_f64() * 1000.0),
            blocked,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLogFormat {
    Json,
    Text,
}

impl FromStr for QueryLogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            _ => Err(Error::UnsupportedFormat(s.to_string())),
        }
    }
}

impl QueryLogFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain; charset=utf-8",
        }
    }

    pub fn render(self, entries: &[LogEntry]) -> Result<String> {
        match self {
            Self::Json => Ok(serde_json::to_string_pretty(entries)?),
            Self::Text => {
                let mut out = String::new();
                for e in entries {
                    let _ = write!(
                        out,
                        "ts={} kind={} client={} server={} domain={} qtype={} blocked={}",
                        e.timestamp.to_rfc3339(),
                        e.kind.as_str(),
                        e.client_ip,
                        e.server_ip,
                        e.domain,
                        e.query_type,
                        e.blocked,
                    );
                    if let Some(rcode) = e.response_code {
                        let _ = write!(out, " rcode={rcode}");
                    }
                    if let Some(ms) = e.response_time_ms {
                        let _ = write!(out, " time_ms={ms:.3}");
                    }
                    if !e.reason.is_empty() {
                        let _ = write!(out, " reason={:?}", e.reason);
                    }
                    out.push('\n');
                }
                Ok(out)
            }
        }
    }
}

/// Buffers DNS log entries on a channel; [`QueryLogger::run_writer`] drains
/// them into [`Storage`] in batches.
pub struct QueryLogger {
    storage: Storage,
    config: QueryLogConfig,
    tx: Sender<LogEntry>,
    stats: QueryLogStats,
}

impl QueryLogger {
    pub fn new(storage: Storage, config: QueryLogConfig) -> (Arc<Self>, Receiver<LogEntry>) {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1) * 4);
        let logger = Arc::new(Self {
            storage,
            config,
            tx,
            stats: QueryLogStats::default(),
        });
        (logger, rx)
    }

    pub fn statistics(&self) -> QueryLogStatsSnapshot {
        self.stats.snapshot()
    }

    fn enqueue(&self, entry: LogEntry) {
        if !self.config.log_private_ips && is_private(&entry.client_ip) {
            inc(&self.stats.entries_skipped);
            return;
        }
        if self.tx.try_send(entry).is_err() {
            inc(&self.stats.entries_dropped);
        }
    }

    /// Drain `rx` until `cancel` fires, flushing whenever `buffer_size`
    /// entries are pending or the flush interval elapses.
    pub async fn run_writer(self: Arc<Self>, mut rx: Receiver<LogEntry>, cancel: CancellationToken) {
        let batch = self.config.buffer_size.max(1);
        let mut buffer = Vec::with_capacity(batch);
        let mut ticker = interval(Duration::from_secs(self.config.flush_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(entry) = rx.recv() => {
                    buffer.push(entry);
                    if buffer.len() >= batch {
                        self.flush(&mut buffer);
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer);
                    }
                }
            }
        }

        while let Ok(entry) = rx.try_recv() {
            buffer.push(entry);
        }
        if !buffer.is_empty() {
            self.flush(&mut buffer);
        }
    }

    fn flush(&self, buffer: &mut Vec<LogEntry>) {
        match self.storage.write_log(buffer) {
            Ok(()) => {
                add(&self.stats.entries_logged, buffer.len() as u64);
            }
            Err(e) => {
                inc(&self.stats.flush_errors);
                add(&self.stats.entries_dropped, buffer.len() as u64);
                tracing::warn!(error = %e, entries = buffer.len(), "failed to flush DNS log");
            }
        }
        buffer.clear();
    }

    /// Apply the retention window, if one is configured.
    pub fn prune(&self) {
        let Some(retention) = self.config.retention_seconds else {
            return;
        };
        match self.storage.delete_old_log(retention) {
            Ok(0) => {}
            Ok(deleted) => tracing::debug!(deleted, "pruned DNS log"),
            Err(e) => tracing::warn!(error = %e, "failed to prune DNS log"),
        }
    }
}

impl QueryLog for QueryLogger {
    fn log_query(&self, event: &DnsQueryEvent) {
        if !self.config.enabled || !self.config.log_queries {
            return;
        }
        if self.config.log_blocked_only {
            inc(&self.stats.entries_skipped);
            return;
        }
        self.enqueue(LogEntry::from_query(event));
    }

    fn log_response(&self, event: &DnsResponseEvent, blocked: bool, reason: &str) {
        if !self.config.enabled || !self.config.log_responses {
            return;
        }
        if self.config.log_blocked_only && !blocked {
            inc(&self.stats.entries_skipped);
            return;
        }
        self.enqueue(LogEntry::from_response(event, blocked, reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{test_endpoints, DNS_TYPE_A, RCODE_NOERROR};
    use chrono::Duration as ChronoDuration;

    fn memory() -> Storage {
        Storage::open(":memory:").unwrap()
    }

    fn device(key: &str) -> DeviceInfo {
        let now = Utc.timestamp_millis_opt(Utc::now().timestamp_millis()).unwrap();
        DeviceInfo {
            key: key.to_string(),
            mac_address: key.to_uppercase(),
            ip_address: Some(Ipv4Addr::new(192, 168, 1, 50)),
            hostname: "iphone-12".into(),
            vendor: "Apple".into(),
            device_type: DeviceType::NetworkEquipment,
            first_seen: now,
            last_seen: now,
            lease_expiry: Some(now + ChronoDuration::seconds(3600)),
            dhcp_options: BTreeMap::from([("vendor_class".to_string(), "android-dhcp-13".to_string())]),
        }
    }

    fn query(domain: &str) -> DnsQueryEvent {
        DnsQueryEvent {
            endpoints: test_endpoints(),
            query_id: 7,
            query_type: DNS_TYPE_A,
            query_class: 1,
            domain: domain.to_string(),
            packet_size: 40,
        }
    }

    fn response(domain: &str) -> DnsResponseEvent {
        DnsResponseEvent {
            endpoints: test_endpoints(),
            query_id: 7,
            query_type: DNS_TYPE_A,
            response_code: RCODE_NOERROR,
            answer_count: 1,
            domain: domain.to_string(),
            packet_size: 80,
            response_time: std::time::Duration::from_micros(2500),
            answers: Vec::new(),
        }
    }

    #[test]
    fn test_device_store_upsert() {
        let storage = memory();
        let mut dev = device("aa:bb:cc:dd:ee:ff");
        storage.store(&dev).unwrap();
        assert_eq!(storage.get(&dev.key).unwrap().unwrap(), dev);

        dev.hostname = "renamed".into();
        dev.ip_address = None;
        storage.store(&dev).unwrap();
        let list = storage.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].hostname, "renamed");
        assert_eq!(list[0].ip_address, None);

        assert!(storage.delete(&dev.key).unwrap());
        assert!(!storage.delete(&dev.key).unwrap());
        assert!(storage.get(&dev.key).unwrap().is_none());
    }

    #[test]
    fn test_log_history_newest_first() {
        let storage = memory();
        let mut old = LogEntry::from_query(&query("old.example"));
        old.timestamp = Utc::now() - ChronoDuration::seconds(60);
        let new = LogEntry::from_response(&response("new.example"), true, "blocked domain");
        storage.write_log(&[old, new]).unwrap();

        let history = storage.query_log_history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].domain, "new.example");
        assert_eq!(history[0].kind, EntryKind::Response);
        assert_eq!(history[0].client_ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(history[0].blocked);
        assert_eq!(history[1].response_code, None);

        assert_eq!(storage.delete_old_log(30).unwrap(), 1);
        assert_eq!(storage.query_log_history(10).unwrap().len(), 1);
    }

    #[test]
    fn test_export_formats() {
        let storage = memory();
        storage
            .write_log(&[LogEntry::from_response(&response("ads.example"), true, "blocked domain")])
            .unwrap();

        let text = storage.export_log(10, "text").unwrap();
        assert!(text.contains("domain=ads.example"));
        assert!(text.contains("reason=\"blocked domain\""));
        assert!(text.contains("time_ms=2.500"));

        let json: serde_json::Value = serde_json::from_str(&storage.export_log(10, "JSON").unwrap()).unwrap();
        assert_eq!(json[0]["domain"], "ads.example");

        let err = storage.export_log(10, "xml").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(f) if f == "xml"));
    }

    #[tokio::test]
    async fn test_writer_flushes_on_cancel() {
        let storage = memory();
        let (logger, rx) = QueryLogger::new(storage.clone(), QueryLogConfig::default());
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(logger.clone().run_writer(rx, cancel.clone()));

        logger.log_query(&query("one.example"));
        logger.log_response(&response("one.example"), false, "allowed");
        tokio::task::yield_now().await;
        cancel.cancel();
        writer.await.unwrap();

        assert_eq!(storage.query_log_history(10).unwrap().len(), 2);
        assert_eq!(logger.statistics().entries_logged, 2);
    }

    #[tokio::test]
    async fn test_logger_filters() {
        let storage = memory();
        let (logger, mut rx) = QueryLogger::new(
            storage,
            QueryLogConfig {
                log_private_ips: false,
                ..QueryLogConfig::default()
            },
        );
        // Test endpoints use private addresses on both sides.
        logger.log_query(&query("private.example"));
        assert!(rx.try_recv().is_err());
        assert_eq!(logger.statistics().entries_skipped, 1);

        let (logger, mut rx) = QueryLogger::new(
            memory(),
            QueryLogConfig {
                log_blocked_only: true,
                ..QueryLogConfig::default()
            },
        );
        logger.log_query(&query("a.example"));
        logger.log_response(&response("a.example"), false, "allowed");
        logger.log_response(&response("b.example"), true, "blocked domain");
        assert_eq!(rx.try_recv().unwrap().domain, "b.example");
        assert!(rx.try_recv().is_err());
        assert_eq!(logger.statistics().entries_skipped, 2);
    }

    #[test]
    fn test_full_buffer_drops() {
        let (logger, _rx) = QueryLogger::new(
            memory(),
            QueryLogConfig {
                buffer_size: 1,
                ..QueryLogConfig::default()
            },
        );
        for _ in 0..5 {
            logger.log_query(&query("flood.example"));
        }
        assert_eq!(logger.statistics().entries_dropped, 1);
    }
}
