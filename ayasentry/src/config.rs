use ipnet::IpNet;
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::source::{AttachMode, ProgramSpec};

/// Sensor configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Master switch; when false the manager never starts anything.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Network interface the socket filters attach to.
    #[serde(default)]
    pub interface: Option<String>,

    /// Directory holding the compiled kernel objects.
    #[serde(default = "default_bpf_dir")]
    pub bpf_dir: PathBuf,

    #[serde(default)]
    pub attach_mode: AttachMode,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database path (device inventory and DNS query log).
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Forward observations to the learning engine when it is running.
    #[serde(default = "default_true")]
    pub forward_to_learning: bool,

    /// Hand blocked-domain answers and rogue servers to block enforcement.
    #[serde(default = "default_true")]
    pub enforce_blocks: bool,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub dhcp: DhcpConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub response_filter: ResponseFilterConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub query_log: QueryLogConfig,
}

fn default_true() -> bool {
    true
}

fn default_bpf_dir() -> PathBuf {
    PathBuf::from("/usr/lib/ayasentry/bpf")
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "ayasentry.db".to_string()
}

fn default_interface() -> &'static str {
    "eth0"
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: None,
            bpf_dir: default_bpf_dir(),
            attach_mode: AttachMode::default(),
            port: default_port(),
            db_path: default_db_path(),
            quiet: false,
            allowed_ips: Vec::new(),
            forward_to_learning: true,
            enforce_blocks: true,
            dns: DnsConfig::default(),
            dhcp: DhcpConfig::default(),
            tls: TlsConfig::default(),
            response_filter: ResponseFilterConfig::default(),
            discovery: DiscoveryConfig::default(),
            query_log: QueryLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enabled: bool,
    /// Object file name inside `bpf_dir`.
    pub object: String,
    pub log_queries: bool,
    pub log_responses: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            object: "dns_socket.o".into(),
            log_queries: false,
            log_responses: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    pub enabled: bool,
    pub object: String,
    /// Age after which kernel-side transaction entries are pruned.
    pub transaction_timeout_secs: u64,
    pub validate_packets: bool,
    /// Drop offers/acks from rogue servers instead of dispatching them.
    pub block_invalid: bool,
    pub detect_rogue_servers: bool,
    pub alert_on_rogue_server: bool,
    pub allowed_servers: Vec<Ipv4Addr>,
    pub denied_servers: Vec<Ipv4Addr>,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            object: "dhcp_socket.o".into(),
            transaction_timeout_secs: 120,
            validate_packets: true,
            block_invalid: false,
            detect_rogue_servers: true,
            alert_on_rogue_server: false,
            allowed_servers: Vec::new(),
            denied_servers: Vec::new(),
        }
    }
}

impl DhcpConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub object: String,
    pub extract_sni: bool,
    pub ja3_fingerprinting: bool,
    pub log_handshakes: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            object: "tls_socket.o".into(),
            extract_sni: true,
            ja3_fingerprinting: true,
            log_handshakes: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResponseFilterConfig {
    pub enabled: bool,
    pub block_malicious: bool,
    pub block_private_dns: bool,
    pub allowlist_only: bool,
    pub block_nxdomain: bool,
    pub block_servfail: bool,
    pub block_empty_responses: bool,
    pub validate_responses: bool,
    pub max_response_size: u16,
    pub max_answers: u16,
    /// File paths or http(s) URLs, one domain or `/regex/` per line.
    pub blocklist_sources: Vec<String>,
    pub allowlist_sources: Vec<String>,
    pub malicious_sources: Vec<String>,
    /// Extra blocklist regexes, without the surrounding slashes.
    pub regex_patterns: Vec<String>,
    pub update_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub cache_ttl_secs: u64,
    /// TTL used when a response carries no usable answer TTL.
    pub default_ttl_secs: u32,
}

impl Default for ResponseFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_malicious: true,
            block_private_dns: false,
            allowlist_only: false,
            block_nxdomain: false,
            block_servfail: false,
            block_empty_responses: false,
            validate_responses: true,
            max_response_size: 4096,
            max_answers: 100,
            blocklist_sources: Vec::new(),
            allowlist_sources: Vec::new(),
            malicious_sources: Vec::new(),
            regex_patterns: Vec::new(),
            update_interval_secs: 3600,
            fetch_timeout_secs: 10,
            cache_enabled: true,
            cache_size: 10_000,
            cache_ttl_secs: 300,
            default_ttl_secs: 60,
        }
    }
}

impl ResponseFilterConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub track_by_mac: bool,
    pub track_by_ip: bool,
    pub track_by_hostname: bool,
    pub max_devices: usize,
    pub cleanup_interval_secs: u64,
    pub device_timeout_secs: u64,
    pub lookup_vendors: bool,
    pub classify_devices: bool,
    pub alert_on_new_device: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            track_by_mac: true,
            track_by_ip: true,
            track_by_hostname: true,
            max_devices: 10_000,
            cleanup_interval_secs: 3600,
            device_timeout_secs: 86_400,
            lookup_vendors: true,
            classify_devices: true,
            alert_on_new_device: false,
        }
    }
}

impl DiscoveryConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryLogConfig {
    pub enabled: bool,
    pub log_queries: bool,
    pub log_responses: bool,
    /// Also record queries whose client address is private.
    pub log_private_ips: bool,
    pub log_blocked_only: bool,
    pub buffer_size: usize,
    pub flush_interval_secs: u64,
    /// Delete entries older than this many seconds (None = keep forever).
    pub retention_seconds: Option<u64>,
}

impl Default for QueryLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_queries: true,
            log_responses: true,
            log_private_ips: true,
            log_blocked_only: false,
            buffer_size: 1000,
            flush_interval_secs: 5,
            retention_seconds: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or(default_interface())
    }

    /// Reject settings that would make a periodic worker spin or never fire.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("dhcp.transaction_timeout_secs", self.dhcp.transaction_timeout_secs),
            ("response_filter.update_interval_secs", self.response_filter.update_interval_secs),
            ("response_filter.fetch_timeout_secs", self.response_filter.fetch_timeout_secs),
            ("response_filter.cache_ttl_secs", self.response_filter.cache_ttl_secs),
            ("discovery.cleanup_interval_secs", self.discovery.cleanup_interval_secs),
            ("discovery.device_timeout_secs", self.discovery.device_timeout_secs),
            ("query_log.flush_interval_secs", self.query_log.flush_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.response_filter.cache_enabled && self.response_filter.cache_size == 0 {
            return Err(Error::Config(
                "response_filter.cache_size must be greater than zero".into(),
            ));
        }
        if self.query_log.buffer_size == 0 {
            return Err(Error::Config("query_log.buffer_size must be greater than zero".into()));
        }
        for cidr in &self.allowed_ips {
            cidr.parse::<IpNet>()
                .map_err(|e| Error::Config(format!("allowed_ips entry '{cidr}': {e}")))?;
        }
        Ok(())
    }

    pub fn program_spec(
        &self,
        object: &str,
        program: &str,
        events_map: &str,
        tables: Vec<ayasentry_common::TrackingTable>,
    ) -> ProgramSpec {
        ProgramSpec {
            object: self.bpf_dir.join(object),
            program: program.to_string(),
            events_map: events_map.to_string(),
            tables,
            interface: self.interface().to_string(),
            mode: self.attach_mode,
        }
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.interface.is_some() {
            self.interface = cli.interface.clone();
        }
        if let Some(ref dir) = cli.bpf_dir {
            self.bpf_dir = PathBuf::from(dir);
        }
        if let Some(mode) = cli.attach_mode {
            self.attach_mode = mode;
        }
        if cli.port != 3000 {
            self.port = cli.port;
        }
        if cli.db_path != "ayasentry.db" {
            self.db_path = cli.db_path.clone();
        }
        if cli.quiet {
            self.quiet = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
        if !cli.blocklist.is_empty() {
            self.response_filter.blocklist_sources = cli.blocklist.clone();
        }
        if cli.no_tls {
            self.tls.enabled = false;
        }
        if cli.no_dhcp {
            self.dhcp.enabled = false;
        }
    }
}

use clap::Parser;

/// ayaSentry: eBPF DNS/DHCP/TLS inspection sensor
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Network interface to attach the socket filters to (e.g., eth0).
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Directory containing the compiled kernel objects.
    #[arg(long)]
    pub bpf_dir: Option<String>,

    /// How kernel programs are attached: socket or tc.
    #[arg(long, value_parser = parse_attach_mode)]
    pub attach_mode: Option<AttachMode>,

    /// Port to serve the API on.
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// SQLite database path.
    #[arg(long, default_value = "ayasentry.db")]
    pub db_path: String,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,

    /// Blocklist source (file path or URL). Repeat for multiple.
    #[arg(long)]
    pub blocklist: Vec<String>,

    /// Disable the TLS handshake filter.
    #[arg(long)]
    pub no_tls: bool,

    /// Disable the DHCP filter and device discovery input.
    #[arg(long)]
    pub no_dhcp: bool,
}

fn parse_attach_mode(s: &str) -> std::result::Result<AttachMode, String> {
    match s {
        "socket" => Ok(AttachMode::Socket),
        "tc" => Ok(AttachMode::Tc),
        other => Err(format!("unknown attach mode '{other}' (expected socket or tc)")),
    }
}
