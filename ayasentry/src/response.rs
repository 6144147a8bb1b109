//! Allow/block decisions for DNS responses.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::addr::is_private;
use crate::config::ResponseFilterConfig;
use crate::domains::{self, load_list, normalize, DomainList, DomainRule, ListFetcher, RuleAction};
use crate::error::{Error, Result};
use crate::events::{DnsResponseEvent, RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_SERVFAIL};
use crate::handler::{dispatch, Handler, Slot};
use crate::stats::{inc, ResponseFilterStats, ResponseFilterStatsSnapshot};
use crate::task::{spawn_periodic, Tasks};

pub const REASON_DISABLED: &str = "filter disabled";
pub const REASON_ALLOWLISTED: &str = "allowlisted";
pub const REASON_NOT_ALLOWLISTED: &str = "not in allowlist";
pub const REASON_MALICIOUS: &str = "malicious domain";
pub const REASON_BLOCKED: &str = "blocked domain";
pub const REASON_PRIVATE: &str = "private DNS response";
pub const REASON_ALLOWED: &str = "allowed";
pub const REASON_INVALID: &str = "validation failed";
const REASON_CONFIGURED_REGEX: &str = "configured regex block";

/// Callback for blocked responses; receives the event and the reason.
pub type BlockHandler = dyn Fn(&DnsResponseEvent, &str) -> anyhow::Result<()> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: String,
}

impl Verdict {
    fn allow(reason: &str) -> Self {
        Self {
            allowed: true,
            reason: reason.to_string(),
        }
    }

    fn block(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Blocklist,
    Allowlist,
    Malicious,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    verdict: Verdict,
    response_code: u8,
    ttl: Duration,
    inserted: Instant,
}

impl CacheEntry {
    /// Valid while younger than both the record TTL and the cache TTL.
    fn is_fresh(&self, now: Instant, cache_ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted) <= self.ttl.min(cache_ttl)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFilterStatus {
    #[serde(flatten)]
    pub stats: ResponseFilterStatsSnapshot,
    pub cache_size: usize,
    pub blocklist_domains: usize,
    pub blocklist_rules: usize,
    pub allowlist_domains: usize,
    pub malicious_domains: usize,
}

pub struct ResponseFilter {
    config: ResponseFilterConfig,
    blocklist: RwLock<DomainList>,
    allowlist: RwLock<DomainList>,
    malicious: RwLock<DomainList>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    fetcher: ListFetcher,
    stats: ResponseFilterStats,
    on_block: Slot<BlockHandler>,
    on_allow: Slot<Handler<DnsResponseEvent>>,
    tasks: Tasks,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ResponseFilter {
    pub fn new(config: ResponseFilterConfig) -> Result<Arc<Self>> {
        let remote = config
            .blocklist_sources
            .iter()
            .chain(&config.allowlist_sources)
            .chain(&config.malicious_sources)
            .any(|s| domains::is_remote(s));
        let fetcher = if remote {
            ListFetcher::with_http(config.fetch_timeout())?
        } else {
            ListFetcher::local(config.fetch_timeout())
        };

        Ok(Arc::new(Self {
            config,
            blocklist: RwLock::default(),
            allowlist: RwLock::default(),
            malicious: RwLock::default(),
            cache: RwLock::default(),
            fetcher,
            stats: ResponseFilterStats::default(),
            on_block: Slot::default(),
            on_allow: Slot::default(),
            tasks: Tasks::default(),
        }))
    }

    pub fn set_block_handler(&self, handler: Arc<BlockHandler>) {
        self.on_block.set(handler);
    }

    pub fn set_allow_handler(&self, handler: Arc<Handler<DnsResponseEvent>>) {
        self.on_allow.set(handler);
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    pub fn statistics(&self) -> ResponseFilterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn status(&self) -> ResponseFilterStatus {
        let blocklist = read(&self.blocklist);
        ResponseFilterStatus {
            stats: self.stats.snapshot(),
            cache_size: read(&self.cache).len(),
            blocklist_domains: blocklist.domain_count(),
            blocklist_rules: blocklist.rule_count(),
            allowlist_domains: read(&self.allowlist).domain_count(),
            malicious_domains: read(&self.malicious).domain_count(),
        }
    }

    /// Load the lists, then keep them fresh and the cache trimmed until
    /// `parent` is cancelled or [`stop`](Self::stop) is called.
    pub async fn start(self: &Arc<Self>, parent: &CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("DNS response filter disabled");
            return Ok(());
        }
        if self.tasks.is_running() {
            return Ok(());
        }

        self.refresh_lists(true).await;
        let cancel = parent.child_token();
        let mut handles = Vec::new();

        let this = self.clone();
        let period = self.config.update_interval();
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => this.refresh_lists(false).await,
                }
            }
        }));

        if self.config.cache_enabled {
            let this = self.clone();
            handles.push(spawn_periodic(cancel.clone(), self.config.cache_ttl() / 2, move || {
                this.sweep_cache();
            }));
        }

        self.tasks.install(cancel, handles);
        tracing::info!("DNS response filter started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.tasks.stop().await?;
        tracing::info!("DNS response filter stopped");
        Ok(())
    }

    /// Rebuild every list from its sources. With `initial` unset, a list
    /// whose sources did not all load keeps its previous contents.
    pub async fn refresh_lists(&self, initial: bool) {
        let lists = [
            (ListKind::Blocklist, &self.config.blocklist_sources, REASON_BLOCKED),
            (ListKind::Allowlist, &self.config.allowlist_sources, REASON_ALLOWLISTED),
            (ListKind::Malicious, &self.config.malicious_sources, REASON_MALICIOUS),
        ];

        for (kind, sources, reason) in lists {
            let action = match kind {
                ListKind::Allowlist => RuleAction::Allow,
                _ => RuleAction::Block,
            };
            let (mut list, failures) = load_list(&self.fetcher, sources, action, reason).await;
            if kind == ListKind::Blocklist {
                self.add_configured_patterns(&mut list);
            }

            if !failures.is_empty() {
                inc(&self.stats.list_refresh_failures);
                if !initial {
                    tracing::warn!(
                        list = ?kind,
                        failed = failures.len(),
                        "keeping previous list after failed refresh"
                    );
                    continue;
                }
            }
            self.replace_list(kind, list);
        }
        inc(&self.stats.list_refreshes);
        // Verdicts may have changed with the lists.
        write(&self.cache).clear();
    }

    fn add_configured_patterns(&self, list: &mut DomainList) {
        for pattern in &self.config.regex_patterns {
            match DomainRule::regex(pattern, RuleAction::Block, REASON_CONFIGURED_REGEX) {
                Ok(rule) => list.push_rule(rule),
                Err(e) => tracing::warn!(pattern = %pattern, error = %e, "skipping invalid regex pattern"),
            }
        }
    }

    /// Swap in a new list wholesale.
    pub fn replace_list(&self, kind: ListKind, list: DomainList) {
        let lock = match kind {
            ListKind::Blocklist => &self.blocklist,
            ListKind::Allowlist => &self.allowlist,
            ListKind::Malicious => &self.malicious,
        };
        *write(lock) = list;
    }

    pub fn filter(&self, event: &DnsResponseEvent) -> Verdict {
        if !self.config.enabled {
            return Verdict::allow(REASON_DISABLED);
        }
        inc(&self.stats.responses_checked);
        let domain = normalize(&event.domain);

        if self.config.cache_enabled {
            if let Some(verdict) = self.cached(&domain) {
                inc(&self.stats.cache_hits);
                self.count(&verdict);
                return verdict;
            }
            inc(&self.stats.cache_misses);
        }

        if self.config.validate_responses {
            if let Err(problem) = self.validate(event) {
                tracing::debug!(domain = %domain, problem, "DNS response failed validation");
                inc(&self.stats.validation_errors);
                let verdict = Verdict::block(REASON_INVALID);
                self.remember(&domain, &verdict, event);
                self.count(&verdict);
                return verdict;
            }
        }

        let verdict = self.evaluate(&domain, event);
        self.remember(&domain, &verdict, event);
        self.count(&verdict);

        if verdict.allowed {
            dispatch(&self.on_allow, "dns_allow", event);
        } else if let Some(handler) = self.on_block.get() {
            if let Err(e) = handler(event, &verdict.reason) {
                tracing::warn!(domain = %domain, error = %e, "block handler failed");
            }
        }
        verdict
    }

    fn count(&self, verdict: &Verdict) {
        if verdict.allowed {
            inc(&self.stats.responses_allowed);
        } else {
            inc(&self.stats.responses_blocked);
        }
    }

    fn validate(&self, event: &DnsResponseEvent) -> std::result::Result<(), &'static str> {
        let config = &self.config;
        if config.max_response_size > 0 && event.packet_size > config.max_response_size {
            return Err("response too large");
        }
        if config.block_nxdomain && event.response_code == RCODE_NXDOMAIN {
            return Err("NXDOMAIN");
        }
        if config.block_servfail && event.response_code == RCODE_SERVFAIL {
            return Err("SERVFAIL");
        }
        if config.block_empty_responses
            && event.answer_count == 0
            && event.response_code == RCODE_NOERROR
        {
            return Err("empty response");
        }
        if config.max_answers > 0 && event.answer_count > config.max_answers {
            return Err("too many answers");
        }
        Ok(())
    }

    fn evaluate(&self, domain: &str, event: &DnsResponseEvent) -> Verdict {
        inc(&self.stats.rule_evaluations);

        // Allowlist-only mode decides on its own; malicious and block lists
        // are not consulted.
        if self.config.allowlist_only {
            if read(&self.allowlist).contains(domain) {
                inc(&self.stats.allowlist_hits);
                return Verdict::allow(REASON_ALLOWLISTED);
            }
            return Verdict::block(REASON_NOT_ALLOWLISTED);
        }

        if self.config.block_malicious {
            if let Some(reason) = read(&self.malicious).match_reason(domain, REASON_MALICIOUS) {
                inc(&self.stats.malicious_hits);
                return Verdict::block(reason);
            }
        }

        if let Some(reason) = read(&self.blocklist).match_reason(domain, REASON_BLOCKED) {
            inc(&self.stats.blocklist_hits);
            return Verdict::block(reason);
        }

        if self.config.block_private_dns
            && event
                .answers
                .iter()
                .filter_map(|a| a.ip())
                .any(|ip| is_private(&ip))
        {
            inc(&self.stats.private_hits);
            return Verdict::block(REASON_PRIVATE);
        }

        Verdict::allow(REASON_ALLOWED)
    }

    fn cached(&self, domain: &str) -> Option<Verdict> {
        let cache = read(&self.cache);
        let entry = cache.get(domain)?;
        entry
            .is_fresh(Instant::now(), self.config.cache_ttl())
            .then(|| entry.verdict.clone())
    }

    fn remember(&self, domain: &str, verdict: &Verdict, event: &DnsResponseEvent) {
        if !self.config.cache_enabled {
            return;
        }
        let ttl = event
            .answers
            .iter()
            .map(|a| a.ttl)
            .min()
            .filter(|&ttl| ttl > 0)
            .unwrap_or(self.config.default_ttl_secs);

        let now = Instant::now();
        let cache_ttl = self.config.cache_ttl();
        let mut cache = write(&self.cache);
        if cache.len() >= self.config.cache_size && !cache.contains_key(domain) {
            cache.retain(|_, entry| entry.is_fresh(now, cache_ttl));
            if cache.len() >= self.config.cache_size {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }
        cache.insert(
            domain.to_string(),
            CacheEntry {
                verdict: verdict.clone(),
                response_code: event.response_code,
                ttl: Duration::from_secs(u64::from(ttl)),
                inserted: now,
            },
        );
    }

    /// Drop expired cache entries. Returns how many were removed.
    pub fn sweep_cache(&self) -> usize {
        let now = Instant::now();
        let cache_ttl = self.config.cache_ttl();
        let mut cache = write(&self.cache);
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh(now, cache_ttl));
        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!(removed, "swept DNS response cache");
        }
        removed
    }

    /// Response code recorded with the cached verdict for `domain`, if any.
    pub fn cached_response_code(&self, domain: &str) -> Option<u8> {
        read(&self.cache).get(&normalize(domain)).map(|e| e.response_code)
    }
}

impl From<ListKind> for &'static str {
    fn from(kind: ListKind) -> Self {
        match kind {
            ListKind::Blocklist => "blocklist",
            ListKind::Allowlist => "allowlist",
            ListKind::Malicious => "malicious",
        }
    }
}

impl std::str::FromStr for ListKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blocklist" => Ok(Self::Blocklist),
            "allowlist" => Ok(Self::Allowlist),
            "malicious" => Ok(Self::Malicious),
            other => Err(Error::Config(format!("unknown domain list '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{test_endpoints, DnsAnswer, DNS_TYPE_A};
    use std::sync::Mutex;

    fn response(domain: &str) -> DnsResponseEvent {
        DnsResponseEvent {
            endpoints: test_endpoints(),
            query_id: 1,
            query_type: DNS_TYPE_A,
            response_code: RCODE_NOERROR,
            answer_count: 1,
            domain: domain.to_string(),
            packet_size: 80,
            response_time: Duration::from_millis(3),
            answers: Vec::new(),
        }
    }

    fn with_answer(mut event: DnsResponseEvent, ip: &str, ttl: u32) -> DnsResponseEvent {
        event.answers.push(DnsAnswer {
            name: event.domain.clone(),
            record_type: DNS_TYPE_A,
            class: 1,
            ttl,
            data: ip.to_string(),
        });
        event
    }

    fn list(content: &str, action: RuleAction, reason: &str) -> DomainList {
        let mut list = DomainList::default();
        list.parse_into(content, action, reason, "test");
        list
    }

    fn filter_with(config: ResponseFilterConfig) -> Arc<ResponseFilter> {
        ResponseFilter::new(config).unwrap()
    }

    fn regex_filter() -> Arc<ResponseFilter> {
        let filter = filter_with(ResponseFilterConfig::default());
        filter.replace_list(
            ListKind::Blocklist,
            list(r"/^ads-.*\.doubleclick\.net$/", RuleAction::Block, REASON_BLOCKED),
        );
        filter
    }

    #[test]
    fn test_regex_rule_blocks_only_matching_domains() {
        let filter = regex_filter();
        for domain in ["ads-1.doubleclick.net", "ads-x.y.doubleclick.net", "ADS-2.doubleclick.net"] {
            let verdict = filter.filter(&response(domain));
            assert_eq!(verdict, Verdict::block(REASON_BLOCKED), "{domain}");
        }
        for domain in ["ads.doubleclick.net", "doubleclick.net", "ads-1.doubleclick.net.evil"] {
            assert!(filter.filter(&response(domain)).allowed, "{domain}");
        }
    }

    #[test]
    fn test_doubleclick_scenario() {
        let filter = regex_filter();
        let blocked = Arc::new(Mutex::new(Vec::new()));
        let b = blocked.clone();
        filter.set_block_handler(Arc::new(
            move |e: &DnsResponseEvent, reason: &str| -> anyhow::Result<()> {
                b.lock().unwrap().push((e.domain.clone(), reason.to_string()));
                Ok(())
            },
        ));

        assert!(filter.filter(&response("ads.doubleclick.net")).allowed);
        assert!(!filter.filter(&response("ads-1.doubleclick.net")).allowed);
        assert_eq!(
            *blocked.lock().unwrap(),
            vec![("ads-1.doubleclick.net".to_string(), REASON_BLOCKED.to_string())]
        );
    }

    #[test]
    fn test_cache_hit_skips_rule_evaluation() {
        let filter = regex_filter();
        let event = with_answer(response("ads-9.doubleclick.net"), "1.2.3.4", 300);

        let first = filter.filter(&event);
        let second = filter.filter(&event);

        assert_eq!(first, second);
        let stats = filter.statistics();
        assert_eq!(stats.rule_evaluations, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.responses_blocked, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_record_ttl() {
        let filter = regex_filter();
        let event = with_answer(response("example.com"), "93.184.216.34", 5);

        filter.filter(&event);
        tokio::time::advance(Duration::from_secs(4)).await;
        filter.filter(&event);
        assert_eq!(filter.statistics().rule_evaluations, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        filter.filter(&event);
        assert_eq!(filter.statistics().rule_evaluations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_bounded_by_cache_ttl() {
        let filter = filter_with(ResponseFilterConfig {
            cache_ttl_secs: 10,
            ..ResponseFilterConfig::default()
        });
        let event = with_answer(response("example.com"), "93.184.216.34", 3600);

        filter.filter(&event);
        tokio::time::advance(Duration::from_secs(11)).await;
        filter.filter(&event);
        assert_eq!(filter.statistics().rule_evaluations, 2);
    }

    #[test]
    fn test_default_ttl_when_answers_have_none() {
        let filter = filter_with(ResponseFilterConfig {
            default_ttl_secs: 42,
            ..ResponseFilterConfig::default()
        });
        let event = with_answer(response("zero.example"), "1.1.1.1", 0);
        filter.filter(&event);
        let cache = read(&filter.cache);
        assert_eq!(cache["zero.example"].ttl, Duration::from_secs(42));
    }

    #[test]
    fn test_min_answer_ttl_is_used() {
        let filter = filter_with(ResponseFilterConfig::default());
        let event = with_answer(with_answer(response("multi.example"), "1.1.1.1", 90), "1.1.1.2", 30);
        filter.filter(&event);
        assert_eq!(read(&filter.cache)["multi.example"].ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_allowlist_only_short_circuits() {
        let filter = filter_with(ResponseFilterConfig {
            allowlist_only: true,
            ..ResponseFilterConfig::default()
        });
        filter.replace_list(ListKind::Allowlist, list("good.example", RuleAction::Allow, REASON_ALLOWLISTED));
        filter.replace_list(ListKind::Malicious, list("good.example", RuleAction::Block, REASON_MALICIOUS));

        assert_eq!(filter.filter(&response("good.example")), Verdict::allow(REASON_ALLOWLISTED));
        assert_eq!(filter.filter(&response("other.example")), Verdict::block(REASON_NOT_ALLOWLISTED));
        assert_eq!(filter.statistics().malicious_hits, 0);
    }

    #[test]
    fn test_malicious_precedes_blocklist() {
        let filter = filter_with(ResponseFilterConfig::default());
        filter.replace_list(ListKind::Malicious, list("evil.example", RuleAction::Block, REASON_MALICIOUS));
        filter.replace_list(ListKind::Blocklist, list("evil.example", RuleAction::Block, REASON_BLOCKED));

        assert_eq!(filter.filter(&response("evil.example")), Verdict::block(REASON_MALICIOUS));
        let stats = filter.statistics();
        assert_eq!(stats.malicious_hits, 1);
        assert_eq!(stats.blocklist_hits, 0);
    }

    #[test]
    fn test_private_answers_blocked_when_enabled() {
        let filter = filter_with(ResponseFilterConfig {
            block_private_dns: true,
            ..ResponseFilterConfig::default()
        });
        let rebind = with_answer(response("rebind.example"), "192.168.0.10", 60);
        let public = with_answer(response("public.example"), "8.8.8.8", 60);

        assert_eq!(filter.filter(&rebind), Verdict::block(REASON_PRIVATE));
        assert!(filter.filter(&public).allowed);
    }

    #[test]
    fn test_validation_failures_are_cached_blocks() {
        let filter = filter_with(ResponseFilterConfig {
            block_nxdomain: true,
            block_empty_responses: true,
            ..ResponseFilterConfig::default()
        });
        let mut nx = response("missing.example");
        nx.response_code = RCODE_NXDOMAIN;
        nx.answer_count = 0;
        let mut empty = response("empty.example");
        empty.answer_count = 0;
        let mut huge = response("huge.example");
        huge.packet_size = 5000;
        let mut servfail = response("servfail.example");
        servfail.response_code = RCODE_SERVFAIL;

        for event in [&nx, &empty, &huge] {
            assert_eq!(filter.filter(event), Verdict::block(REASON_INVALID));
        }
        assert!(filter.filter(&servfail).allowed);
        assert_eq!(filter.filter(&nx), Verdict::block(REASON_INVALID));

        let stats = filter.statistics();
        assert_eq!(stats.validation_errors, 3);
        assert_eq!(stats.rule_evaluations, 1);
        assert_eq!(filter.cached_response_code("missing.example"), Some(RCODE_NXDOMAIN));
    }

    #[test]
    fn test_disabled_filter_allows_everything() {
        let filter = filter_with(ResponseFilterConfig {
            enabled: false,
            ..ResponseFilterConfig::default()
        });
        assert_eq!(filter.filter(&response("anything")), Verdict::allow(REASON_DISABLED));
        assert_eq!(filter.statistics().responses_checked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_sweeps_expired_entries() {
        let filter = filter_with(ResponseFilterConfig {
            cache_size: 2,
            ..ResponseFilterConfig::default()
        });
        filter.filter(&with_answer(response("a.example"), "1.1.1.1", 5));
        filter.filter(&with_answer(response("b.example"), "1.1.1.1", 100));
        tokio::time::advance(Duration::from_secs(10)).await;
        filter.filter(&with_answer(response("c.example"), "1.1.1.1", 100));

        let cache = read(&filter.cache);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_key("a.example"));
        assert!(cache.contains_key("b.example"));
        assert!(cache.contains_key("c.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_of_fresh_entries_stays_bounded() {
        let filter = filter_with(ResponseFilterConfig {
            cache_size: 2,
            ..ResponseFilterConfig::default()
        });
        filter.filter(&response("a.example"));
        tokio::time::advance(Duration::from_secs(1)).await;
        filter.filter(&response("b.example"));
        filter.filter(&response("c.example"));

        let cache = read(&filter.cache);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_key("a.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_cache_removes_stale() {
        let filter = filter_with(ResponseFilterConfig::default());
        filter.filter(&with_answer(response("short.example"), "1.1.1.1", 1));
        filter.filter(&with_answer(response("long.example"), "1.1.1.1", 200));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(filter.sweep_cache(), 1);
        assert_eq!(filter.status().cache_size, 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_list() {
        let path = std::env::temp_dir().join(format!("ayasentry-refresh-{}.txt", std::process::id()));
        std::fs::write(&path, "blocked.example\n").unwrap();
        let filter = filter_with(ResponseFilterConfig {
            blocklist_sources: vec![path.display().to_string()],
            regex_patterns: vec![r"^tracker\d+\.example$".into()],
            ..ResponseFilterConfig::default()
        });

        filter.refresh_lists(true).await;
        assert!(!filter.filter(&response("blocked.example")).allowed);
        assert_eq!(
            filter.filter(&response("tracker7.example")),
            Verdict::block(REASON_CONFIGURED_REGEX)
        );

        std::fs::remove_file(&path).unwrap();
        filter.refresh_lists(false).await;
        assert!(!filter.filter(&response("blocked.example")).allowed);
        assert_eq!(filter.statistics().list_refresh_failures, 1);
        assert_eq!(filter.status().blocklist_domains, 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let filter = regex_filter();
        let parent = CancellationToken::new();
        filter.start(&parent).await.unwrap();
        assert!(filter.is_running());
        filter.stop().await.unwrap();
        assert!(!filter.is_running());
    }

    #[test]
    fn test_list_kind_from_str() {
        assert_eq!("malicious".parse::<ListKind>().unwrap(), ListKind::Malicious);
        assert!("other".parse::<ListKind>().is_err());
    }
}
