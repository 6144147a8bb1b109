//! Domain lists and the sources they are loaded from.
//!
//! A source is newline delimited. Accepted lines:
//! - `example.com` exact domain
//! - `0.0.0.0 example.com` hosts-file entry (second field is used)
//! - `/^ads-.*\.example\.com$/` regular expression
//! - `# comment`, `! comment` and blank lines are skipped

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use regex::Regex;
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Block,
    Allow,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Exact(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct DomainRule {
    pub pattern: Pattern,
    pub action: RuleAction,
    pub reason: String,
}

impl DomainRule {
    pub fn exact(domain: &str, action: RuleAction, reason: &str) -> Self {
        Self {
            pattern: Pattern::Exact(normalize(domain)),
            action,
            reason: reason.to_string(),
        }
    }

    /// Compile `pattern` once; matching never recompiles.
    pub fn regex(pattern: &str, action: RuleAction, reason: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            pattern: Pattern::Regex(Regex::new(pattern)?),
            action,
            reason: reason.to_string(),
        })
    }

    pub fn matches(&self, domain: &str) -> bool {
        match &self.pattern {
            Pattern::Exact(exact) => exact == domain,
            Pattern::Regex(re) => re.is_match(domain),
        }
    }
}

/// Lower-case and drop the root dot so `Ads.Example.COM.` and
/// `ads.example.com` compare equal.
pub fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Exact domains plus ordered pattern rules.
#[derive(Debug, Clone, Default)]
pub struct DomainList {
    domains: HashSet<String>,
    rules: Vec<DomainRule>,
}

impl DomainList {
    pub fn insert_domain(&mut self, domain: &str) {
        let domain = normalize(domain);
        if !domain.is_empty() {
            self.domains.insert(domain);
        }
    }

    pub fn push_rule(&mut self, rule: DomainRule) {
        self.rules.push(rule);
    }

    /// True when `domain` is in the exact set or any rule matches it.
    /// `domain` must already be normalized.
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain) || self.matching_rule(domain).is_some()
    }

    /// Why `domain` is on this list: `exact_reason` for an exact entry,
    /// otherwise the reason of the first matching rule.
    pub fn match_reason<'a>(&'a self, domain: &str, exact_reason: &'a str) -> Option<&'a str> {
        if self.domains.contains(domain) {
            return Some(exact_reason);
        }
        self.matching_rule(domain).map(|rule| rule.reason.as_str())
    }

    /// First rule, in registration order, that matches `domain`.
    pub fn matching_rule(&self, domain: &str) -> Option<&DomainRule> {
        self.rules.iter().find(|rule| rule.matches(domain))
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.rules.is_empty()
    }

    /// Add every entry of `content`. Malformed regexes are logged and skipped.
    /// Returns the number of entries added.
    pub fn parse_into(&mut self, content: &str, action: RuleAction, reason: &str, origin: &str) -> usize {
        let mut added = 0;
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            if line.len() > 2 && line.starts_with('/') && line.ends_with('/') {
                let pattern = &line[1..line.len() - 1];
                match DomainRule::regex(pattern, action, reason) {
                    Ok(rule) => {
                        self.push_rule(rule);
                        added += 1;
                    }
                    Err(e) => tracing::warn!(
                        source = origin,
                        line = lineno + 1,
                        pattern,
                        error = %e,
                        "skipping invalid regex rule"
                    ),
                }
                continue;
            }

            let entry = line.split_once('#').map_or(line, |(head, _)| head);
            let mut fields = entry.split_whitespace();
            let domain = match (fields.next(), fields.next()) {
                (Some(first), Some(second)) if first.parse::<std::net::IpAddr>().is_ok() => second,
                (Some(first), None) => first,
                _ => {
                    tracing::debug!(source = origin, line = lineno + 1, "skipping unrecognised list entry");
                    continue;
                }
            };
            self.insert_domain(domain);
            added += 1;
        }
        added
    }
}

type HttpClient = Client<HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// Reads list sources: local paths (optionally `file://`) or http(s) URLs.
pub struct ListFetcher {
    client: Option<HttpClient>,
    timeout: Duration,
}

pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

impl ListFetcher {
    /// A fetcher that only reads local files.
    pub fn local(timeout: Duration) -> Self {
        Self {
            client: None,
            timeout,
        }
    }

    /// A fetcher that can also reach http(s) sources, trusting the system
    /// root certificates.
    pub fn with_http(timeout: Duration) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        if let Some(err) = native.errors.first() {
            tracing::warn!("some system certificates failed to load: {}", err);
        }
        for cert in native.certs {
            if let Err(e) = roots.add(cert) {
                tracing::debug!(error = %e, "skipping unusable system certificate");
            }
        }

        let tls = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("failed to configure tls protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        Ok(Self {
            client: Some(Client::builder(TokioExecutor::new()).build(connector)),
            timeout,
        })
    }

    pub async fn read(&self, source: &str) -> Result<String> {
        if is_remote(source) {
            return self.fetch(source).await;
        }
        let path = source.strip_prefix("file://").unwrap_or(source);
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::list_source(source, e))
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::list_source(url, "remote sources are not enabled"))?;
        let uri: hyper::Uri = url.parse().map_err(|e| Error::list_source(url, e))?;

        let request = async {
            let response = client
                .get(uri)
                .await
                .map_err(|e| Error::list_source(url, e))?;
            if !response.status().is_success() {
                return Err(Error::list_source(
                    url,
                    format!("unexpected HTTP status {}", response.status()),
                ));
            }
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::list_source(url, e))?
                .to_bytes();
            Ok(String::from_utf8_lossy(&body).into_owned())
        };

        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| Error::list_source(url, format!("timed out after {:?}", self.timeout)))?
    }
}

/// Build a list from `sources`. Sources that fail are logged and reported
/// back so the caller can decide whether to keep its previous list.
pub async fn load_list(
    fetcher: &ListFetcher,
    sources: &[String],
    action: RuleAction,
    reason: &str,
) -> (DomainList, Vec<Error>) {
    let mut list = DomainList::default();
    let mut failures = Vec::new();
    for source in sources {
        match fetcher.read(source).await {
            Ok(content) => {
                let added = list.parse_into(&content, action, reason, source);
                tracing::info!(source = %source, entries = added, "loaded domain list");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load domain list");
                failures.push(e);
            }
        }
    }
    (list, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("ayasentry-{}-{}", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_mixed_formats() {
        let content = "\
# comment
! adblock comment

Tracker.Example.com.
0.0.0.0 ads.example.net
127.0.0.1   metrics.example.org
/^ads-.*\\.doubleclick\\.net$/
/([unclosed/
two words here
";
        let mut list = DomainList::default();
        let added = list.parse_into(content, RuleAction::Block, "blocked domain", "inline");

        assert_eq!(added, 4);
        assert_eq!(list.domain_count(), 3);
        assert_eq!(list.rule_count(), 1);
        assert!(list.contains("tracker.example.com"));
        assert!(list.contains("ads.example.net"));
        assert!(list.contains("metrics.example.org"));
        assert!(list.contains("ads-1.doubleclick.net"));
        assert!(!list.contains("ads.doubleclick.net"));
        assert!(!list.contains("127.0.0.1"));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut list = DomainList::default();
        list.push_rule(DomainRule::regex(r"\.example\.com$", RuleAction::Block, "first").unwrap());
        list.push_rule(DomainRule::exact("www.example.com", RuleAction::Allow, "second"));
        let rule = list.matching_rule("www.example.com").unwrap();
        assert_eq!(rule.reason, "first");
        assert_eq!(rule.action, RuleAction::Block);
    }

    #[test]
    fn test_inline_comments_are_stripped() {
        let mut list = DomainList::default();
        let added = list.parse_into(
            "ads.example # tracker\n0.0.0.0 metrics.example\t# telemetry\n",
            RuleAction::Block,
            "r",
            "inline",
        );
        assert_eq!(added, 2);
        assert!(list.contains("ads.example"));
        assert!(list.contains("metrics.example"));
    }

    #[test]
    fn test_match_reason_prefers_exact_entry() {
        let mut list = DomainList::default();
        list.insert_domain("ads.example");
        list.push_rule(DomainRule::regex(r"^ads", RuleAction::Block, "pattern").unwrap());
        assert_eq!(list.match_reason("ads.example", "listed"), Some("listed"));
        assert_eq!(list.match_reason("ads2.example", "listed"), Some("pattern"));
        assert_eq!(list.match_reason("news.example", "listed"), None);
    }

    #[test]
    fn test_slash_alone_is_not_regex() {
        let mut list = DomainList::default();
        list.parse_into("//\n/", RuleAction::Block, "r", "inline");
        assert_eq!(list.rule_count(), 0);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  WWW.Example.COM. "), "www.example.com");
        assert_eq!(normalize(""), "");
    }

    #[tokio::test]
    async fn test_load_list_from_files_reports_failures() {
        let good = temp_file("good.txt", "bad.example\n/^evil-\\d+\\.test$/\n");
        let sources = vec![
            good.display().to_string(),
            "/nonexistent/ayasentry/list.txt".to_string(),
        ];
        let fetcher = ListFetcher::local(Duration::from_secs(1));
        let (list, failures) = load_list(&fetcher, &sources, RuleAction::Block, "blocked domain").await;

        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], Error::ListSource { .. }));
        assert!(list.contains("bad.example"));
        assert!(list.contains("evil-42.test"));
        std::fs::remove_file(good).ok();
    }

    #[tokio::test]
    async fn test_remote_source_without_client_fails() {
        let fetcher = ListFetcher::local(Duration::from_secs(1));
        let err = fetcher.read("https://lists.example/block.txt").await.unwrap_err();
        assert!(matches!(err, Error::ListSource { .. }));
    }

    #[tokio::test]
    async fn test_file_scheme_is_stripped() {
        let path = temp_file("scheme.txt", "one.example\n");
        let fetcher = ListFetcher::local(Duration::from_secs(1));
        let content = fetcher
            .read(&format!("file://{}", path.display()))
            .await
            .unwrap();
        assert_eq!(content.trim(), "one.example");
        std::fs::remove_file(path).ok();
    }
}
