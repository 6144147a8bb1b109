//! Lock-free counters and their point-in-time snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

macro_rules! counters {
    ($(#[$meta:meta])* $name:ident => $snapshot:ident { $($field:ident),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: AtomicU64,)*
        }

        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct $snapshot {
            $(pub $field: u64,)*
        }

        impl $name {
            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    DnsStats => DnsStatsSnapshot {
        queries_processed,
        responses_processed,
        parse_errors,
        packets_dropped,
    }
}

counters! {
    DhcpStats => DhcpStatsSnapshot {
        discovers,
        offers,
        requests,
        acks,
        rogue_servers_detected,
        invalid_packets_blocked,
        unknown_event_types,
        parse_errors,
        transactions_expired,
    }
}

counters! {
    TlsStats => TlsStatsSnapshot {
        handshakes_observed,
        parse_errors,
    }
}

counters! {
    /// Counters for the DNS response filter. `rule_evaluations` only moves
    /// when the list rules are actually consulted, so cache hits leave it
    /// unchanged.
    ResponseFilterStats => ResponseFilterStatsSnapshot {
        responses_checked,
        responses_blocked,
        responses_allowed,
        blocklist_hits,
        allowlist_hits,
        malicious_hits,
        private_hits,
        cache_hits,
        cache_misses,
        validation_errors,
        rule_evaluations,
        list_refreshes,
        list_refresh_failures,
    }
}

counters! {
    DiscoveryStats => DiscoveryStatsSnapshot {
        devices_discovered,
        devices_updated,
        devices_expired,
        devices_rejected,
        vendor_lookups,
        vendor_matches,
        classifications,
        alerts_sent,
    }
}

counters! {
    QueryLogStats => QueryLogStatsSnapshot {
        entries_logged,
        entries_dropped,
        entries_skipped,
        flush_errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = DhcpStats::default();
        inc(&stats.discovers);
        inc(&stats.discovers);
        add(&stats.transactions_expired, 5);

        let snap = stats.snapshot();
        assert_eq!(snap.discovers, 2);
        assert_eq!(snap.transactions_expired, 5);
        assert_eq!(snap.acks, 0);
    }
}
