//! The seam between the protocol filters and whatever produces kernel
//! records. Production uses [`crate::loader::AyaLoader`]; tests drive the
//! filters through the channel-backed doubles in [`testing`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A stream of raw records from one kernel ring buffer.
#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next record. `Ok(None)` means the source is closed.
    async fn next_record(&mut self) -> Result<Option<Vec<u8>>>;

    /// Release the underlying handles. Later reads return `Ok(None)`.
    fn close(&mut self);
}

/// A kernel-side table whose values carry a monotonic timestamp.
pub trait TrackingTable: Send {
    fn name(&self) -> &str;

    /// Remove entries older than `max_age_ns` relative to `now_ns`.
    /// Returns the number of entries removed.
    fn expire(&mut self, now_ns: u64, max_age_ns: u64) -> Result<usize>;
}

/// Entries stamped in the future (clock skew between CPUs) are kept.
pub fn is_expired(timestamp_ns: u64, now_ns: u64, max_age_ns: u64) -> bool {
    now_ns > timestamp_ns && now_ns - timestamp_ns > max_age_ns
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// Socket filter on a raw `AF_PACKET` socket bound to the interface.
    #[default]
    Socket,
    /// TC classifier on the interface's ingress hook.
    Tc,
}

/// Everything a loader needs to bring up one protocol's kernel program.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub object: PathBuf,
    pub program: String,
    pub events_map: String,
    pub tables: Vec<ayasentry_common::TrackingTable>,
    pub interface: String,
    pub mode: AttachMode,
}

pub struct Attachment {
    pub source: Box<dyn EventSource>,
    pub tables: Vec<Box<dyn TrackingTable>>,
}

pub trait EventLoader: Send + Sync {
    fn attach(&self, spec: &ProgramSpec) -> Result<Attachment>;
}

/// Current `CLOCK_MONOTONIC` reading, the clock `bpf_ktime_get_ns` uses.
pub fn ktime_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// Drive `source` until it closes or `cancel` fires, handing every record
/// to `on_record` in arrival order. Read errors are logged and the loop
/// carries on.
pub async fn consume<F>(
    mut source: Box<dyn EventSource>,
    cancel: CancellationToken,
    name: &'static str,
    mut on_record: F,
) where
    F: FnMut(&[u8]) + Send,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = source.next_record() => next,
        };

        match next {
            Ok(Some(record)) => on_record(&record),
            Ok(None) => {
                tracing::debug!(source = name, "event source closed");
                break;
            }
            Err(e) => {
                tracing::warn!(source = name, error = %e, "failed to read event record");
                // Yield briefly so a persistently failing source does not spin.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(1)) => {}
                }
            }
        }
    }
    source.close();
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_is_expired() {
        assert!(is_expired(100, 1_000, 500));
        assert!(!is_expired(600, 1_000, 500));
        assert!(!is_expired(2_000, 1_000, 500));
    }

    #[test]
    fn test_ktime_is_monotonic() {
        let a = ktime_now_ns();
        let b = ktime_now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[tokio::test]
    async fn test_consume_preserves_order_until_closed() {
        let (tx, source) = channel_source();
        for i in 0..5u8 {
            tx.send(vec![i]).unwrap();
        }
        drop(tx);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        consume(source, CancellationToken::new(), "test", move |r| {
            s.lock().unwrap().push(r[0]);
        })
        .await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_consume_returns_on_cancel() {
        let (_tx, source) = channel_source();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consume(source, cancel.clone(), "test", |_| {}));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
