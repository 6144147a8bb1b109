use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use ayasentry_common::tls as layout;

use crate::config::{Config, TlsConfig};
use crate::error::{DecodeError, Result};
use crate::events::{tls_version_name, Endpoints, TlsHandshakeEvent};
use crate::handler::{dispatch, Handler, Slot};
use crate::source::{consume, EventLoader, ProgramSpec};
use crate::stats::{inc, TlsStats, TlsStatsSnapshot};
use crate::task::Tasks;
use crate::wire;

pub fn decode(record: &[u8]) -> std::result::Result<TlsHandshakeEvent, DecodeError> {
    if record.len() < layout::MIN_RECORD_LEN {
        return Err(DecodeError::TooShort {
            kind: "tls",
            len: record.len(),
            min: layout::MIN_RECORD_LEN,
        });
    }

    let ja3_hash = (0..layout::JA3_WORDS)
        .map(|i| format!("{:08x}", wire::u32_le(record, layout::JA3 + i * 4)))
        .collect::<String>();

    Ok(TlsHandshakeEvent {
        endpoints: Endpoints::decode(record),
        version: wire::u16_le(record, layout::VERSION),
        cipher_suite: wire::u16_le(record, layout::CIPHER_SUITE),
        sni: wire::c_string(record, layout::SNI, layout::SNI_LEN),
        ja3_hash,
        packet_size: wire::u16_le(record, layout::PACKET_SIZE),
    })
}

pub fn program_spec(config: &Config) -> ProgramSpec {
    config.program_spec(
        &config.tls.object,
        layout::PROGRAM,
        layout::MAP_EVENTS,
        Vec::new(),
    )
}

pub struct TlsFilter {
    config: TlsConfig,
    spec: ProgramSpec,
    stats: TlsStats,
    on_handshake: Slot<Handler<TlsHandshakeEvent>>,
    tasks: Tasks,
}

impl TlsFilter {
    pub fn new(config: TlsConfig, spec: ProgramSpec) -> Arc<Self> {
        Arc::new(Self {
            config,
            spec,
            stats: TlsStats::default(),
            on_handshake: Slot::default(),
            tasks: Tasks::default(),
        })
    }

    pub fn set_handshake_handler(&self, handler: Arc<Handler<TlsHandshakeEvent>>) {
        self.on_handshake.set(handler);
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    pub fn statistics(&self) -> TlsStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn start(self: &Arc<Self>, loader: &dyn EventLoader, parent: &CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("TLS filter disabled");
            return Ok(());
        }
        if self.tasks.is_running() {
            return Ok(());
        }

        let attachment = loader.attach(&self.spec)?;
        let cancel = parent.child_token();
        let this = self.clone();
        let handle = tokio::spawn(consume(attachment.source, cancel.clone(), "tls", move |record| {
            this.handle_record(record)
        }));
        self.tasks.install(cancel, vec![handle]);
        tracing::info!("TLS filter started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.tasks.stop().await?;
        tracing::info!("TLS filter stopped");
        Ok(())
    }

    pub fn handle_record(&self, record: &[u8]) {
        let mut event = match decode(record) {
            Ok(event) => event,
            Err(e) => {
                inc(&self.stats.parse_errors);
                tracing::warn!(error = %e, "dropping malformed TLS record");
                return;
            }
        };
        if !self.config.extract_sni {
            event.sni.clear();
        }
        if !self.config.ja3_fingerprinting {
            event.ja3_hash.clear();
        }

        inc(&self.stats.handshakes_observed);
        if self.config.log_handshakes {
            tracing::debug!(
                sni = %event.sni,
                version = tls_version_name(event.version),
                cipher = event.cipher_suite,
                ja3 = %event.ja3_hash,
                src = %event.endpoints.src_ip,
                dst = %event.endpoints.dst_ip,
                "TLS handshake"
            );
        }
        dispatch(&self.on_handshake, "tls_handshake", &event);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    pub(crate) fn tls_record(sni: &str) -> Vec<u8> {
        let mut buf = vec![0u8; 120];
        buf[16..20].copy_from_slice(&[192, 168, 1, 20]);
        buf[20..24].copy_from_slice(&[140, 82, 121, 4]);
        buf[24..26].copy_from_slice(&51515u16.to_le_bytes());
        buf[26..28].copy_from_slice(&443u16.to_le_bytes());
        buf[layout::VERSION..layout::VERSION + 2].copy_from_slice(&0x0303u16.to_le_bytes());
        buf[layout::CIPHER_SUITE..layout::CIPHER_SUITE + 2]
            .copy_from_slice(&0x1301u16.to_le_bytes());
        buf[layout::SNI..layout::SNI + sni.len()].copy_from_slice(sni.as_bytes());
        for (i, word) in [0xdeadbeefu32, 0x1, 0xabc, 0].iter().enumerate() {
            let at = layout::JA3 + i * 4;
            buf[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
        buf[layout::PACKET_SIZE..layout::PACKET_SIZE + 2].copy_from_slice(&517u16.to_le_bytes());
        buf
    }

    #[test]
    fn test_decode_handshake() {
        let event = decode(&tls_record("github.com")).unwrap();
        assert_eq!(event.sni, "github.com");
        assert_eq!(event.version, 0x0303);
        assert_eq!(event.cipher_suite, 0x1301);
        assert_eq!(event.ja3_hash, "deadbeef0000000100000abc00000000");
        assert_eq!(event.packet_size, 517);
        assert_eq!(event.endpoints.dst_port, 443);
    }

    #[test]
    fn test_sni_filling_whole_buffer() {
        let long = "a".repeat(layout::SNI_LEN);
        let event = decode(&tls_record(&long)).unwrap();
        assert_eq!(event.sni.len(), layout::SNI_LEN);
    }

    #[test]
    fn test_short_record_counted() {
        let filter = TlsFilter::new(TlsConfig::default(), program_spec(&Config::default()));
        filter.handle_record(&[0u8; layout::MIN_RECORD_LEN - 1]);
        assert_eq!(filter.statistics().parse_errors, 1);
        assert_eq!(filter.statistics().handshakes_observed, 0);
    }

    #[test]
    fn test_disabled_extraction_blanks_fields() {
        let config = TlsConfig {
            extract_sni: false,
            ja3_fingerprinting: false,
            ..TlsConfig::default()
        };
        let filter = TlsFilter::new(config, program_spec(&Config::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        filter.set_handshake_handler(Arc::new(move |e: &TlsHandshakeEvent| -> anyhow::Result<()> {
            s.lock().unwrap().push(e.clone());
            Ok(())
        }));

        filter.handle_record(&tls_record("example.org"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].sni.is_empty());
        assert!(seen[0].ja3_hash.is_empty());
    }
}
