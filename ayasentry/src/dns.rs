use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use ayasentry_common::dns as layout;

use crate::config::{Config, DnsConfig};
use crate::error::{DecodeError, Result};
use crate::events::{DnsEvent, DnsQueryEvent, DnsResponseEvent, Endpoints};
use crate::handler::{dispatch, Handler, Slot};
use crate::source::{consume, EventLoader, ProgramSpec};
use crate::stats::{inc, DnsStats, DnsStatsSnapshot};
use crate::task::Tasks;
use crate::wire;

/// Decode one `dns_events` record.
pub fn decode(record: &[u8]) -> std::result::Result<DnsEvent, DecodeError> {
    if record.len() < layout::MIN_RECORD_LEN {
        return Err(DecodeError::TooShort {
            kind: "dns",
            len: record.len(),
            min: layout::MIN_RECORD_LEN,
        });
    }

    let endpoints = Endpoints::decode(record);
    let domain = wire::c_string(record, layout::DOMAIN, layout::DOMAIN_LEN);
    let packet_size = if record.len() >= layout::PACKET_SIZE + 2 {
        wire::u16_le(record, layout::PACKET_SIZE)
    } else {
        0
    };
    let query_id = wire::u16_le(record, layout::QUERY_ID);
    let query_type = wire::u16_le(record, layout::QUERY_TYPE);

    if wire::u8_at(record, layout::IS_RESPONSE) != 0 {
        let response_time_ns = if record.len() >= layout::RECORD_LEN {
            wire::u64_le(record, layout::RESPONSE_TIME_NS)
        } else {
            0
        };
        // Answer sections are not copied out of the kernel; only the count is.
        Ok(DnsEvent::Response(DnsResponseEvent {
            endpoints,
            query_id,
            query_type,
            response_code: wire::u8_at(record, layout::RESPONSE_CODE),
            answer_count: wire::u16_le(record, layout::ANSWER_COUNT),
            domain,
            packet_size,
            response_time: Duration::from_nanos(response_time_ns),
            answers: Vec::new(),
        }))
    } else {
        Ok(DnsEvent::Query(DnsQueryEvent {
            endpoints,
            query_id,
            query_type,
            query_class: wire::u16_le(record, layout::QUERY_CLASS),
            domain,
            packet_size,
        }))
    }
}

pub fn program_spec(config: &Config) -> ProgramSpec {
    config.program_spec(
        &config.dns.object,
        layout::PROGRAM,
        layout::MAP_EVENTS,
        Vec::new(),
    )
}

/// Consumes the DNS socket filter's ring buffer and hands queries and
/// responses to their handlers. Queries and responses share one stream, so
/// a single loop serves both.
pub struct DnsFilter {
    config: DnsConfig,
    spec: ProgramSpec,
    stats: DnsStats,
    on_query: Slot<Handler<DnsQueryEvent>>,
    on_response: Slot<Handler<DnsResponseEvent>>,
    tasks: Tasks,
}

impl DnsFilter {
    pub fn new(config: DnsConfig, spec: ProgramSpec) -> Arc<Self> {
        Arc::new(Self {
            config,
            spec,
            stats: DnsStats::default(),
            on_query: Slot::default(),
            on_response: Slot::default(),
            tasks: Tasks::default(),
        })
    }

    pub fn set_query_handler(&self, handler: Arc<Handler<DnsQueryEvent>>) {
        self.on_query.set(handler);
    }

    pub fn set_response_handler(&self, handler: Arc<Handler<DnsResponseEvent>>) {
        self.on_response.set(handler);
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    pub fn statistics(&self) -> DnsStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn start(self: &Arc<Self>, loader: &dyn EventLoader, parent: &CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("DNS filter disabled");
            return Ok(());
        }
        if self.tasks.is_running() {
            return Ok(());
        }

        let attachment = loader.attach(&self.spec)?;
        let cancel = parent.child_token();
        let this = self.clone();
        let handle = tokio::spawn(consume(attachment.source, cancel.clone(), "dns", move |record| {
            this.handle_record(record)
        }));
        self.tasks.install(cancel, vec![handle]);
        tracing::info!("DNS filter started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.tasks.stop().await?;
        tracing::info!("DNS filter stopped");
        Ok(())
    }

    pub fn handle_record(&self, record: &[u8]) {
        match decode(record) {
            Ok(DnsEvent::Query(query)) => {
                inc(&self.stats.queries_processed);
                if self.config.log_queries {
                    tracing::debug!(
                        domain = %query.domain,
                        qtype = query.query_type,
                        src = %query.endpoints.src_ip,
                        "DNS query"
                    );
                }
                dispatch(&self.on_query, "dns_query", &query);
            }
            Ok(DnsEvent::Response(response)) => {
                inc(&self.stats.responses_processed);
                if self.config.log_responses {
                    tracing::debug!(
                        domain = %response.domain,
                        rcode = response.response_code,
                        answers = response.answer_count,
                        rtt_us = response.response_time.as_micros() as u64,
                        "DNS response"
                    );
                }
                dispatch(&self.on_response, "dns_response", &response);
            }
            Err(e) => {
                inc(&self.stats.parse_errors);
                inc(&self.stats.packets_dropped);
                tracing::warn!(error = %e, "dropping malformed DNS record");
            }
        }
    }
}
