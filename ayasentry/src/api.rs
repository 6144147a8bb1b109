use crate::collab::DeviceStore;
use crate::discovery::{DeviceInfo, DeviceQuery};
use crate::manager::{Manager, ManagerStatistics};
use crate::storage::QueryLogFormat;
use crate::vendor::DeviceType;
use axum::{
    extract::{ws::{Message, WebSocket}, ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub manager: Arc<Manager>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    dns_queries: Counter,
    dns_responses: Counter,
    responses_blocked: Counter,
    dhcp_packets: Counter,
    rogue_servers: Counter,
    tls_handshakes: Counter,
    devices: Gauge,
}

fn catch_up(counter: &Counter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let dns_queries = Counter::default();
        let dns_responses = Counter::default();
        let responses_blocked = Counter::default();
        let dhcp_packets = Counter::default();
        let rogue_servers = Counter::default();
        let tls_handshakes = Counter::default();
        let devices = Gauge::default();

        registry.register(
            "ayasentry_dns_queries",
            "DNS queries observed",
            dns_queries.clone(),
        );
        registry.register(
            "ayasentry_dns_responses",
            "DNS responses observed",
            dns_responses.clone(),
        );
        registry.register(
            "ayasentry_dns_responses_blocked",
            "DNS responses rejected by the response filter",
            responses_blocked.clone(),
        );
        registry.register(
            "ayasentry_dhcp_packets",
            "DHCP discover, offer, request and ack packets observed",
            dhcp_packets.clone(),
        );
        registry.register(
            "ayasentry_dhcp_rogue_servers",
            "Offers or acks from untrusted DHCP servers",
            rogue_servers.clone(),
        );
        registry.register(
            "ayasentry_tls_handshakes",
            "TLS ClientHello messages observed",
            tls_handshakes.clone(),
        );
        registry.register(
            "ayasentry_devices",
            "Devices currently in the inventory",
            devices.clone(),
        );

        Self {
            registry,
            dns_queries,
            dns_responses,
            responses_blocked,
            dhcp_packets,
            rogue_servers,
            tls_handshakes,
            devices,
        }
    }

    /// Counters are monotonic, so move each one forward by the delta since
    /// the last scrape.
    fn sync(&self, stats: &ManagerStatistics) {
        if let Some(dns) = &stats.dns {
            catch_up(&self.dns_queries, dns.queries_processed);
            catch_up(&self.dns_responses, dns.responses_processed);
        }
        if let Some(filter) = &stats.response_filter {
            catch_up(&self.responses_blocked, filter.stats.responses_blocked);
        }
        if let Some(dhcp) = &stats.dhcp {
            catch_up(
                &self.dhcp_packets,
                dhcp.discovers + dhcp.offers + dhcp.requests + dhcp.acks,
            );
            catch_up(&self.rogue_servers, dhcp.rogue_servers_detected);
        }
        if let Some(tls) = &stats.tls {
            catch_up(&self.tls_handshakes, tls.handshakes_observed);
        }
        let devices = stats.discovery.as_ref().map_or(0, |d| d.database_size);
        self.devices.set(devices as i64);
    }

    fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    state: crate::manager::ManagerState,
    uptime_seconds: u64,
}

#[derive(Deserialize)]
pub struct SearchParams {
    q: Option<String>,
}

#[derive(Deserialize)]
pub struct QueryLogParams {
    limit: Option<usize>,
    format: Option<String>,
}

fn error(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/devices", get(get_devices))
        .route("/api/devices/search", get(search_devices))
        .route("/api/devices/lookup/:key", get(lookup_device))
        .route("/api/devices/type/:device_type", get(devices_by_type))
        .route("/api/queries", get(get_queries))
        .route("/api/stream", get(ws_handler))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| s.parse::<IpNet>().ok())
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        tracing::debug!(%ip, "API request refused by allowlist");
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let manager_state = state.manager.state();
    let status = if state.manager.is_running() || !state.manager.config().enabled {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status,
        state: manager_state,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<ManagerStatistics> {
    Json(state.manager.statistics())
}

/// Live inventory when discovery runs, otherwise whatever was persisted.
async fn get_devices(State(state): State<Arc<AppState>>) -> Response {
    if let Some(discovery) = state.manager.discovery() {
        return Json(discovery.devices()).into_response();
    }
    match state.manager.storage() {
        Some(storage) => match storage.list() {
            Ok(devices) => Json(devices).into_response(),
            Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
        },
        None => Json(Vec::<DeviceInfo>::new()).into_response(),
    }
}

async fn search_devices(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Json<Vec<DeviceInfo>> {
    let q = params.q.unwrap_or_default();
    let devices = state
        .manager
        .discovery()
        .map(|d| d.search(&q))
        .unwrap_or_default();
    Json(devices)
}

async fn lookup_device(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    let query: DeviceQuery = key.parse().unwrap_or_else(|never| match never {});
    match state.manager.discovery().and_then(|d| d.lookup(&query)) {
        Some(device) => Json(device).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("no device matches '{key}'")),
    }
}

async fn devices_by_type(
    State(state): State<Arc<AppState>>,
    Path(device_type): Path<String>,
) -> Response {
    let device_type: DeviceType = match device_type.parse() {
        Ok(t) => t,
        Err(e) => return error(StatusCode::BAD_REQUEST, e),
    };
    let devices = state
        .manager
        .discovery()
        .map(|d| d.devices_by_type(device_type))
        .unwrap_or_default();
    Json(devices).into_response()
}

async fn get_queries(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryLogParams>,
) -> Response {
    let limit = params.limit.unwrap_or(100).min(1000);
    let raw = params.format.unwrap_or_else(|| "json".to_string());
    let format: QueryLogFormat = match raw.parse() {
        Ok(f) => f,
        Err(e) => return error(StatusCode::BAD_REQUEST, e),
    };
    let Some(storage) = state.manager.storage() else {
        return error(StatusCode::SERVICE_UNAVAILABLE, "query log storage not started");
    };
    match storage.export_log(limit, &raw) {
        Ok(body) => ([(header::CONTENT_TYPE, format.content_type())], body).into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> Response {
    metrics.sync(&state.manager.statistics());
    match metrics.render() {
        Ok(buf) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            buf,
        )
            .into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));

    loop {
        interval.tick().await;

        let stats = match serde_json::to_string(&state.manager.statistics()) {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode statistics");
                break;
            }
        };

        if socket.send(Message::Text(stats)).await.is_err() {
            break;
        }
    }
}
