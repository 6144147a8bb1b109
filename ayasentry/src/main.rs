use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ayasentry::api;
use ayasentry::config::{CliArgs, Config};
use ayasentry::loader::AyaLoader;
use ayasentry::Manager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);
    config.validate()?;

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── Kernel resources ──────────────────────────────────────────────
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        tracing::warn!(code = ret, "failed to remove limit on locked memory");
    }

    // ── Shutdown ──────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown requested");
            shutdown.cancel();
        })?;
    }

    // ── Manager ───────────────────────────────────────────────────────
    let manager = Arc::new(Manager::new(config.clone(), Arc::new(AyaLoader)));
    manager.start(&shutdown).await?;
    tracing::info!(
        interface = config.interface(),
        bpf_dir = %config.bpf_dir.display(),
        "sensor running"
    );

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        manager: manager.clone(),
        start_time: std::time::Instant::now(),
    });
    let app = api::router(app_state, &config.allowed_ips);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    let served = {
        let shutdown = shutdown.clone();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    };

    shutdown.cancel();
    manager.stop().await?;
    served?;
    Ok(())
}
