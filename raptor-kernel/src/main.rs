/**
 * RAPTOR KERNEL - control plane entry point
 *
 * ROLE: loads config, opens the record store, connects the bus, starts the
 * hub loop and status listener, then serves HTTP until SIGINT/SIGTERM.
 */

use anyhow::{Context, Result};
use raptor_bus::{MemoryBus, MessageBus, MqttBus};
use raptor_kernel::config::{load_config, Transport};
use raptor_kernel::http::build_router;
use raptor_kernel::store::{FileStore, RecordStore};
use raptor_kernel::Services;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config().await;
    if config.api_key.is_none() {
        warn!("RAPTOR_API_KEY not set - every protected route will answer 401");
    }

    let store = match &config.store.data_file {
        Some(path) => FileStore::open(path).with_context(|| format!("Failed to open store {}", path.display()))?,
        None => {
            warn!("no store.data_file configured, records live in memory only");
            FileStore::in_memory()
        }
    };
    let seeded = store.seed_nodes(&config.nodes);
    if seeded > 0 {
        info!("[kernel] seeded {seeded} nodes from config");
    }
    let store = Arc::new(store);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let writer = store
        .clone()
        .spawn_writer(Duration::from_millis(config.store.flush_debounce_ms), shutdown.clone());
    let store: Arc<dyn RecordStore> = store;

    let mut mqtt = None;
    let bus: Arc<dyn MessageBus> = match config.bus.transport {
        Transport::Mqtt => {
            let client_id = format!("raptor-kernel-{}", std::process::id());
            let bus = Arc::new(
                MqttBus::connect(&config.bus.mqtt, &client_id)
                    .await
                    .context("Message bus unavailable")?,
            );
            mqtt = Some(bus.clone());
            bus
        }
        Transport::Memory => {
            info!("[kernel] using in-process bus, no agent can reach this kernel");
            Arc::new(MemoryBus::new())
        }
    };

    let services = Services::spawn(&config, store, bus, shutdown.clone());
    let app = build_router(services.state.clone());

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!("[kernel] listening on http://{}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    services.join().await;
    if let Err(e) = writer.await {
        warn!("store writer ended abnormally: {e}");
    }
    if let Some(bus) = mqtt {
        bus.disconnect().await;
    }
    info!("[kernel] stopped");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            _ => {
                warn!("Signal handlers unavailable, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received - shutting down"),
            _ = sigterm.recv() => info!("SIGTERM received - shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received - shutting down");
    }

    shutdown.cancel();
}
