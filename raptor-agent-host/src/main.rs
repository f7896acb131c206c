use anyhow::{Context, Result};
use raptor_agent_host::{Agent, AgentConfig, DockerRuntime, LifecycleExecutor};
use raptor_bus::MqttBus;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🤖 Raptor Agent Host v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load()
        .await
        .context("Failed to load agent configuration")?;

    if AgentConfig::is_first_time_setup() {
        match config.save().await {
            Ok(path) => info!("Wrote default configuration to {}", path.display()),
            Err(e) => warn!("Could not write default configuration: {e:#}"),
        }
    }

    info!(
        node_id = config.agent.node_id,
        hostname = %config.agent.hostname,
        broker = %format!("{}:{}", config.mqtt.bus.host, config.mqtt.bus.port),
        "agent configured"
    );

    // The agent is useless without its subscription: a broker that does not answer is fatal.
    let bus = MqttBus::connect(&config.mqtt.bus, &config.client_id())
        .await
        .context("Message bus unavailable")?;
    let bus = Arc::new(bus);

    let runtime = DockerRuntime::connect(config.docker.host.as_deref(), config.docker.timeout_secs)
        .context("Failed to create Docker client")?;
    match runtime.ping().await {
        Ok(()) => info!(endpoint = runtime.endpoint(), "Docker engine reachable"),
        Err(e) => warn!("Docker engine not reachable yet, commands will fail until it is: {e}"),
    }

    let directory = config.build_directory()?;
    let executor = LifecycleExecutor::new(config.agent.node_id, Arc::new(runtime), directory, bus.clone())
        .with_label_key(config.docker.label_key.clone())
        .with_grace_period(config.grace_period());

    let agent = Agent::new(Arc::new(executor), bus.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    agent.run(shutdown).await.context("Agent execution failed")?;

    bus.disconnect().await;
    info!("Raptor Agent Host stopped");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            _ => {
                warn!("Signal handlers unavailable, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received - initiating graceful shutdown"),
            _ = sigterm.recv() => info!("SIGTERM received - initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received - initiating graceful shutdown");
    }

    shutdown.cancel();
}
