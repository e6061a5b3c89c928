use event_bus::{EventBus, InMemoryBus, NatsBus};
use event_streaming::{BusType, RealtimeStreamingSystem, StreamingConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = StreamingConfig::from_env()?;

    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::Nats => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            Arc::new(NatsBus::connect(&config.nats_url).await?)
        }
        BusType::InMemory => {
            tracing::info!("Using in-memory event bus");
            Arc::new(InMemoryBus::new())
        }
    };

    let system = RealtimeStreamingSystem::new(bus, config)?;
    system.start_streaming().await?;
    tracing::info!("Streaming engine running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    let status = system.get_system_status();
    tracing::info!(
        events = status.analytics.total_events,
        pattern_matches = status.cep_matches,
        events_sent = status.producer.events_sent,
        "Final system status"
    );

    system.stop_streaming().await;
    Ok(())
}
