use event_bus::retry::{retry_if, RetryConfig};
use event_bus::{BusError, EventBus, InMemoryBus, RedisBus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trip_events::{
    metrics, relay_trips, ActivityLogHandler, BusType, Config, EventPublisher, EventService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trip_events=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cfg = Config::from_env().map_err(anyhow::Error::msg)?;
    tracing::info!(
        bus_type = ?cfg.bus_type,
        publish_timeout_s = cfg.events.publish_timeout.as_secs(),
        subscribe_timeout_s = cfg.events.subscribe_timeout.as_secs(),
        event_buffer_size = cfg.events.event_buffer_size,
        "config loaded"
    );

    let bus: Arc<dyn EventBus> = match cfg.bus_type {
        BusType::Redis => {
            let url = cfg.redis.url();
            let url = url.as_str();
            let bus = retry_if(
                move || async move {
                    let bus = RedisBus::connect(url).await?;
                    bus.ping().await?;
                    Ok::<_, BusError>(bus)
                },
                &RetryConfig::default(),
                "redis_connect",
                BusError::is_transient,
            )
            .await?;
            tracing::info!(address = %cfg.redis.address, tls = cfg.redis.use_tls, "redis connected");
            Arc::new(bus)
        }
        BusType::InMemory => {
            tracing::warn!("using in-memory bus; events stay inside this process");
            Arc::new(InMemoryBus::new())
        }
    };

    let service = Arc::new(EventService::new(bus, cfg.events.clone()));
    service.register_handler("activity-log", Arc::new(ActivityLogHandler::new()))?;

    if cfg.relay_trip_ids.is_empty() {
        tracing::warn!("RELAY_TRIP_IDS is empty; no broker traffic will be relayed");
    }
    let relay_cancel = CancellationToken::new();
    let relays = relay_trips(service.clone(), &relay_cancel, &cfg.relay_trip_ids).await?;
    tracing::info!(
        handlers = ?service.handler_names(),
        trips = ?cfg.relay_trip_ids,
        "trip event relay running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    let cancel = CancellationToken::new();
    let deadline = cfg.events.subscribe_timeout;
    let guard = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        guard.cancel();
    });

    if let Err(err) = service.shutdown(&cancel).await {
        tracing::warn!(error = %err, "shutdown did not complete cleanly");
    }
    relay_cancel.cancel();
    relays.wait().await;

    tracing::info!(metrics = %metrics::global().render(), "final metrics");
    Ok(())
}
