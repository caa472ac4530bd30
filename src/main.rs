use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_relay::backend::redis::{RedisEventStore, RedisFanoutBus};
use event_relay::backend::{EventStore, FanoutBus};
use event_relay::config::RelayConfig;
use event_relay::gateway::BroadcastManager;
use event_relay::router::{EventProcessor, PendingReclaimer, ShardConsumer};
use event_relay::server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "event_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env()?;
    tracing::info!(
        domains = config.domains.len(),
        partitions = config.stream_keys().len(),
        group = %config.consumer_group,
        "starting event relay"
    );

    let store: Arc<dyn EventStore> = Arc::new(RedisEventStore::connect(&config.streams_url).await?);
    let bus: Arc<dyn FanoutBus> = Arc::new(RedisFanoutBus::connect(&config.pubsub_url).await?);

    let processor = Arc::new(EventProcessor::new(
        store.clone(),
        bus.clone(),
        config.state_ttl,
        config.marker_ttl,
    ));

    let consumer = ShardConsumer::new(store.clone(), processor.clone(), &config);
    consumer.setup().await?;
    let reclaimer = PendingReclaimer::new(
        store.clone(),
        processor,
        consumer.streams().to_vec(),
        &config,
    );

    let cancel = CancellationToken::new();
    let consumer_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };
    let reclaimer_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { reclaimer.run(cancel).await })
    };

    let manager = Arc::new(BroadcastManager::new(store, bus, config.clone()));
    let app = build_router(AppState::new(manager.clone(), config.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    manager.shutdown();
    let _ = consumer_task.await;
    let _ = reclaimer_task.await;
    tracing::info!("event relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
