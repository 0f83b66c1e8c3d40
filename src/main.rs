use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use market_data_core::bus::Bus;
use market_data_core::config::Config;
use market_data_core::db::Store;
use market_data_core::fanout::FanoutBridge;
use market_data_core::gateway::{self, mock, Gateway};
use market_data_core::health::HealthState;
use market_data_core::ingest::IngestWorker;
use market_data_core::log::Log;
use market_data_core::stream_processor::StreamProcessor;

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env();
    info!(bind = %config.gateway_bind_addr, "starting market-data-core");

    let bus = Bus::new();
    let log = Log::new();
    let store = Store::open(&config.db_path)?;
    let gateway = Gateway::new(config.cors_origins.clone());
    let health = HealthState::new();

    let mut tasks = tokio::task::JoinSet::new();

    if config.mock_realtime {
        warn!("MOCK_REALTIME enabled: synthetic emitter running, live ingest pipeline is skipped");
        let gateway_clone = gateway.clone();
        tasks.spawn(async move {
            mock::run(gateway_clone).await;
            Ok(())
        });
    } else {
        let ingest = IngestWorker::new(&config, bus.clone());
        tasks.spawn(async move { ingest.run().await });

        let processor = StreamProcessor::new(
            bus.clone(),
            log.clone(),
            store.clone(),
            config.batch_size,
            config.flush_interval,
            health.clone(),
        );
        tasks.spawn(async move { processor.run().await });

        let bridge = FanoutBridge::new(
            log.clone(),
            gateway.clone(),
            "gateway-consumer".to_string(),
            config.broadcast_global,
        );
        tasks.spawn(async move { bridge.run().await });
    }

    let router = gateway::router(&config, gateway, health);
    let listener = tokio::net::TcpListener::bind(&config.gateway_bind_addr).await?;
    info!(addr = %config.gateway_bind_addr, "gateway listening");

    tokio::select! {
        result = axum::serve(listener, router) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining");
            tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
                tasks.shutdown().await;
            })
            .await
            .ok();
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "market_data_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
