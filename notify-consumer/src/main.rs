//! Drain the broker queue into the notification store and push stored
//! notifications to the supplier.
use axum::{routing, Router};
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;

use notify_common::health::HealthRegistry;
use notify_common::metrics::{serve, setup_metrics_routes};
use notify_common::queue::PgQueue;
use notify_common::store::PgNotificationStore;

use notify_consumer::config::Config;
use notify_consumer::error::ConsumerError;
use notify_consumer::lock::PgTaskLock;
use notify_consumer::poller::PollTask;
use notify_consumer::processor::MessageProcessor;
use notify_consumer::sender::{HttpSupplierClient, SupplierSender};

#[tokio::main]
async fn main() -> Result<(), ConsumerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration:");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await?;

    let store = PgNotificationStore::from_pool(pool.clone());
    let queue = PgQueue::from_pool(
        config.queue_name.as_str(),
        pool.clone(),
        config.queue_lock_seconds,
    );
    let lock = PgTaskLock::new(pool, config.poll_task_name.as_str());

    let registry = HealthRegistry::new();
    let poller_liveness = registry.register(
        "poller",
        time::Duration::milliseconds((config.poll_interval.0.as_millis() * 3) as i64),
    );
    let sender_liveness = registry.register(
        "sender",
        time::Duration::milliseconds((config.send_interval.0.as_millis() * 3) as i64),
    );

    let processor = MessageProcessor::new(queue, store.clone(), config.max_delivery_count);
    let poller = PollTask::new(processor, lock, config.poll_interval.0, poller_liveness);

    let supplier = HttpSupplierClient::new(&config.supplier_url, config.request_timeout.0)
        .expect("invalid supplier url");
    let sender = SupplierSender::new(supplier, store, config.send_interval.0);

    let router = Router::new()
        .route("/", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(registry.get_status())),
        );
    let router = setup_metrics_routes(router);

    let bind = config.bind();

    tokio::select! {
        _ = poller.run() => {
            tracing::error!("notification poll task exited");
        }
        _ = sender.run(sender_liveness) => {
            tracing::error!("supplier sender task exited");
        }
        result = serve(router, &bind) => {
            if let Err(e) = result {
                tracing::error!("failed to serve the consumer http endpoints: {}", e);
            }
        }
    }

    Ok(())
}

async fn index() -> &'static str {
    "notify-relay consumer"
}
