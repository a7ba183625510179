//! Read-only HTTP query API over the notification store.
use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use sqlx::postgres::PgPoolOptions;

use config::Config;
use notify_common::metrics::setup_metrics_routes;
use notify_common::store::PgNotificationStore;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to the database");
    let store = PgNotificationStore::from_pool(pool);

    let app = handlers::add_routes(Router::new(), store);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start notify-api http server, {}", e),
    }
}
