use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcc_console::config::Config;
use mcc_console::db::Database;
use mcc_console::db_storage::PgStore;
use mcc_console::google_ads_client::GoogleAdsClient;
use mcc_console::handlers::{self, AppState};
use mcc_console::metrics_sync;

/// Main entry point for the console API.
///
/// Sets up tracing, configuration, the database pool and migrations, the
/// Google Ads client and services, the periodic metrics sync, then serves
/// the HTTP routes behind CORS and rate limiting.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcc_console=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    let client = GoogleAdsClient::new(&config)?;
    tracing::info!("✓ Google Ads client initialized: {}", config.ads_api_base_url);

    let store = Arc::new(PgStore::new(db.pool.clone()));
    let state = Arc::new(AppState::new(config.clone(), store, client));

    if config.sync_schedule_enabled {
        metrics_sync::spawn_scheduler(
            state.sync.clone(),
            Duration::from_secs(config.sync_interval_secs),
        );
        tracing::info!(
            "Metrics sync scheduled every {}s",
            config.sync_interval_secs
        );
    } else {
        tracing::info!("Scheduled metrics sync disabled");
    }

    // 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let protected_routes = handlers::api_routes().layer(
        ServiceBuilder::new()
            .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
