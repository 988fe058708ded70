//! HTTP server bootstrap for the MRO ledger.
//!
//! This module wires together:
//! - configuration
//! - the SQLite pool and stores
//! - core services (ledger, anchor publisher, evidence, verification)
//! - the Axum router

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::anchor::AnchorPublisher;
use crate::config::Config;
use crate::evidence::{EvidenceService, SigningKeyCache};
use crate::infra::{
    AnchorStore, DeadLetterQueue, KeyRegistry, Ledger, LedgerStore, ReceiptStore,
    SqliteAnchorStore, SqliteKeyRegistry, SqliteLedgerStore,
};
use crate::metrics::MetricsRegistry;
use crate::verification::{
    AccessPolicy, AllowAll, AuthzRegistry, NoopAuthzRegistry, VerificationAggregator,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub anchors: Arc<dyn AnchorStore>,
    pub publisher: Arc<AnchorPublisher>,
    pub evidence: Arc<EvidenceService>,
    pub verification: Arc<VerificationAggregator>,
    pub policy: Arc<dyn AccessPolicy>,
    pub metrics: Arc<MetricsRegistry>,
}

/// The stores behind one deployment
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn LedgerStore>,
    pub anchors: Arc<dyn AnchorStore>,
    pub keys: Arc<dyn KeyRegistry>,
}

impl Stores {
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self {
            events: Arc::new(SqliteLedgerStore::new(pool.clone())),
            anchors: Arc::new(SqliteAnchorStore::new(pool.clone())),
            keys: Arc::new(SqliteKeyRegistry::new(pool)),
        }
    }
}

impl AppState {
    /// Assemble services over `stores`.
    ///
    /// The host application's authorization registry and access policy are
    /// injected here; the server binary uses permissive defaults.
    pub fn build(
        config: &Config,
        stores: Stores,
        authz: Arc<dyn AuthzRegistry>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        let dead_letters = Arc::new(DeadLetterQueue::new(&config.dead_letter_path));
        let ledger = Arc::new(
            Ledger::new(stores.events.clone())
                .with_retry_policy(config.retry_policy())
                .with_dead_letters(dead_letters),
        );
        let publisher = Arc::new(AnchorPublisher::new(
            config.anchor.clone(),
            stores.anchors.clone(),
            stores.events.clone(),
            ReceiptStore::new(&config.receipts_dir),
        ));
        let signing = Arc::new(SigningKeyCache::new(config.export_signing_key_path.clone()));
        let evidence = Arc::new(EvidenceService::new(
            stores.events.clone(),
            stores.keys.clone(),
            signing,
        ));
        let metrics = Arc::new(MetricsRegistry::new());
        let verification = Arc::new(VerificationAggregator::new(
            ledger.clone(),
            authz,
            policy.clone(),
            config.verify_rate_limit_per_minute,
            metrics.clone(),
        ));

        Self {
            ledger,
            anchors: stores.anchors,
            publisher,
            evidence,
            verification,
            policy,
            metrics,
        }
    }
}

/// Start the HTTP server.
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting MRO ledger v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Max connections: {}", config.max_connections);
    info!("  Dead-letter file: {}", config.dead_letter_path.display());
    info!("  Receipts directory: {}", config.receipts_dir.display());
    match config.anchor.missing_for_publish() {
        None => info!(
            network = %config.anchor.network,
            chain_id = ?config.anchor.chain_id,
            "Anchor publishing enabled"
        ),
        Some(missing) => info!(reason = %missing, "Anchor publishing unavailable"),
    }

    info!("Connecting to SQLite...");
    let pool = crate::infra::sqlite::connect(&config.database_url, config.max_connections).await?;
    crate::migrations::run_sqlite(&pool).await?;
    info!("Database migrations applied");

    let state = AppState::build(
        &config,
        Stores::sqlite(pool),
        Arc::new(NoopAuthzRegistry),
        Arc::new(AllowAll),
    );
    let app = build_router(state, config.cors_allow_origins.as_deref())?;

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!("MRO ledger is ready to accept connections");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.with_thread_ids(true).try_init()
    };
}

/// Full router: `/api`, health, readiness and metrics (text and JSON).
pub fn build_router(state: AppState, cors_origins: Option<&str>) -> anyhow::Result<Router> {
    let mut router = Router::new()
        .nest("/api", crate::api::router())
        .route("/health", get(crate::api::handlers::health_check))
        .route("/ready", get(crate::api::handlers::readiness_check))
        .route("/metrics", get(crate::api::handlers::prometheus_metrics))
        .route("/metrics/json", get(crate::api::handlers::json_metrics))
        .layer(TraceLayer::new_for_http());

    if let Some(cors_layer) = cors_layer(cors_origins)? {
        router = router.layer(cors_layer);
    }

    Ok(router.with_state(state))
}

fn cors_layer(origins: Option<&str>) -> anyhow::Result<Option<CorsLayer>> {
    let origins = match origins.map(str::trim) {
        Some(origins) if !origins.is_empty() => origins,
        _ => return Ok(None),
    };

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                HeaderName::from_static(crate::api::ACTOR_HEADER),
            ]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_parsing() {
        assert!(cors_layer(None).unwrap().is_none());
        assert!(cors_layer(Some("  ")).unwrap().is_none());
        assert!(cors_layer(Some("*")).unwrap().is_some());
        assert!(cors_layer(Some("https://a.example, https://b.example"))
            .unwrap()
            .is_some());
        assert!(cors_layer(Some("bad\norigin")).is_err());
    }
}
