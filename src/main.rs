mod api;
mod config;
mod database;
mod error;
mod gateways;
mod health;
mod logging;
mod middleware;
mod services;
mod workers;

// Imports
use crate::health::{HealthChecker, HealthStatus};
use crate::logging::init_tracing;
use axum::{
    routing::{get, post},
    Json, Router,
};
use database::{MemoryOrderStore, OrderStore, PgOrderStore};
use dotenv::dotenv;
use gateways::GatewayRegistry;
use middleware::logging::{request_logging_middleware, UuidRequestId};
use services::{
    NotificationSink, OrchestratorConfig, PaymentOrchestrator, RefundCoordinator,
    TracingNotificationSink, WebhookReconciler,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};
use workers::{ReconciliationScheduler, SchedulerConfig};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let skip_db = std::env::var("SKIP_DB")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        "🚀 Starting Coursepay backend service"
    );

    let server_config = config::ServerConfig::from_env()?;
    server_config.validate()?;
    info!(
        host = %server_config.host,
        port = server_config.port,
        "Server configuration loaded"
    );

    // Initialize the order store
    let (db_pool, store): (Option<sqlx::PgPool>, Arc<dyn OrderStore>) = if skip_db {
        info!("⏭️  Skipping database initialization (SKIP_DB=true), using the in-memory store");
        (None, Arc::new(MemoryOrderStore::new()))
    } else {
        info!("📊 Initializing database connection pool...");
        let db_config = config::DatabaseConfig::from_env()?;
        db_config.validate()?;

        let pool = database::init_pool_from_config(&db_config)
            .await
            .map_err(|e| {
                error!("Failed to initialize database pool: {}", e);
                e
            })?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(
            max_connections = db_config.max_connections,
            "✅ Database connection pool initialized, migrations applied"
        );
        (Some(pool.clone()), Arc::new(PgOrderStore::new(pool)))
    };

    // Build the gateway registry from configured provider credentials
    info!("💳 Building payment gateway registry...");
    let registry = Arc::new(GatewayRegistry::from_env());
    if registry.is_empty() {
        warn!("No usable payment gateways configured, order creation will fail until one is");
    }

    let notifier: Arc<dyn NotificationSink> = Arc::new(TracingNotificationSink::new());

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        store.clone(),
        registry.clone(),
        notifier.clone(),
        OrchestratorConfig::from_env(),
    ));
    let refunds = Arc::new(RefundCoordinator::new(
        store.clone(),
        registry.clone(),
        notifier.clone(),
    ));
    let reconciler = Arc::new(WebhookReconciler::new(
        store.clone(),
        registry.clone(),
        notifier.clone(),
    ));

    // Initialize health checker
    let health_checker = HealthChecker::new(db_pool.clone(), registry.clone());

    // Start the reconciliation scheduler
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let scheduler_config = SchedulerConfig::from_env();
    let mut scheduler_handle = None;
    if scheduler_config.enabled {
        info!(
            tick_secs = scheduler_config.tick_interval.as_secs(),
            retry_batch = scheduler_config.retry_batch,
            installment_batch = scheduler_config.installment_batch,
            "Starting reconciliation scheduler"
        );
        let scheduler =
            ReconciliationScheduler::new(store.clone(), orchestrator.clone(), scheduler_config);
        scheduler_handle = Some(tokio::spawn(scheduler.run(worker_shutdown_rx)));
    } else {
        info!("Reconciliation scheduler disabled (SCHEDULER_ENABLED=false)");
    }

    // Create the application router with logging middleware
    info!("🛣️  Setting up application routes...");

    let payments_state = api::payments::PaymentApiState {
        orchestrator: orchestrator.clone(),
        refunds: refunds.clone(),
    };
    let payment_routes = Router::new()
        .route("/payments/orders", post(api::payments::create_order))
        .route("/payments/orders/{id}", get(api::payments::get_order))
        .route(
            "/payments/orders/{id}/sync",
            post(api::payments::sync_order),
        )
        .route(
            "/payments/orders/{id}/refund",
            post(api::payments::request_refund),
        )
        .route(
            "/payments/installments",
            post(api::payments::create_installment_plan),
        )
        .route(
            "/payments/installments/{id}",
            get(api::payments::get_installment_plan),
        )
        .with_state(payments_state);

    let webhook_state = Arc::new(api::webhooks::WebhookState {
        reconciler: reconciler.clone(),
    });
    let webhook_routes = Router::new()
        .route("/webhooks/{gateway}", post(api::webhooks::handle_webhook))
        .with_state(webhook_state);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .route("/health/live", get(liveness))
        .merge(payment_routes)
        .merge(webhook_routes)
        .with_state(AppState { health_checker })
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        );

    info!("✅ Routes configured");

    // Run the server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║          🚀 COURSEPAY BACKEND SERVER IS RUNNING 🚀           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  POST /payments/orders              - Create payment order   ║");
    println!("║  GET  /payments/orders/{{id}}         - Fetch payment order    ║");
    println!("║  POST /payments/orders/{{id}}/sync    - Reconcile with gateway ║");
    println!("║  POST /payments/orders/{{id}}/refund  - Request a refund       ║");
    println!("║  POST /payments/installments        - Create installments    ║");
    println!("║  GET  /payments/installments/{{id}}   - Fetch installment plan ║");
    println!("║  POST /webhooks/{{gateway}}           - Gateway webhook intake ║");
    println!("║  GET  /health                       - Health check           ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    info!(address = %addr, "🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if let Some(handle) = scheduler_handle {
        if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
            error!(error = %e, "Timed out waiting for scheduler shutdown");
        }
    }

    info!("👋 Server shutdown complete");

    Ok(())
}

// Application state
#[derive(Clone)]
struct AppState {
    health_checker: HealthChecker,
}

// Handlers
async fn root() -> &'static str {
    "Welcome to Coursepay Backend API"
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<HealthStatus>, (axum::http::StatusCode, String)> {
    let health_status = state.health_checker.check_health().await;

    // Return 503 if any component is unhealthy
    if !health_status.is_ready() {
        error!("❌ Health check failed - service unhealthy");
        Err((
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable".to_string(),
        ))
    } else {
        Ok(Json(health_status))
    }
}

/// Readiness probe - checks if the service is ready to accept traffic
async fn readiness(
    state: axum::extract::State<AppState>,
) -> Result<Json<HealthStatus>, (axum::http::StatusCode, String)> {
    health(state).await
}

/// Liveness probe - checks if the service is alive (basic check)
async fn liveness() -> &'static str {
    "OK"
}
