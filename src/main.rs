mod config;
mod db;
mod docs;
mod exec;
mod fanout;
mod handlers;
mod models;
mod presence;
mod registry;
mod routes;
mod state;
mod sync;
mod utils;
mod websocket;

use std::panic;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use config::Config;
use db::PgStore;
use docs::ApiDoc;
use exec::{
    default_profiles, DockerProvider, ExecOrchestrator, JobLimits, ProcessProvider,
    SandboxProvider,
};
use fanout::{run_relay, FanoutBus, LocalFanout, RedisFanout};
use presence::PresenceBroadcaster;
use registry::SessionRegistry;
use routes::create_api_routes;
use state::AppState;
use sync::SyncEngine;

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "nexus_collab=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    if config.is_development() {
        info!("Running in development mode");
    }

    // Durable store must be reachable at startup; serving a workspace with no
    // persistence guarantee is worse than not starting.
    let Some(db_url) = config.db_url.clone() else {
        error!("No DB_URL configured, refusing to start without durable storage");
        std::process::exit(1);
    };
    let store = match PgStore::connect(&db_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Durable store unreachable at startup: {}", e);
            std::process::exit(1);
        }
    };
    info!("Durable store initialized");

    // Fanout bus: shared Redis channel when configured, local-only otherwise.
    // A failed Redis connection degrades to local-only rather than crashing.
    let fanout_bus: Arc<dyn FanoutBus> = match &config.redis_url {
        Some(redis_url) => match RedisFanout::connect(redis_url).await {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                warn!("Redis fanout unavailable, falling back to local-only delivery: {}", e);
                Arc::new(LocalFanout::new())
            }
        },
        None => {
            info!("No REDIS_URL configured, using local-only fanout");
            Arc::new(LocalFanout::new())
        }
    };

    let registry = Arc::new(SessionRegistry::new(fanout_bus.clone()));
    tokio::spawn(run_relay(registry.clone(), fanout_bus));

    let sync = Arc::new(SyncEngine::new(
        store,
        registry.clone(),
        config.persist_debounce(),
    ));
    let presence = PresenceBroadcaster::new(registry.clone());

    let provider: Arc<dyn SandboxProvider> = match config.sandbox_backend.as_str() {
        "process" => {
            warn!("Using the restricted subprocess sandbox backend");
            Arc::new(ProcessProvider)
        }
        _ => Arc::new(DockerProvider),
    };
    let exec = ExecOrchestrator::new(
        default_profiles(),
        provider,
        config.exec_max_jobs,
        JobLimits {
            timeout: config.exec_timeout(),
            max_output_bytes: config.exec_output_limit_bytes,
        },
    );

    let app_state = Arc::new(AppState {
        registry,
        sync,
        presence,
        exec,
    });

    // Create API routes
    let api_routes = create_api_routes(app_state.clone());

    // Combine all routes
    let app_routes = Router::new()
        // Mount API routes
        .nest("/api", api_routes)
        // Room websocket
        .route(
            "/ws/:room_id",
            get(websocket::handler::websocket_handler).with_state(app_state),
        )
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start the HTTP/WebSocket server
    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("Server running on http://{}", config.server_address());
    info!("WebSocket available at ws://{}/ws/:room_id", config.server_address());
    info!("Swagger UI available at http://{}/swagger", config.server_address());

    axum::serve(listener, app_routes)
        .await
        .expect("Server failed to start");
}
