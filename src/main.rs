//! # AudioHook Gateway - Main Application Entry Point
//!
//! Real-time audio gateway: telephony platforms open a WebSocket per call leg,
//! stream audio over it, and receive transcripts back.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The server and every connection run on the actix runtime
//! - **Actors**: One actor per WebSocket connection serialises that connection's events
//! - **Arc & RwLock**: Shared state between HTTP workers and connection actors
//! - **Traits**: Speech, synthesis and authentication backends are swappable
//!
//! ## Application Architecture:
//! - **config**: Configuration (TOML files + environment variables)
//! - **state**: Shared application state and HTTP metrics
//! - **registry**: Live connections and their sessions
//! - **websocket**: Upgrade handler and per-connection actor
//! - **audio**: Audio analysis, window segmentation and sessions
//! - **speech**: Recognition and synthesis backend interfaces
//! - **auth**: Upgrade authentication
//! - **protocol**: JSON messages exchanged with clients
//! - **health / handlers / middleware**: Operational HTTP API
//! - **error**: HTTP error responses

mod audio;
mod auth;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod registry;
mod speech;
mod state;
#[cfg(test)]
mod testing;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handler task once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the speech backends and shared state** (failure here is fatal)
/// 4. **Starts the HTTP server**: operational API plus the AudioHook upgrade
///    endpoint on every other path
/// 5. **Shuts down gracefully**: stops accepting, then tears down every session
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting audiohook-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} ({} @ {} Hz, {} ms windows, recognizer '{}')",
        config.server.host,
        config.server.port,
        config.audio.encoding,
        config.audio.sample_rate,
        config.audio.window_duration_ms,
        config.recognition.backend
    );
    if !config.auth.enabled {
        info!("Upgrade authentication is disabled");
    }

    let app_state = AppState::from_config(config.clone())?;
    let registry = app_state.registry.clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions)),
            )
            .route("/health", web::get().to(health::health_check))
            // Everything else is an AudioHook upgrade: /{channelId}/{transactionId}/...
            .default_service(web::to(websocket::audiohook_upgrade))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let closed = registry.close_all();
    info!("Server stopped gracefully ({} sessions closed at shutdown)", closed);
    Ok(())
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "audiohook_gateway=trace")
/// - If not set, defaults to "audiohook_gateway=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audiohook_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
