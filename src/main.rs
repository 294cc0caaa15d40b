//! # Voice Relay Backend - Main Application Entry Point
//!
//! Sets up an Actix-web server carrying one WebSocket endpoint for real-time
//! voice relay plus a small HTTP surface for health, metrics and runtime
//! configuration.
//!
//! ## Application Architecture:
//! - **config**: configuration management (TOML file + environment variables)
//! - **state**: shared application state and metrics
//! - **session**: the per-connection session coordinator and state machine
//! - **websocket**: the duplex voice socket (frame multiplexer + actor)
//! - **audio**: codec bridge (inbound) and playback decoder (outbound edge)
//! - **backend**: the AI speech backend wire client
//! - **health**: health check and metrics endpoints
//! - **middleware**: request logging and per-endpoint metrics
//! - **error**: error types and HTTP error responses

mod audio;
mod backend;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use session::SessionManager;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag set by the signal handler task and polled by the
/// main select loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// 1. Loads and validates configuration
/// 2. Sets up structured logging
/// 3. Creates the shared state and the cross-session manager
/// 4. Starts the HTTP server with the voice socket and API routes
/// 5. Waits for a shutdown signal and stops the server gracefully
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, backend model {}",
        config.server.host, config.server.port, config.backend.model
    );
    if config.backend.api_key.is_none() {
        info!("No backend API key configured; connecting without one");
    }

    let app_state = AppState::new(config.clone());
    let session_manager = SessionManager::new(config.performance.max_concurrent_sessions);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let session_manager_data = web::Data::from(session_manager);
    let server = HttpServer::new(move || {
        // Browsers talk to this server directly, so CORS stays permissive.
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(session_manager_data.clone())
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            // The duplex voice channel; everything after the upgrade is
            // handled by the VoiceSocket actor.
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            // Root-level health check for load balancers
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing with console output.
///
/// `RUST_LOG` controls the filter; the default keeps this crate at debug and
/// actix-web at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and flip the shutdown flag.
///
/// Graceful shutdown lets in-flight requests finish and gives socket actors
/// a chance to release their backend connections.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag until it is set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
