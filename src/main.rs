//! # Voice Bridge - Main Application Entry Point
//!
//! Local service that turns a browser chat UI into a voice conversation with a
//! streaming speech endpoint: microphone in, model audio out.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: HTTP handlers, the endpoint connection and the pumps are async
//! - **threads**: Audio devices are not `Send`, so capture and playback each own a thread
//! - **Arc**: One `VoiceController` shared by every handler and socket
//! - **Result<T, E>**: Startup uses `anyhow::Result`; the pipeline uses `VoiceError`
//!
//! ## Application Architecture:
//! - **config**: Defaults, config.toml and environment variables
//! - **audio**: Capture, sample conversion, playback
//! - **transport**: WebSocket session to the voice endpoint
//! - **voice**: The session controller and its events
//! - **handlers** / **websocket**: HTTP and WebSocket surface for the UI
//! - **health**: Health and metrics endpoints
//! - **error**: Error types and HTTP error responses

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod state;
mod transport;
mod voice;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::Result;
use audio::capture::CpalCapture;
use audio::playback::RodioPlayback;
use config::AppConfig;
use error::AppError;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice::VoiceController;

/// Set once a termination signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Opens the audio backends** (capture is lazy, playback starts its thread)
/// 4. **Serves** the control API and the event WebSocket
/// 5. **Stops the voice session** before exiting so the microphone is released
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.voice.api_key.is_empty() {
        warn!("No API key configured (GEMINI_API_KEY); the endpoint will likely refuse connections");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let shared_config = Arc::new(RwLock::new(config));

    let playback = RodioPlayback::start()?;
    let voice = VoiceController::new(shared_config.clone(), Arc::new(CpalCapture), Arc::new(playback));
    let app_state = AppState::new(shared_config, voice.clone());

    let mut recording = voice.watch_recording();
    tokio::spawn(async move {
        while recording.changed().await.is_ok() {
            let live = *recording.borrow_and_update();
            info!(recording = live, "Microphone {}", if live { "live" } else { "released" });
        }
    });

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // The UI is served from another local origin
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/voice/start", web::post().to(handlers::start_voice))
                    .route("/voice/stop", web::post().to(handlers::stop_voice))
                    .route("/voice/status", web::get().to(handlers::voice_status)),
            )
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
            .route("/health", web::get().to(health::health_check))
            .default_service(web::to(not_found))
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

    // Release the microphone and close the endpoint connection
    voice.stop().await;

    info!("Server stopped gracefully");
    Ok(())
}

async fn not_found(req: actix_web::HttpRequest) -> Result<HttpResponse, AppError> {
    Err(AppError::NotFound(format!("No route for {} {}", req.method(), req.path())))
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g. "debug", "voice_bridge=trace")
/// - If not set, defaults to "voice_bridge=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for Ctrl+C (and SIGTERM on unix) and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                    info!("Received SIGINT");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown flag, checking every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
