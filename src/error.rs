//! # Error Handling
//!
//! Two error types live here:
//! - **VoiceError**: failures inside the voice pipeline (device, socket, codec).
//! - **AppError**: what the HTTP control surface returns to the browser UI.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **T**: The success type (what you get when everything works)
//! - **E**: The error type (what you get when something goes wrong)
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types (powers `?`)
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings
//!
//! ## Degradation policy:
//! No voice failure is fatal to the process. Every `VoiceError` that reaches the
//! control surface becomes "voice mode unavailable" for that request only.

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Failures raised by the voice pipeline.
///
/// ## Error Categories:
/// - **PermissionDenied**: microphone refused or missing, session aborted
/// - **Device**: the audio device failed after it was acquired
/// - **Connection**: socket failed to open or errored mid-session (no retry)
/// - **UnsupportedRate**: attempted upsampling, a caller configuration error
/// - **Protocol**: a frame could not be encoded or decoded
/// - **Playback**: the output device could not take a clip
/// - **Cancelled**: `stop()` arrived while `start()` was still in flight
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceError {
    PermissionDenied(String),
    Device(String),
    Connection(String),
    UnsupportedRate { source_rate: u32, target_rate: u32 },
    Protocol(String),
    Playback(String),
    Cancelled,
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::PermissionDenied(msg) => write!(f, "Microphone permission denied: {}", msg),
            VoiceError::Device(msg) => write!(f, "Audio device error: {}", msg),
            VoiceError::Connection(msg) => write!(f, "Connection error: {}", msg),
            VoiceError::UnsupportedRate { source_rate, target_rate } => write!(
                f,
                "Unsupported resample {} Hz -> {} Hz: only downsampling is supported",
                source_rate, target_rate
            ),
            VoiceError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            VoiceError::Playback(msg) => write!(f, "Playback error: {}", msg),
            VoiceError::Cancelled => write!(f, "Voice session start was cancelled"),
        }
    }
}

impl std::error::Error for VoiceError {}

/// Shorthand used across the voice modules.
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Custom error types for the HTTP control surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Forbidden**: The microphone was refused (403 errors)
/// - **Unavailable**: Voice mode could not be started (503 errors)
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::BadRequest("Invalid JSON".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Access to a host resource (the microphone) was refused
    Forbidden(String),

    /// Voice mode is unavailable right now
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Voice unavailable: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "voice_unavailable",
///     "message": "Connection error: connection refused",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "permission_denied", msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "voice_unavailable", msg.clone()),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Voice failures surface to the UI as "voice mode unavailable", except a
/// refused microphone which the user can act on.
impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::PermissionDenied(_) => AppError::Forbidden(err.to_string()),
            VoiceError::UnsupportedRate { .. } => AppError::ConfigError(err.to_string()),
            other => AppError::Unavailable(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use the HTTP error type.
pub type AppResult<T> = Result<T, AppError>;
