//! Voice session control for the browser UI.
//!
//! - `POST /api/v1/voice/start`: start (or report the already running session)
//! - `POST /api/v1/voice/stop`: stop; always succeeds
//! - `GET /api/v1/voice/status`: state, recording flag, session id, counters

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::voice::StartOutcome;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn start_voice(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let outcome = state.voice.start().await.map_err(AppError::from)?;

    let status = match outcome {
        StartOutcome::Started(_) => "started",
        StartOutcome::AlreadyActive(_) => "already_active",
    };
    info!(session_id = %outcome.session_id(), status, "Voice start requested");

    Ok(HttpResponse::Ok().json(json!({
        "status": status,
        "session_id": outcome.session_id(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

pub async fn stop_voice(state: web::Data<AppState>) -> HttpResponse {
    state.voice.stop().await;

    HttpResponse::Ok().json(json!({
        "status": "stopped",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn voice_status(state: web::Data<AppState>) -> HttpResponse {
    let voice = &state.voice;

    HttpResponse::Ok().json(json!({
        "state": voice.state(),
        "recording": voice.is_recording(),
        "session_id": voice.session_id(),
        "metrics": voice.metrics(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::{CaptureBackend, CaptureHandle};
    use crate::audio::buffer::AudioFrame;
    use crate::audio::playback::PlaybackSink;
    use crate::config::AppConfig;
    use crate::error::{VoiceError, VoiceResult};
    use crate::voice::VoiceController;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::{Arc, RwLock};
    use tokio::sync::mpsc::UnboundedSender;

    struct NoMicrophone;

    impl CaptureBackend for NoMicrophone {
        fn open(
            &self,
            _frame_size: usize,
            _frames: UnboundedSender<AudioFrame>,
        ) -> VoiceResult<Box<dyn CaptureHandle>> {
            Err(VoiceError::PermissionDenied("no input device".to_string()))
        }
    }

    struct Silent;

    impl PlaybackSink for Silent {
        fn play(&self, _wav: Vec<u8>) -> VoiceResult<()> {
            Ok(())
        }
    }

    fn app_state(endpoint: String) -> AppState {
        let mut config = AppConfig::default();
        config.voice.endpoint = endpoint;
        config.voice.connect_timeout_ms = 2_000;
        let config = Arc::new(RwLock::new(config));
        let voice = VoiceController::new(config.clone(), Arc::new(NoMicrophone), Arc::new(Silent));
        AppState::new(config, voice)
    }

    #[actix_web::test]
    async fn test_start_without_endpoint_is_unavailable() {
        // Nothing listens on this port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(endpoint)))
                .route("/api/v1/voice/start", web::post().to(start_voice)),
        )
        .await;

        let req = test::TestRequest::post().uri("/api/v1/voice/start").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "voice_unavailable");
    }

    #[actix_web::test]
    async fn test_stop_and_status_when_idle() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state("ws://127.0.0.1:9".to_string())))
                .route("/api/v1/voice/stop", web::post().to(stop_voice))
                .route("/api/v1/voice/status", web::get().to(voice_status)),
        )
        .await;

        let req = test::TestRequest::post().uri("/api/v1/voice/stop").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "stopped");

        let req = test::TestRequest::get().uri("/api/v1/voice/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "idle");
        assert_eq!(body["recording"], false);
        assert!(body["session_id"].is_null());
        assert_eq!(body["metrics"]["sessions_started"], 0);
    }
}
