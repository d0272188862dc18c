use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The configuration as shown to the UI. The API key is never echoed back.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "voice": {
            "endpoint": config.voice.endpoint,
            "api_key_configured": !config.voice.api_key.is_empty(),
            "model": config.voice.model,
            "voice_name": config.voice.voice_name,
            "max_output_tokens": config.voice.max_output_tokens,
            "temperature": config.voice.temperature,
            "system_instruction": config.voice.system_instruction,
            "connect_timeout_ms": config.voice.connect_timeout_ms
        },
        "audio": {
            "target_sample_rate": config.audio.target_sample_rate,
            "receive_sample_rate": config.audio.receive_sample_rate,
            "frame_size": config.audio.frame_size
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated; applies from the next voice session",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_view_hides_api_key() {
        let mut config = AppConfig::default();
        config.voice.api_key = "secret".to_string();
        let view = config_view(&config);
        assert_eq!(view["voice"]["api_key_configured"], true);
        assert!(!view.to_string().contains("secret"));
    }
}
