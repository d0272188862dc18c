//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special-case environment variables (HOST, PORT, GEMINI_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_VOICE__API_KEY, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so that field names which
//! themselves contain underscores (`api_key`, `voice_name`) survive the mapping.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The HTTP surface (server), the remote endpoint session (voice) and the
/// sample-rate plumbing (audio) change for different reasons, so they are
/// grouped separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub voice: VoiceConfig,
    pub audio: AudioConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only the local browser UI may connect (default)
/// - `port = 8787`: Local control port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote streaming endpoint and the session parameters declared in the setup frame.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional generate-content service
/// - `api_key`: Appended to the endpoint as `?key=...` when non-empty
/// - `model`: Model resource name declared in the setup frame
/// - `voice_name`: Prebuilt voice used for audio responses
/// - `max_output_tokens` / `temperature`: Generation budget and sampling
/// - `system_instruction`: Behavioural instruction for the whole session
/// - `connect_timeout_ms`: Upper bound on the socket handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub system_instruction: String,
    pub connect_timeout_ms: u64,
}

/// Sample-rate plumbing for the pipeline.
///
/// ## Fields:
/// - `target_sample_rate`: Outbound PCM rate required by the endpoint (16 kHz)
/// - `receive_sample_rate`: Rate of inbound binary PCM frames (24 kHz)
/// - `frame_size`: Samples per captured frame at the device rate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub target_sample_rate: u32,
    pub receive_sample_rate: u32,
    pub frame_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only, the UI runs on this machine
                port: 8787,
            },
            voice: VoiceConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "models/gemini-2.0-flash-exp".to_string(),
                voice_name: "Puck".to_string(),
                max_output_tokens: 1024,
                temperature: 0.9,
                system_instruction: "You are a helpful assistant in a voice conversation. Keep answers short and conversational.".to_string(),
                connect_timeout_ms: 10_000,
            },
            audio: AudioConfig {
                target_sample_rate: 16_000,
                receive_sample_rate: 24_000,
                frame_size: 4096,
            },
        }
    }
}

impl VoiceConfig {
    /// The URL actually dialled: the endpoint with the API key attached.
    pub fn endpoint_url(&self) -> String {
        if self.api_key.is_empty() {
            return self.endpoint.clone();
        }
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: Override server port
    /// - `APP_VOICE__VOICE_NAME=Kore`: Override the prebuilt voice
    /// - `APP_AUDIO__FRAME_SIZE=2048`: Smaller capture frames
    /// - `HOST=0.0.0.0`, `PORT=3000`: Special cases for launch scripts
    /// - `GEMINI_API_KEY=...`: Special case for the endpoint key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("voice.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Endpoint is a WebSocket URL
    /// - Model and voice names are present
    /// - Temperature is within [0, 2]
    /// - Sample rates and frame size are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !(self.voice.endpoint.starts_with("ws://") || self.voice.endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Voice endpoint must be a ws:// or wss:// URL"));
        }

        if self.voice.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Voice model cannot be empty"));
        }

        if self.voice.voice_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Voice name cannot be empty"));
        }

        if !(0.0..=2.0).contains(&self.voice.temperature) {
            return Err(anyhow::anyhow!("Temperature must be between 0.0 and 2.0"));
        }

        if self.audio.target_sample_rate == 0 || self.audio.receive_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON change. For example
    /// `{"voice": {"voice_name": "Kore"}}` changes just the voice; the new value
    /// is used the next time a voice session starts.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(voice) = partial_config.get("voice") {
            if let Some(endpoint) = voice.get("endpoint").and_then(|v| v.as_str()) {
                self.voice.endpoint = endpoint.to_string();
            }
            if let Some(api_key) = voice.get("api_key").and_then(|v| v.as_str()) {
                self.voice.api_key = api_key.to_string();
            }
            if let Some(model) = voice.get("model").and_then(|v| v.as_str()) {
                self.voice.model = model.to_string();
            }
            if let Some(voice_name) = voice.get("voice_name").and_then(|v| v.as_str()) {
                self.voice.voice_name = voice_name.to_string();
            }
            if let Some(tokens) = voice.get("max_output_tokens").and_then(|v| v.as_u64()) {
                self.voice.max_output_tokens = u32::try_from(tokens)
                    .map_err(|_| anyhow::anyhow!("max_output_tokens {} is out of range", tokens))?;
            }
            if let Some(temperature) = voice.get("temperature").and_then(|v| v.as_f64()) {
                self.voice.temperature = temperature as f32;
            }
            if let Some(instruction) = voice.get("system_instruction").and_then(|v| v.as_str()) {
                self.voice.system_instruction = instruction.to_string();
            }
            if let Some(timeout) = voice.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                self.voice.connect_timeout_ms = timeout;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(rate) = audio.get("target_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.target_sample_rate = u32::try_from(rate)
                    .map_err(|_| anyhow::anyhow!("target_sample_rate {} is out of range", rate))?;
            }
            if let Some(rate) = audio.get("receive_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.receive_sample_rate = u32::try_from(rate)
                    .map_err(|_| anyhow::anyhow!("receive_sample_rate {} is out of range", rate))?;
            }
            if let Some(frame_size) = audio.get("frame_size").and_then(|v| v.as_u64()) {
                self.audio.frame_size = usize::try_from(frame_size)
                    .map_err(|_| anyhow::anyhow!("frame_size {} is out of range", frame_size))?;
            }
        }

        self.validate()?;
        Ok(())
    }
}
