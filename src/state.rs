//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<AppConfig>>
//! - **Arc**: The handlers and the voice controller all hold the same config
//! - **RwLock**: Many readers (every start, every GET) or one writer (PUT)
//! - The controller clones the config at the beginning of each start, so an
//!   update never changes a session that is already running
//!
//! ### Arc<VoiceController>
//! The controller is internally synchronized; handlers only need a shared
//! reference to call `start`/`stop` and read observables.

use crate::config::AppConfig;
use crate::voice::VoiceController;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// The one voice session controller of this process
    pub voice: Arc<VoiceController>,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    /// Wrap a controller built on `config`.
    ///
    /// ## Parameters:
    /// - `config`: The same `Arc` the controller reads at every start
    /// - `voice`: The controller
    pub fn new(config: Arc<RwLock<AppConfig>>, voice: Arc<VoiceController>) -> Self {
        Self {
            config,
            voice,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so no handler holds it while
    /// building a response.
    pub fn get_config(&self) -> AppConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the configuration after validating it.
    ///
    /// The running voice session keeps its settings; the next start uses these.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        match self.config.write() {
            Ok(mut config) => *config = new_config,
            Err(poisoned) => *poisoned.into_inner() = new_config,
        }
        Ok(())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
