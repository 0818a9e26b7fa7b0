use std::path::PathBuf;

use crate::config::AppConfig;
use crate::core::EventSink;
use crate::error::ConfigError;

/// State owned by the foreground flow and handed to every component call.
pub struct AppContext {
    pub config_path: PathBuf,
    pub config: AppConfig,
    pub events: EventSink,
}

impl AppContext {
    pub fn new(config_path: PathBuf, config: AppConfig, events: EventSink) -> Self {
        Self {
            config_path,
            config,
            events,
        }
    }

    pub fn save_config(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }
}
