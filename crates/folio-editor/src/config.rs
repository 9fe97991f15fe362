use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tunables for the editing-surface controllers. Every field has a default, so a partial
/// JSON object is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Character that opens a slash-command session.
    pub trigger_char: char,
    pub max_suggestions: usize,
    /// Grace period before the floating controls hide.
    pub hide_delay_ms: u64,
    /// Horizontal distance between a block's left edge and the controls overlay.
    pub controls_offset_px: f32,
    pub controls_min_left_px: f32,
    /// How far back the markup scanner looks for an unclosed `<`.
    pub tag_lookback_chars: usize,
    /// How long the settled upload indicator stays visible.
    pub upload_settle_ms: u64,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            trigger_char: '/',
            max_suggestions: 8,
            hide_delay_ms: 180,
            controls_offset_px: 36.0,
            controls_min_left_px: 8.0,
            tag_lookback_chars: 500,
            upload_settle_ms: 300,
        }
    }
}

impl EditorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.trigger_char.is_whitespace() {
            return Err(ConfigError::Invalid(
                "trigger_char must not be whitespace".to_string(),
            ));
        }
        if self.max_suggestions == 0 {
            return Err(ConfigError::Invalid(
                "max_suggestions must be at least 1".to_string(),
            ));
        }
        if self.tag_lookback_chars == 0 {
            return Err(ConfigError::Invalid(
                "tag_lookback_chars must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
