//! TOML Configuration File Support
//!
//! Configuration loading for the chat session, supporting a TOML configuration
//! file at `~/.config/chat-conductor/config.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [session]
//! quiet_window_ms = 2500
//! scroll_delay_ms = 50
//! duplicate_window_ms = 1000
//!
//! [chat]
//! default_model = "gpt-4o-mini"
//! error_message = "Sorry, I encountered an error. Please try again."
//! ```
//!
//! # Environment Variables
//!
//! - `CHAT_CONDUCTOR_QUIET_MS`
//! - `CHAT_CONDUCTOR_SCROLL_DELAY_MS`
//! - `CHAT_CONDUCTOR_DUPLICATE_WINDOW_MS`
//! - `CHAT_CONDUCTOR_MODEL`

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::ChatModel;

/// Shortest accepted quiet window
pub const MIN_QUIET_WINDOW: Duration = Duration::from_millis(2000);

/// Longest accepted quiet window
pub const MAX_QUIET_WINDOW: Duration = Duration::from_millis(3000);

/// Text of the synthetic assistant message shown when a backend call fails
pub const DEFAULT_ERROR_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[session]` section: reconciliation timing
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Inactivity window after which a streaming message is finalized
    pub quiet_window_ms: Option<u64>,

    /// Delay before a scroll notification fires
    pub scroll_delay_ms: Option<u64>,

    /// Window in which an identical user message is not appended twice
    pub duplicate_window_ms: Option<u64>,
}

/// `[chat]` section: model and transcript text
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// Model selected when a session starts
    pub default_model: Option<ChatModel>,

    /// Text of the synthetic error message
    pub error_message: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorToml {
    /// Session section
    pub session: SessionToml,

    /// Chat section
    pub chat: ChatToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Configuration of a [`ChatSession`](crate::session::ChatSession)
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Quiet period after which a streaming message is finalized
    pub quiet_window: Duration,

    /// Delay before the UI is asked to scroll
    pub scroll_delay: Duration,

    /// Double-submit guard window for identical user messages
    pub duplicate_window: Duration,

    /// Model selected when the session starts
    pub default_model: ChatModel,

    /// Text of the synthetic assistant error message
    pub error_message: String,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quiet_window: MIN_QUIET_WINDOW,
            scroll_delay: Duration::from_millis(50),
            duplicate_window: Duration::from_millis(1000),
            default_model: ChatModel::default(),
            error_message: DEFAULT_ERROR_MESSAGE.to_string(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SessionConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Set the quiet window
    #[must_use]
    pub fn with_quiet_window(mut self, quiet_window: Duration) -> Self {
        self.quiet_window = quiet_window;
        self
    }

    /// Set the default model
    #[must_use]
    pub fn with_default_model(mut self, model: ChatModel) -> Self {
        self.default_model = model;
        self
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quiet_window < MIN_QUIET_WINDOW || self.quiet_window > MAX_QUIET_WINDOW {
            return Err(ConfigError::ValidationError(format!(
                "quiet window must be between {}ms and {}ms, got {}ms",
                MIN_QUIET_WINDOW.as_millis(),
                MAX_QUIET_WINDOW.as_millis(),
                self.quiet_window.as_millis()
            )));
        }
        if self.scroll_delay >= self.quiet_window {
            return Err(ConfigError::ValidationError(
                "scroll delay must be shorter than the quiet window".to_string(),
            ));
        }
        if self.error_message.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "error message must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-conductor/config.toml` or
/// `~/.config/chat-conductor/config.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-conductor").join("config.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// resulting values are out of range. A missing config file is not an error.
pub fn load_config() -> Result<SessionConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if validation fails.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SessionConfig, ConfigError> {
    let mut config = SessionConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConductorToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut SessionConfig, toml: &ConductorToml) {
    if let Some(ms) = toml.session.quiet_window_ms {
        config.quiet_window = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.session.scroll_delay_ms {
        config.scroll_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.session.duplicate_window_ms {
        config.duplicate_window = Duration::from_millis(ms);
    }
    if let Some(model) = toml.chat.default_model {
        config.default_model = model;
    }
    if let Some(ref message) = toml.chat.error_message {
        config.error_message = message.clone();
    }
}

/// Apply environment overrides, reading variables through `lookup`
fn apply_env_config<F>(config: &mut SessionConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let millis = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());

    if let Some(ms) = millis("CHAT_CONDUCTOR_QUIET_MS") {
        config.quiet_window = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = millis("CHAT_CONDUCTOR_SCROLL_DELAY_MS") {
        config.scroll_delay = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = millis("CHAT_CONDUCTOR_DUPLICATE_WINDOW_MS") {
        config.duplicate_window = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(model) = lookup("CHAT_CONDUCTOR_MODEL") {
        match model.parse::<ChatModel>() {
            Ok(model) => {
                config.default_model = model;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring CHAT_CONDUCTOR_MODEL"),
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Quiet window override (milliseconds)
    pub quiet_window_ms: Option<u64>,

    /// Default model override
    pub default_model: Option<ChatModel>,

    /// Error message override
    pub error_message: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set quiet window override
    #[must_use]
    pub fn with_quiet_window_ms(mut self, ms: u64) -> Self {
        self.quiet_window_ms = Some(ms);
        self
    }

    /// Set default model override
    #[must_use]
    pub fn with_default_model(mut self, model: ChatModel) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Set error message override
    #[must_use]
    pub fn with_error_message(mut self, message: String) -> Self {
        self.error_message = Some(message);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns a validation error if the overridden values are out of range.
    pub fn apply(&self, config: &mut SessionConfig) -> Result<(), ConfigError> {
        if self.quiet_window_ms.is_some()
            || self.default_model.is_some()
            || self.error_message.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ms) = self.quiet_window_ms {
            config.quiet_window = Duration::from_millis(ms);
        }
        if let Some(model) = self.default_model {
            config.default_model = model;
        }
        if let Some(ref message) = self.error_message {
            config.error_message = message.clone();
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
