//! Actor configuration.
//!
//! This module defines the settings applied to an actor's engine at startup:
//! heap and stack limits, collector tuning, the bootstrap script and console
//! wiring. Every field has a default, so partial documents deserialize.

use crate::runtime::engine::Engine;
use crate::runtime::error::ActorError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_THREAD_NAME: &str = "jsactor-engine";

/// Engine settings for a single actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Engine heap cap in bytes (None = unlimited). Applied once the context
    /// and bootstrap are in place.
    pub memory_limit: Option<usize>,

    /// Maximum interpreter stack size in bytes (None = engine default)
    pub max_stack_size: Option<usize>,

    /// Allocation threshold that triggers a collection (None = engine default)
    pub gc_threshold: Option<usize>,

    /// Script evaluated in global mode before the host registers
    pub bootstrap_script: Option<String>,

    /// Install a `console` object that logs through `tracing` (default: true)
    pub enable_console: bool,

    /// Name of the dedicated OS thread
    pub thread_name: String,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            max_stack_size: None,
            gc_threshold: None,
            bootstrap_script: None,
            enable_console: true,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl ActorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = Some(bytes);
        self
    }

    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    pub fn with_console(mut self, enable: bool) -> Self {
        self.enable_console = enable;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> Result<(), ActorError> {
        for (field, value) in [
            ("memory_limit", self.memory_limit),
            ("max_stack_size", self.max_stack_size),
            ("gc_threshold", self.gc_threshold),
        ] {
            if value == Some(0) {
                return Err(ActorError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    field
                )));
            }
        }
        if self.thread_name.trim().is_empty() {
            return Err(ActorError::InvalidConfig(
                "thread_name cannot be empty".to_string(),
            ));
        }
        if self.thread_name.contains('\0') {
            return Err(ActorError::InvalidConfig(
                "thread_name cannot contain NUL bytes".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings that must be in place before any context exists.
    pub(crate) fn apply_engine_tuning(&self, engine: &Engine) {
        if let Some(bytes) = self.max_stack_size {
            engine.set_max_stack_size(bytes);
        }
        if let Some(bytes) = self.gc_threshold {
            engine.set_gc_threshold(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ActorConfig::default();
        assert!(config.memory_limit.is_none());
        assert!(config.max_stack_size.is_none());
        assert!(config.gc_threshold.is_none());
        assert!(config.bootstrap_script.is_none());
        assert!(config.enable_console);
        assert_eq!(config.thread_name, DEFAULT_THREAD_NAME);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ActorConfig::new()
            .with_memory_limit(32 * 1024)
            .with_max_stack_size(256 * 1024)
            .with_gc_threshold(1024 * 1024)
            .with_bootstrap("var ready = true;")
            .with_console(false)
            .with_thread_name("tenant-7");

        assert_eq!(config.memory_limit, Some(32 * 1024));
        assert_eq!(config.max_stack_size, Some(256 * 1024));
        assert_eq!(config.gc_threshold, Some(1024 * 1024));
        assert_eq!(config.bootstrap_script.as_deref(), Some("var ready = true;"));
        assert!(!config.enable_console);
        assert_eq!(config.thread_name, "tenant-7");
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let err = ActorConfig::new().with_memory_limit(0).validate().unwrap_err();
        assert_eq!(
            err,
            ActorError::InvalidConfig("memory_limit must be greater than zero".to_string())
        );
        assert!(ActorConfig::new().with_max_stack_size(0).validate().is_err());
        assert!(ActorConfig::new().with_gc_threshold(0).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_thread_names() {
        assert!(ActorConfig::new().with_thread_name("  ").validate().is_err());
        assert!(ActorConfig::new().with_thread_name("a\0b").validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_document() {
        let config: ActorConfig =
            serde_json::from_str(r#"{"memory_limit": 65536, "enable_console": false}"#).unwrap();
        assert_eq!(config.memory_limit, Some(65536));
        assert!(!config.enable_console);
        assert_eq!(config.thread_name, DEFAULT_THREAD_NAME);
        assert!(config.bootstrap_script.is_none());
    }

    #[test]
    fn test_serialize_round_trip() {
        let config = ActorConfig::new().with_bootstrap("1 + 1");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ActorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
