//! # Device Configuration
//!
//! Tuning knobs for the device context: validation, frame pacing depth,
//! bindless table capacities and wait bounds. Configurations can be stored
//! as TOML or RON files through the [`Config`] trait.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value is out of range
    #[error("Invalid value: {0}")]
    Invalid(String),
}

/// # Device Configuration
///
/// Configuration for the device context and everything it creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Whether to enable Vulkan validation layers (`None` = debug builds only)
    pub enable_validation: Option<bool>,
    /// Number of frame slots the pacer cycles through
    pub max_frames_in_flight: usize,
    /// Capacity of the bindless image table
    pub max_bindless_images: u32,
    /// Capacity of the bindless image view table
    pub max_bindless_image_views: u32,
    /// Capacity of the bindless buffer table
    pub max_bindless_buffers: u32,
    /// Upper bound for the swapchain acquire fence wait
    pub acquire_timeout_ms: u64,
    /// Upper bound for the frame pacer's wait before reusing a slot
    pub frame_wait_timeout_ms: u64,
    /// Log filter used by [`crate::foundation::logging::init_from_config`]
    pub log_level: String,
}

impl DeviceConfig {
    /// Create a new device configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            enable_validation: None,
            max_frames_in_flight: 2,
            max_bindless_images: 10_000,
            max_bindless_image_views: 10_000,
            max_bindless_buffers: 10_000,
            acquire_timeout_ms: 1_000,
            frame_wait_timeout_ms: 5_000,
            log_level: "info".to_string(),
        }
    }

    /// Set maximum frames in flight
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set the capacity of all bindless tables
    pub fn with_bindless_capacity(mut self, images: u32, image_views: u32, buffers: u32) -> Self {
        self.max_bindless_images = images;
        self.max_bindless_image_views = image_views;
        self.max_bindless_buffers = buffers;
        self
    }

    /// Set the frame pacer wait bound
    pub fn with_frame_wait_timeout(mut self, timeout: Duration) -> Self {
        self.frame_wait_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Resolved validation setting
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Acquire fence wait bound in nanoseconds
    pub fn acquire_timeout_ns(&self) -> u64 {
        self.acquire_timeout_ms.saturating_mul(1_000_000)
    }

    /// Frame slot wait bound in nanoseconds
    pub fn frame_wait_timeout_ns(&self) -> u64 {
        self.frame_wait_timeout_ms.saturating_mul(1_000_000)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("Application name cannot be empty".to_string()));
        }

        if self.max_frames_in_flight == 0 {
            return Err(ConfigError::Invalid("Max frames in flight must be at least 1".to_string()));
        }

        if self.max_frames_in_flight > 8 {
            return Err(ConfigError::Invalid(
                "Max frames in flight should not exceed 8".to_string(),
            ));
        }

        if self.max_bindless_images == 0 || self.max_bindless_image_views == 0 || self.max_bindless_buffers == 0 {
            return Err(ConfigError::Invalid("Bindless table capacities must be non-zero".to_string()));
        }

        if self.acquire_timeout_ms == 0 || self.frame_wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid("Wait timeouts must be non-zero".to_string()));
        }

        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new("Bindless GPU Application")
    }
}

impl Config for DeviceConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(file: &str) -> String {
        std::env::temp_dir()
            .join(format!("bindless_gpu_{}_{}", std::process::id(), file))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_frames_in_flight, 2);
    }

    #[test]
    fn test_frames_in_flight_bounds() {
        assert!(DeviceConfig::default().with_max_frames_in_flight(0).validate().is_err());
        assert!(DeviceConfig::default().with_max_frames_in_flight(9).validate().is_err());
        assert!(DeviceConfig::default().with_max_frames_in_flight(3).validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let path = temp_path("device.toml");
        let config = DeviceConfig::new("toml app").with_max_frames_in_flight(3).with_validation(false);
        config.save_to_file(&path).expect("Should save");

        let loaded = DeviceConfig::load_from_file(&path).expect("Should load");
        assert_eq!(loaded.application_name, "toml app");
        assert_eq!(loaded.max_frames_in_flight, 3);
        assert_eq!(loaded.enable_validation, Some(false));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_ron_partial_file_uses_defaults() {
        let path = temp_path("device.ron");
        std::fs::write(&path, "(application_name: \"ron app\", max_bindless_buffers: 64)").expect("Should write");

        let loaded = DeviceConfig::load_from_file(&path).expect("Should load");
        assert_eq!(loaded.application_name, "ron app");
        assert_eq!(loaded.max_bindless_buffers, 64);
        assert_eq!(loaded.max_frames_in_flight, 2);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_unsupported_extension() {
        let result = DeviceConfig::load_from_file("device.json");
        assert!(matches!(result, Err(ConfigError::Io(_)) | Err(ConfigError::UnsupportedFormat(_))));
        assert!(matches!(
            DeviceConfig::default().save_to_file("device.json"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
