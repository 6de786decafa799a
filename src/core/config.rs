//! Engine configuration
//!
//! Device and antialiasing preferences are read once at startup from a RON or
//! JSON file. Every field has a default, so partial files are fine.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compute::DeviceSelector;
use crate::rtt::AntiAliasing;

/// Compute subsystem preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Whether the compute subsystem is started at all
    pub enabled: bool,
    /// Active device request
    pub device: DeviceSelector,
    /// Enumerate every device of every platform instead of a single platform
    pub use_platform_devices: bool,
    /// Platform to enumerate when `use_platform_devices` is false
    pub platform_index: usize,
    /// Directory kernel files are loaded from
    pub kernel_path: PathBuf,
    /// Directory build logs and cached programs are written to
    pub cache_path: PathBuf,
    /// Empty the cache directory on start
    pub clear_cache: bool,
    /// Options added to every kernel build (e.g. `-D FAST_MATH`)
    pub build_options: String,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: DeviceSelector::FastestGpu,
            use_platform_devices: false,
            platform_index: 0,
            kernel_path: PathBuf::from("data/kernels"),
            cache_path: PathBuf::from("data/cache"),
            clear_cache: false,
            build_options: String::new(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Screen width in pixels
    pub width: u32,
    /// Screen height in pixels
    pub height: u32,
    /// Vertical field of view in degrees
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    pub anti_aliasing: AntiAliasing,
    /// Inferred render scale step (0-4); the scene renders at (scale*12.5+50)% of the screen
    pub inferred_scale: u32,
    pub compute: ComputeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fov: 72.0,
            near: 1.0,
            far: 1000.0,
            anti_aliasing: AntiAliasing::None,
            inferred_scale: 4,
            compute: ComputeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set screen size
    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set near/far planes
    #[must_use]
    pub fn with_planes(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    /// Set antialiasing mode
    #[must_use]
    pub fn with_anti_aliasing(mut self, anti_aliasing: AntiAliasing) -> Self {
        self.anti_aliasing = anti_aliasing;
        self
    }

    /// Set inferred render scale step (clamped to 0-4)
    #[must_use]
    pub fn with_inferred_scale(mut self, scale: u32) -> Self {
        self.inferred_scale = scale.min(4);
        self
    }

    /// Set compute preferences
    #[must_use]
    pub fn with_compute(mut self, compute: ComputeConfig) -> Self {
        self.compute = compute;
        self
    }

    /// Load a config from a RON file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or deserialization fails
    pub fn load_ron(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_ron_str(&content)
    }

    /// Parse a config from RON text
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails
    pub fn from_ron_str(content: &str) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(|e| ConfigError::DeserializeError(e.to_string()))
    }

    /// Save the config to a RON file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or serialization fails
    pub fn save_ron(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        fs::write(path, ron_string).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Load a config from a JSON file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or deserialization fails
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::DeserializeError(e.to_string()))
    }

    /// Save the config to a JSON file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or serialization fails
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json_string = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        fs::write(path, json_string).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }
}

/// Errors that can occur while loading or saving a config
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// IO error
    IoError(String),
    /// Serialization error
    SerializeError(String),
    /// Deserialization error
    DeserializeError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "IO error: {e}"),
            Self::SerializeError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializeError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::Vendor;

    #[test]
    fn test_partial_ron_uses_defaults() {
        let config = EngineConfig::from_ron_str(
            r#"(
                width: 640,
                height: 480,
                anti_aliasing: "SSAA_4_3_FXAA",
                compute: (device: Vendor(Nvidia)),
            )"#,
        )
        .unwrap();

        assert_eq!(config.width, 640);
        assert_eq!(config.height, 480);
        assert_eq!(config.anti_aliasing, AntiAliasing::Ssaa4_3Fxaa);
        assert_eq!(config.compute.device, DeviceSelector::Vendor(Vendor::Nvidia));
        assert_eq!(config.inferred_scale, 4);
        assert!(config.compute.enabled);
    }

    #[test]
    fn test_json_roundtrip_through_file() {
        let dir = std::env::temp_dir().join(format!("lumen-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.json");

        let config = EngineConfig::new()
            .with_size(800, 600)
            .with_anti_aliasing(AntiAliasing::Msaa4)
            .with_inferred_scale(9);
        config.save_json(&path).unwrap();

        let loaded = EngineConfig::load_json(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.inferred_scale, 4);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_bad_ron_is_reported() {
        let err = EngineConfig::from_ron_str("(width: \"wide\")").unwrap_err();
        assert!(matches!(err, ConfigError::DeserializeError(_)));
    }
}
