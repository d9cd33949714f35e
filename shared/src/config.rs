use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ===== CONFIG TYPES =====

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub chunking: ChunkingSection,
    #[serde(default)]
    pub timestamps: TimestampsSection,
    #[serde(default)]
    pub navigation: NavigationSection,
    #[serde(default)]
    pub view: ViewSection,
}

// AppSection carries the config format version so older files can be migrated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppSection {
    pub version: String,
}

impl AppSection {
    /// Current configuration format version
    pub const CURRENT_VERSION: &'static str = "1.0.0";

    pub fn is_supported_version(&self) -> bool {
        matches!(self.version.as_str(), "1.0.0")
    }
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ChunkingSection {
    /// Samples per chunk.
    pub chunk_size: u64,
    /// Channels served when the caller does not pick a channel window.
    pub default_channel_limit: u64,
    /// Wall-clock budget for one `get_concatenated_chunk` call.
    pub time_budget_ms: u64,
    /// Resident chunks per client; unset means unbounded.
    pub cache_capacity: Option<usize>,
}

impl Default for ChunkingSection {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            default_channel_limit: 15,
            time_budget_ms: 2_000,
            cache_capacity: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TimestampsSection {
    pub block_size: u64,
    pub block_cache_capacity: Option<usize>,
    /// Leading timestamps read at initialization to estimate the sampling rate.
    pub initial_probe_count: u64,
    /// Trailing timestamps read at initialization to find the end time.
    pub final_probe_count: u64,
}

impl Default for TimestampsSection {
    fn default() -> Self {
        Self {
            block_size: 100_000,
            block_cache_capacity: None,
            initial_probe_count: 10_000,
            final_probe_count: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NavigationSection {
    pub zoom_factor: f64,
    pub pan_percent: f64,
}

impl Default for NavigationSection {
    fn default() -> Self {
        Self {
            zoom_factor: 1.4,
            pan_percent: 10.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ViewSection {
    /// Values (samples times channels) a view may load at once before it asks to zoom in.
    pub max_visible_values: f64,
    /// Lower bound of the maximum visible duration, in seconds.
    pub min_visible_duration: f64,
    /// Initial visible window, in chunks from the series start.
    pub initial_window_chunks: u64,
    /// Show the whole series on open instead of the initial window.
    pub start_zoomed_out: bool,
}

impl Default for ViewSection {
    fn default() -> Self {
        Self {
            max_visible_values: 8e6,
            min_visible_duration: 0.2,
            initial_window_chunks: 10,
            start_zoomed_out: false,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).context("Failed to parse engine config")?;
        if !config.app.is_supported_version() {
            log::warn!(
                "Config version '{}' is not supported, expected '{}'",
                config.app.version,
                AppSection::CURRENT_VERSION
            );
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize engine config")
    }
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    EngineConfig::from_toml_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.app.version, AppSection::CURRENT_VERSION);
        assert_eq!(config.chunking.default_channel_limit, 15);
        assert_eq!(config.chunking.time_budget_ms, 2_000);
        assert_eq!(config.chunking.cache_capacity, None);
        assert_eq!(config.timestamps.block_size, 100_000);
        assert_eq!(config.timestamps.initial_probe_count, 10_000);
        assert_eq!(config.timestamps.final_probe_count, 10);
        assert_eq!(config.navigation.zoom_factor, 1.4);
        assert_eq!(config.navigation.pan_percent, 10.0);
        assert_eq!(config.view.max_visible_values, 8e6);
        assert_eq!(config.view.min_visible_duration, 0.2);
        assert_eq!(config.view.initial_window_chunks, 10);
        assert!(!config.view.start_zoomed_out);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [chunking]
            chunk_size = 1000
            cache_capacity = 64

            [navigation]
            zoom_factor = 2.0

            [view]
            start_zoomed_out = true
            "#,
        )
        .unwrap();

        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.cache_capacity, Some(64));
        assert_eq!(config.chunking.time_budget_ms, 2_000);
        assert_eq!(config.navigation.zoom_factor, 2.0);
        assert_eq!(config.navigation.pan_percent, 10.0);
        assert_eq!(config.timestamps, TimestampsSection::default());
        assert!(config.view.start_zoomed_out);
        assert_eq!(config.view.initial_window_chunks, 10);
    }

    #[test]
    fn test_toml_roundtrip_of_defaults() {
        let config = EngineConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("[chunking]"));
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(EngineConfig::from_toml_str("[chunking]\nchunk_size = \"many\"").is_err());
    }
}
