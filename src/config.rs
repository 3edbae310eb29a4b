//! Configuration management for systolic-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`SYSTOLIC_ARRAY_SIZE`, `SYSTOLIC_MAX_CYCLES`)
//! 2. Project-local config file (`./systolic-emu.toml`)
//! 3. User config file (`~/.config/systolic-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # systolic-emu.toml
//!
//! # Edge of the PE grid
//! array_size = 8
//!
//! # Cycle budget for one run (0 = unlimited)
//! max_cycles = 5000000
//!
//! # Optional region placement, in word addresses
//! [layout]
//! weights_base = 0x000
//! input_ping_base = 0x100
//! input_pong_base = 0x200
//! output_base = 0x300
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::device::geometry::validate_array_size;
use crate::device::memory::{MemoryLayout, RegionSpec};
use crate::device::arch;
use crate::error::ConfigurationError;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cycle budget when none is configured.
pub const DEFAULT_MAX_CYCLES: u64 = 5_000_000;

/// Region placement override.
///
/// Region sizes always follow from the array size; only placement is
/// configurable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayoutConfig {
    pub weights_base: u32,
    pub input_ping_base: u32,
    pub input_pong_base: u32,
    pub output_base: u32,
    /// Memory size in words. Defaults to the end of the highest region.
    #[serde(default)]
    pub total_words: Option<u32>,
}

/// systolic-emu configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Edge of the PE grid.
    pub array_size: Option<usize>,

    /// Cycle budget for one run (0 = unlimited).
    pub max_cycles: Option<u64>,

    /// Region placement.
    pub layout: Option<LayoutConfig>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `systolic-emu.toml`
    /// 3. User config `~/.config/systolic-emu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load user config first (lowest priority of file configs)
        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        // Load project-local config (higher priority)
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Array edge, with fallback to the default.
    pub fn array_size(&self) -> usize {
        self.array_size.unwrap_or(arch::DEFAULT_ARRAY_SIZE)
    }

    /// Cycle budget, with fallback to the default.
    pub fn max_cycles(&self) -> u64 {
        self.max_cycles.unwrap_or(DEFAULT_MAX_CYCLES)
    }

    /// Memory layout for the configured array size.
    ///
    /// Without a `[layout]` table the regions are packed from word 0.
    pub fn memory_layout(&self) -> Result<MemoryLayout, ConfigurationError> {
        let array_size = self.array_size();
        validate_array_size(array_size)?;

        let Some(placement) = self.layout else {
            return Ok(MemoryLayout::packed(array_size));
        };

        let (weight_words, input_words, output_words) = MemoryLayout::capacity_words(array_size);
        let weights = RegionSpec::new("weights", placement.weights_base, weight_words);
        let input_ping = RegionSpec::new("input_ping", placement.input_ping_base, input_words);
        let input_pong = RegionSpec::new("input_pong", placement.input_pong_base, input_words);
        let output = RegionSpec::new("output", placement.output_base, output_words);

        let highest = [weights, input_ping, input_pong, output]
            .iter()
            .map(RegionSpec::end)
            .max()
            .unwrap_or(0);

        let layout = MemoryLayout {
            weights,
            input_ping,
            input_pong,
            output,
            total_words: placement.total_words.unwrap_or(highest),
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Load user configuration from ~/.config/systolic-emu/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./systolic-emu.toml
    fn load_local_config() -> Option<Self> {
        // Try current directory
        let local_path = Path::new("systolic-emu.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        // Try to find project root by looking for Cargo.toml
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("systolic-emu.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.array_size.is_some() {
            self.array_size = other.array_size;
        }
        if other.max_cycles.is_some() {
            self.max_cycles = other.max_cycles;
        }
        if other.layout.is_some() {
            self.layout = other.layout;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(size) = env_number::<usize>("SYSTOLIC_ARRAY_SIZE") {
            log::info!("Using SYSTOLIC_ARRAY_SIZE from environment: {}", size);
            self.array_size = Some(size);
        }
        if let Some(cycles) = env_number::<u64>("SYSTOLIC_MAX_CYCLES") {
            log::info!("Using SYSTOLIC_MAX_CYCLES from environment: {}", cycles);
            self.max_cycles = Some(cycles);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("systolic-emu").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# systolic-emu configuration
# Place this file at ~/.config/systolic-emu/config.toml or ./systolic-emu.toml

# Edge of the PE grid (1..=32, default 8)
array_size = 8

# Cycle budget for one run, 0 = unlimited
max_cycles = 5000000

# Region placement in word addresses (optional; packed from 0 when absent)
# [layout]
# weights_base = 0
# input_ping_base = 256
# input_pong_base = 512
# output_base = 768
# total_words = 1024
"#
        .to_string()
    }
}

/// Parse a numeric environment variable, warning on garbage.
fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a number", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.array_size(), 8);
        assert_eq!(config.max_cycles(), DEFAULT_MAX_CYCLES);
        assert_eq!(config.memory_layout().unwrap(), MemoryLayout::packed(8));
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            array_size: Some(4),
            max_cycles: Some(1000),
            layout: None,
        };

        let overlay = Config {
            array_size: None,
            max_cycles: Some(2000),
            layout: None,
        };

        base.merge(overlay);

        // array_size unchanged (overlay was None)
        assert_eq!(base.array_size, Some(4));
        // max_cycles overridden by overlay
        assert_eq!(base.max_cycles, Some(2000));
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let config: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(config.array_size, Some(8));
        assert!(config.layout.is_none());
    }

    #[test]
    fn test_layout_table() {
        let config: Config = toml::from_str(
            r#"
            array_size = 4
            [layout]
            weights_base = 0x000
            input_ping_base = 0x100
            input_pong_base = 0x200
            output_base = 0x300
            "#,
        )
        .unwrap();

        let layout = config.memory_layout().unwrap();
        assert_eq!(layout.input_pong.base, 0x200);
        assert_eq!(layout.output.words, 16);
        assert_eq!(layout.total_words, 0x300 + 16);
    }

    #[test]
    fn test_overlapping_layout_rejected() {
        let config = Config {
            array_size: Some(8),
            max_cycles: None,
            layout: Some(LayoutConfig {
                weights_base: 0,
                input_ping_base: 10,
                input_pong_base: 400,
                output_base: 800,
                total_words: None,
            }),
        };
        assert!(matches!(
            config.memory_layout(),
            Err(ConfigurationError::RegionOverlap { first: "weights", second: "input_ping" })
        ));
    }

    #[test]
    fn test_bad_array_size() {
        let config = Config {
            array_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            config.memory_layout(),
            Err(ConfigurationError::ArraySizeOutOfRange { size: 0, .. })
        ));
    }
}
