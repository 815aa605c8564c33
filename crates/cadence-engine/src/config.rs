//! Engine configuration.
//!
//! Provides the tunables for voice allocation, decoding and the update pass.
//! Configuration can be loaded from and saved to a TOML file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use cadence_kernel::MAX_VOICES;

/// Configuration file name.
const CONFIG_FILE: &str = "cadence.toml";

/// Decoded size above which a file is streamed instead of buffered (2.5 MiB).
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 2_621_440;

/// Engine configuration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // === Voices ===
    /// Number of hardware voices allocated at init
    pub max_instances: usize,
    /// Default volume for the command-line player (0.0 - 1.0)
    pub default_volume: f32,

    // === Update Pass ===
    /// Interval between reap passes in milliseconds
    pub update_interval_ms: u64,
    /// Frames per second the host ticks the scheduler at
    pub frame_rate: u32,

    // === Decoding ===
    /// Number of background decode threads
    pub decode_workers: usize,
    /// Largest decoded size kept in memory; larger files stream
    pub max_buffered_bytes: usize,
    /// Directory relative paths are resolved against (None = as given)
    pub asset_root: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_instances: MAX_VOICES,
            default_volume: 1.0,

            update_interval_ms: 50,
            frame_rate: 60,

            decode_workers: 2,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            asset_root: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default file location.
    /// Returns default config if file doesn't exist.
    pub fn load() -> Self {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from a specific path.
    /// Returns default config if file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, using defaults");
            return Self::default();
        }

        let mut config: Self = match fs::File::open(path) {
            Ok(mut file) => {
                let mut contents = String::new();
                if let Err(e) = file.read_to_string(&mut contents) {
                    warn!("Failed to read config file: {e}");
                    return Self::default();
                }

                match toml::from_str(&contents) {
                    Ok(config) => {
                        info!("Loaded config from {}", path.display());
                        config
                    },
                    Err(e) => {
                        warn!("Failed to parse config file: {e}");
                        return Self::default();
                    },
                }
            },
            Err(e) => {
                warn!("Failed to open config file: {e}");
                return Self::default();
            },
        };

        config.validate();
        config
    }

    /// Save configuration to the default file location.
    pub fn save(&self) -> io::Result<()> {
        self.save_to(Self::config_path())
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn config_path() -> PathBuf {
        match dirs::config_dir() {
            Some(config_dir) => config_dir.join("cadence").join(CONFIG_FILE),
            None => PathBuf::from(CONFIG_FILE),
        }
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        // Voices
        self.max_instances = self.max_instances.clamp(1, 256);
        self.default_volume = self.default_volume.clamp(0.0, 1.0);

        // Update pass
        self.update_interval_ms = self.update_interval_ms.clamp(1, 1000);
        self.frame_rate = self.frame_rate.clamp(1, 240);

        // Decoding
        self.decode_workers = self.decode_workers.clamp(1, 16);
    }

    /// Interval between reap passes.
    #[must_use]
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}
