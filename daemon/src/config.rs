//! Configuration management (TOML)

use crate::error::ConfigError;
use crate::snapshot::MIB;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const MAX_RATE_HZ: f64 = 1000.0;
/// One sample per hour.
pub const MIN_RATE_HZ: f64 = 1.0 / 3600.0;
pub const MAX_WINDOW_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sampling: SamplingConfig,
    pub detection: DetectionConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub rate_hz: f64,
    pub window_secs: u64,
    /// K for both the top-K CPU and top-K memory rankings.
    pub max_processes: usize,
    pub tick_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub cooldown_secs: u64,
    /// Below this many snapshots the window reports insufficient data.
    pub min_samples: usize,
    pub cpu_hot_percent: f64,
    pub cpu_hot_window_secs: u64,
    pub mem_avail_fraction: f64,
    pub swap_delta_bytes: u64,
    pub leak_bytes_per_min: u64,
    pub io_hot_bytes_per_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub near_tolerance_secs: u64,
    pub process_history_limit: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            rate_hz: 1.0,
            window_secs: 120,
            max_processes: 25,
            tick_timeout_ms: 900,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            cooldown_secs: 900,
            min_samples: 5,
            cpu_hot_percent: 85.0,
            cpu_hot_window_secs: 15,
            mem_avail_fraction: 0.10,
            swap_delta_bytes: 256 * MIB,
            leak_bytes_per_min: 200 * MIB,
            io_hot_bytes_per_sec: 150 * MIB,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            near_tolerance_secs: 300,
            process_history_limit: 20,
        }
    }
}

impl SamplingConfig {
    /// Period between ticks, clamped to the supported rate range.
    pub fn sample_interval(&self) -> Duration {
        let rate = if self.rate_hz.is_nan() {
            1.0
        } else {
            self.rate_hz.clamp(MIN_RATE_HZ, MAX_RATE_HZ)
        };
        Duration::from_secs_f64(1.0 / rate)
    }

    /// Snapshots retained: window duration times sampling rate, between 1
    /// and [`MAX_WINDOW_CAPACITY`].
    pub fn window_capacity(&self) -> usize {
        let wanted = (self.window_secs as f64 * self.rate_hz).ceil();
        if wanted.is_nan() || wanted < 1.0 {
            return 1;
        }
        if wanted >= MAX_WINDOW_CAPACITY as f64 {
            return MAX_WINDOW_CAPACITY;
        }
        wanted as usize
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        let write_err = |source: std::io::Error| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, content).map_err(write_err)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sampling;
        if !(MIN_RATE_HZ..=MAX_RATE_HZ).contains(&s.rate_hz) {
            return Err(ConfigError::Invalid(format!(
                "sampling.rate_hz must be between {} and {}, got {}",
                MIN_RATE_HZ, MAX_RATE_HZ, s.rate_hz
            )));
        }
        if s.window_secs == 0 {
            return Err(ConfigError::Invalid("sampling.window_secs must be positive".into()));
        }
        let wanted = (s.window_secs as f64 * s.rate_hz).ceil();
        if wanted > MAX_WINDOW_CAPACITY as f64 {
            return Err(ConfigError::Invalid(format!(
                "sampling window of {} snapshots exceeds the limit of {}",
                wanted, MAX_WINDOW_CAPACITY
            )));
        }
        if s.max_processes == 0 {
            return Err(ConfigError::Invalid("sampling.max_processes must be positive".into()));
        }
        if s.tick_timeout_ms == 0 {
            return Err(ConfigError::Invalid("sampling.tick_timeout_ms must be positive".into()));
        }
        let d = &self.detection;
        if !(d.mem_avail_fraction > 0.0 && d.mem_avail_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "detection.mem_avail_fraction must be in (0, 1], got {}",
                d.mem_avail_fraction
            )));
        }
        if d.min_samples == 0 {
            return Err(ConfigError::Invalid("detection.min_samples must be positive".into()));
        }
        Ok(())
    }

    pub fn config_path() -> std::path::PathBuf {
        directories::ProjectDirs::from("", "", "sysdoctor")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| std::path::PathBuf::from("config.toml"))
    }
}
