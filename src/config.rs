use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Regulator settings. Every key is optional in the TOML file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegulatorConfig {
    /// Total CPU utilization to aim for, in percent.
    pub cpu_threshold: u32,
    /// Total memory utilization to aim for, in percent.
    pub memory_threshold: u32,
    /// Seconds between regulator cycles.
    pub update_interval_secs: u64,
    /// Half-width of the hysteresis band, in percentage points.
    pub hysteresis_band: f64,
    /// When false the regulator only samples and reports.
    pub enable_workers: bool,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 80,
            memory_threshold: 60,
            update_interval_secs: 2,
            hysteresis_band: 5.0,
            enable_workers: true,
        }
    }
}

impl RegulatorConfig {
    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), ?config, "loaded config");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpu_threshold > 100 {
            return Err(Error::InvalidThreshold {
                name: "cpu",
                value: self.cpu_threshold,
            });
        }
        if self.memory_threshold > 100 {
            return Err(Error::InvalidThreshold {
                name: "memory",
                value: self.memory_threshold,
            });
        }
        if self.update_interval_secs == 0 {
            return Err(Error::InvalidInterval(self.update_interval_secs));
        }
        if !(0.0..=50.0).contains(&self.hysteresis_band) {
            return Err(Error::InvalidBand(self.hysteresis_band));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}
