//! Engine and registry configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{EntangleError, EntangleResult};

/// How a declared link string is matched against known resource ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkResolution {
    /// Match the full id, its base name, or any path segment
    #[default]
    Heuristic,
    /// Match the full id only
    Exact,
}

/// Entangle configuration
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntangleConfig {
    /// Interval between diffusion engine poll cycles
    pub poll_interval_seconds: f64,
    /// Interval between registry maintenance sweeps
    pub maintenance_interval_seconds: f64,
    /// Strength assumed for resources without a record
    pub default_strength: f64,
    /// Fidelity lost by an idle channel per sweep
    pub degrade_step: f64,
    /// Fidelity at or below which a channel is unusable
    pub fidelity_floor: f64,
    /// Upper bound on how long `stop` waits for a background loop
    pub shutdown_timeout_seconds: f64,
    /// Link matching rule
    pub link_resolution: LinkResolution,
}

impl Default for EntangleConfig {
    fn default() -> Self {
        EntangleConfig {
            poll_interval_seconds: 5.0,
            maintenance_interval_seconds: 300.0,
            default_strength: 0.95,
            degrade_step: 0.01,
            fidelity_floor: 0.5,
            shutdown_timeout_seconds: 5.0,
            link_resolution: LinkResolution::Heuristic,
        }
    }
}

impl EntangleConfig {
    /// Short intervals for tests and demos
    pub fn testing() -> Self {
        EntangleConfig {
            poll_interval_seconds: 0.05,
            maintenance_interval_seconds: 0.05,
            shutdown_timeout_seconds: 1.0,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> EntangleResult<Self> {
        let config: EntangleConfig = serde_json::from_str(json)
            .map_err(|e| EntangleError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EntangleResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| EntangleError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> EntangleResult<()> {
        let positive = [
            ("poll_interval_seconds", self.poll_interval_seconds),
            ("maintenance_interval_seconds", self.maintenance_interval_seconds),
            ("shutdown_timeout_seconds", self.shutdown_timeout_seconds),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(EntangleError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }

        let unit = [
            ("default_strength", self.default_strength),
            ("degrade_step", self.degrade_step),
            ("fidelity_floor", self.fidelity_floor),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(EntangleError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs_f64(self.maintenance_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_timeout_seconds)
    }
}
