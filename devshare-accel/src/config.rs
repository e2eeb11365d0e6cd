use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Only configuration files of this version are understood.
pub const CONFIG_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read solver configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse solver configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported configuration version {found} (expected {CONFIG_VERSION})")]
    UnsupportedVersion { found: u32 },

    #[error("Invalid solver parameter: {0}")]
    InvalidParameter(String),
}

/// How the residual norm is compared against the tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Convergence {
    /// `||r_k|| <= tolerance`
    Absolute,
    /// `||r_k|| <= tolerance * ||r_0||`
    #[default]
    RelativeIni,
}

/// Parameters of the iterative solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    pub max_iters: usize,
    pub tolerance: f64,
    pub relaxation_factor: f64,
    pub monitor_residual: bool,
    pub store_res_history: bool,
    pub convergence: Convergence,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            tolerance: 1e-10,
            relaxation_factor: 0.9,
            monitor_residual: true,
            store_res_history: true,
            convergence: Convergence::default(),
        }
    }
}

/// A solver configuration file.
///
/// ```json
/// { "config_version": 2,
///   "solver": { "max_iters": 200, "tolerance": 1e-8, "convergence": "ABSOLUTE" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub config_version: u32,
    #[serde(default)]
    pub solver: SolverParams,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            solver: SolverParams::default(),
        }
    }
}

impl SolverConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SolverConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.config_version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.config_version,
            });
        }
        let params = &self.solver;
        if params.tolerance.is_nan() || params.tolerance < 0.0 {
            return Err(ConfigError::InvalidParameter(format!(
                "tolerance must be non-negative, got {}",
                params.tolerance
            )));
        }
        if !(0.0..=2.0).contains(&params.relaxation_factor) || params.relaxation_factor == 0.0 {
            return Err(ConfigError::InvalidParameter(format!(
                "relaxation_factor must lie in (0, 2], got {}",
                params.relaxation_factor
            )));
        }
        Ok(())
    }
}
