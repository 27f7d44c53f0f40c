//! TOML-backed configuration for the CLI.
//!
//! Every section falls back to the engine defaults, so a partial file (or
//! none at all) is always usable.

use serde::{Deserialize, Serialize};

use asper_core::grid::SamplingConfig;
use asper_core::minima::MinimaConfig;
use asper_core::roughness::{RoughnessConstants, RoughnessOptions};
use asper_core::timbre::TimbreConfig;

/// Scale-building knobs for Step 5.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleConfig {
    /// Ratio the emitted scale is anchored on.
    pub root_ratio: f32, // e.g., 1.0
    /// Upper bound on emitted entries (floored at 2).
    pub max_count: usize, // e.g., 12
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            root_ratio: 1.0,
            max_count: 12,
        }
    }
}

/// Top-level configuration, one section per engine step. The same timbre
/// feeds the root tone and both interval tones.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub timbre: TimbreConfig,
    pub constants: RoughnessConstants,
    pub options: RoughnessOptions,
    pub sampling: SamplingConfig,
    pub minima: MinimaConfig,
    pub scale: ScaleConfig,
}

impl AppConfig {
    /// Read `path` when given; any read or parse failure reports and falls
    /// back to defaults rather than aborting.
    pub fn load_or_default(path: Option<&str>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    eprintln!("Failed to parse config {path}: {err}. Using defaults.");
                    Self::default()
                }
            },
            Err(err) => {
                eprintln!("Failed to read config {path}: {err}. Using defaults.");
                Self::default()
            }
        }
    }
}
