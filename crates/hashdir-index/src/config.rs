use serde::{Deserialize, Serialize};

/// Index format version whose attributes use the bare attribute name.
pub const BASE_INDEX_VERSION: u32 = 0;

/// Format version written by new indexes.
pub const CURRENT_INDEX_VERSION: u32 = 1;

/// Default hard cap on disambiguation candidates probed per directory.
pub const DEFAULT_MAX_COLLISION_PROBE: u32 = 1024;

/// Configuration for a single index instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// On-disk format version; selects the attribute names used.
    pub version: u32,
    /// Maximum number of hashed-name candidates probed before giving up.
    pub max_collision_probe: u32,
    /// fsync the directory after every `create`.
    pub sync_on_create: bool,
    /// Synthetic failure injection for crash-consistency testing.
    pub failure_injection: FailureInjectionConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            version: CURRENT_INDEX_VERSION,
            max_collision_probe: DEFAULT_MAX_COLLISION_PROBE,
            sync_on_create: false,
            failure_injection: FailureInjectionConfig::default(),
        }
    }
}

impl IndexConfig {
    /// Default configuration with failure injection at `probability`.
    pub fn with_failure_injection(probability: f64, seed: u64) -> Self {
        Self {
            failure_injection: FailureInjectionConfig {
                probability,
                seed: Some(seed),
            },
            ..Default::default()
        }
    }
}

/// Failure injection settings. Disabled when `probability` is zero.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureInjectionConfig {
    /// Chance, in `[0, 1]`, that an eligible injection point fails.
    pub probability: f64,
    /// RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl FailureInjectionConfig {
    pub fn is_enabled(&self) -> bool {
        self.probability > 0.0
    }
}
