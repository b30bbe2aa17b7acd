use std::path::Path;

use anyhow::Context;
use hashdir_index::IndexConfig;
use serde::{Deserialize, Serialize};

/// Contents of the `--config` TOML file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub index: IndexConfig,
    /// Directory levels of the nibble layout; 0 keeps every object in the
    /// index root.
    pub layout_levels: usize,
}

impl CliConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}
