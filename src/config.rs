//! Engine configuration
//!
//! Loaded from an optional `trellis.toml` plus `TRELLIS_`-prefixed
//! environment variables; environment wins. `TRELLIS_CONFIG_PATH` overrides
//! the default file search.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fragment::DEFAULT_FUEL;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent run instances
    pub instances: usize,

    /// Arm the one-shot pause-on-first-failure flag at startup
    pub pause_on_fail: bool,

    /// Arm the one-shot single-step flag at startup
    pub run_one_step: bool,

    /// Evaluation budget per fragment
    pub fragment_fuel: u32,

    /// Default branch-tree file for `trellis run` when no path is given
    pub tree: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            instances: 1,
            pause_on_fail: false,
            run_one_step: false,
            fragment_fuel: DEFAULT_FUEL,
            tree: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from file and environment.
    ///
    /// Missing config file is fine; defaults apply. A present but malformed
    /// file is an error.
    pub fn load() -> Result<Self> {
        let path = std::env::var("TRELLIS_CONFIG_PATH")
            .unwrap_or_else(|_| "trellis.toml".to_string());

        let cfg = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("TRELLIS"))
            .build()
            .context("failed to read configuration sources")?;

        let config: EngineConfig = cfg
            .try_deserialize()
            .context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.instances == 0 {
            anyhow::bail!("instances must be at least 1");
        }
        if self.fragment_fuel == 0 {
            anyhow::bail!("fragment_fuel must be at least 1");
        }
        Ok(())
    }

    /// Render the default config as TOML, for `trellis init`
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&EngineConfig::default())
            .context("failed to render default configuration")
    }
}
