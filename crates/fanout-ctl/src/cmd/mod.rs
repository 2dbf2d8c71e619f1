//! CLI command modules.

pub mod assemble;
pub mod health;
pub mod send;

use fanout_core::config::FanoutConfig;

/// Load configuration, falling back to defaults if the file is unusable.
pub fn load_config() -> FanoutConfig {
    FanoutConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        let mut config = FanoutConfig::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    })
}
