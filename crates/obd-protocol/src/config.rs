//! Retry policy configuration loading
//!
//! Built-in defaults overlaid with `OBD_RETRY__<CLASS>__<FIELD>` environment
//! variables, e.g. `OBD_RETRY__CONNECT__MAX_ATTEMPTS=7`.

use crate::retry::{RetryConfigError, RetryPolicyConfig};
use config::{Config, Environment};
use tracing::debug;

/// Environment prefix for retry tunables
pub const ENV_PREFIX: &str = "OBD_RETRY";

fn load_error(err: config::ConfigError) -> RetryConfigError {
    RetryConfigError::Load(err.to_string())
}

impl RetryPolicyConfig {
    /// Load from the process environment
    pub fn load() -> Result<Self, RetryConfigError> {
        Self::load_from(Environment::with_prefix(ENV_PREFIX))
    }

    /// Load with an explicit environment source, then validate
    pub fn load_from(environment: Environment) -> Result<Self, RetryConfigError> {
        let defaults = Config::try_from(&RetryPolicyConfig::default()).map_err(load_error)?;

        let loaded: RetryPolicyConfig = Config::builder()
            .add_source(defaults)
            .add_source(
                environment
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(load_error)?
            .try_deserialize()
            .map_err(load_error)?;

        loaded.validate()?;
        debug!("Loaded retry policy: {:?}", loaded);
        Ok(loaded)
    }
}
