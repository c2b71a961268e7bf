//! Configuration module
//!
//! Layered configuration: built-in defaults overlaid with environment
//! variables (a `.env` file is honored via dotenvy). Secrets live in
//! `SecretString` and are never serialized back out.

mod types;
mod validation;

pub use types::{
    Config, PipelineConfig, ProvidersConfig, RemoteSandboxConfig, RepairConfig, ServerConfig,
    ServerlessDeployConfig, StorageBackend, StorageConfig, PostgresConfig,
};
pub use validation::{validate_config, ConfigValidationResult};

use crate::Result;

impl Config {
    /// Load configuration from the environment (plus `.env` if present)
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();
        types::apply_env_overrides(&mut config)?;
        Ok(config)
    }
}
