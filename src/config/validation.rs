//! Configuration validation

use secrecy::ExposeSecret;

use super::types::{Config, StorageBackend};

/// Result of validating a configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigValidationResult {
    /// Problems that prevent startup
    pub errors: Vec<String>,
    /// Problems worth logging but not fatal
    pub warnings: Vec<String>,
}

impl ConfigValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate a configuration before any provider is touched.
///
/// A configuration with zero providers is an error here, so the caller
/// fails fast instead of discovering it mid-pipeline.
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::default();

    if config.providers.configured().is_empty() {
        result
            .errors
            .push("No sandbox provider configured. Set REMOTE_SANDBOX_API_KEY or SERVERLESS_DEPLOY_TOKEN.".to_string());
    }

    if let Some(default) = config.providers.default {
        if !config.providers.configured().contains(&default) {
            result.errors.push(format!(
                "Default provider '{}' has no credentials configured",
                default
            ));
        }
    }

    if let Some(ref remote) = config.providers.remote {
        if remote.api_key.expose_secret().is_empty() {
            result
                .errors
                .push("Remote sandbox provider configured with an empty API key".to_string());
        }
        if url::Url::parse(&remote.base_url).is_err() {
            result
                .errors
                .push(format!("Invalid remote sandbox base URL: {}", remote.base_url));
        }
    }

    if let Some(ref serverless) = config.providers.serverless {
        if serverless.token.expose_secret().is_empty() {
            result
                .errors
                .push("Serverless deploy provider configured with an empty token".to_string());
        }
        if url::Url::parse(&serverless.base_url).is_err() {
            result.errors.push(format!(
                "Invalid serverless deploy base URL: {}",
                serverless.base_url
            ));
        }
    }

    if config.storage.backend == StorageBackend::Postgres && config.storage.postgres.is_none() {
        result
            .errors
            .push("Postgres storage selected but DATABASE_URL is not set".to_string());
    }

    if config.repair.is_none() {
        result
            .warnings
            .push("No repair backend configured; repair requests will be rejected".to_string());
    }

    if config.pipeline.max_retries < 0 {
        result.errors.push("max_retries must be >= 0".to_string());
    }
    if config.pipeline.max_repairs < 0 {
        result.errors.push("max_repairs must be >= 0".to_string());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteSandboxConfig;
    use secrecy::SecretString;

    #[test]
    fn test_empty_config_invalid() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        let result = validate_config(&config);
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("No sandbox provider"));
    }

    #[test]
    fn test_remote_only_config_valid_without_repair() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config.providers.remote = Some(RemoteSandboxConfig {
            api_key: SecretString::from("sk-test".to_string()),
            base_url: "https://api.sandbox.example.com".to_string(),
            template: "node-dev".to_string(),
            timeout_secs: 60,
        });
        let result = validate_config(&config);
        assert!(result.is_valid(), "errors: {:?}", result.errors);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_empty_api_key_rejected() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config.providers.remote = Some(RemoteSandboxConfig {
            api_key: SecretString::from(String::new()),
            base_url: "https://api.sandbox.example.com".to_string(),
            template: "node-dev".to_string(),
            timeout_secs: 60,
        });
        assert!(!validate_config(&config).is_valid());
    }
}
