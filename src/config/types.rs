//! Core configuration types

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderKind;
use crate::Result;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Record persistence
    #[serde(default)]
    pub storage: StorageConfig,
    /// Sandbox provider credentials
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// AI repair backend (optional; repair is rejected when absent)
    pub repair: Option<RepairConfig>,
    /// Pipeline budgets and timeouts
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Static bearer token expected on every request. None disables the
    /// check (authn/z is delegated to an upstream collaborator).
    #[serde(skip_serializing)]
    pub auth_token: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
            port: default_port(),
            auth_token: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

/// Which store backs the sandbox records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// PostgreSQL (recommended; records survive restarts). Selected
    /// automatically when `DATABASE_URL` is set.
    Postgres,
    /// In-process map, for local development and smoke tests
    #[default]
    Memory,
}

/// Record persistence configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    pub postgres: Option<PostgresConfig>,
}

/// PostgreSQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Connection URL
    #[serde(skip_serializing, default = "default_secret")]
    pub url: SecretString,
    /// Pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

/// Sandbox provider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Preferred provider when more than one is configured
    pub default: Option<ProviderKind>,
    /// Remote sandboxed-execution service
    pub remote: Option<RemoteSandboxConfig>,
    /// Serverless-deployment service
    pub serverless: Option<ServerlessDeployConfig>,
}

impl ProvidersConfig {
    /// Providers with credentials present, preferred first
    pub fn configured(&self) -> Vec<ProviderKind> {
        let mut kinds = Vec::new();
        if self.remote.is_some() {
            kinds.push(ProviderKind::RemoteSandbox);
        }
        if self.serverless.is_some() {
            kinds.push(ProviderKind::ServerlessDeploy);
        }
        if let Some(default) = self.default {
            if let Some(pos) = kinds.iter().position(|k| *k == default) {
                kinds.swap(0, pos);
            }
        }
        kinds
    }
}

/// Remote sandbox service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSandboxConfig {
    /// API key
    #[serde(skip_serializing, default = "default_secret")]
    pub api_key: SecretString,
    /// Base URL of the sandbox API
    #[serde(default = "default_remote_url")]
    pub base_url: String,
    /// Environment template to instantiate
    #[serde(default = "default_template")]
    pub template: String,
    /// Per-call timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_remote_url() -> String {
    "https://api.sandbox.example.com".to_string()
}

fn default_template() -> String {
    "node-dev".to_string()
}

fn default_provider_timeout() -> u64 {
    60
}

/// Serverless deployment service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerlessDeployConfig {
    /// API token
    #[serde(skip_serializing, default = "default_secret")]
    pub token: SecretString,
    /// Base URL of the deployment API
    #[serde(default = "default_serverless_url")]
    pub base_url: String,
    /// Per-call timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_serverless_url() -> String {
    "https://api.deploy.example.com".to_string()
}

/// AI repair backend settings (OpenRouter-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// API key
    #[serde(skip_serializing, default = "default_secret")]
    pub api_key: SecretString,
    /// Base URL
    #[serde(default = "default_repair_url")]
    pub base_url: String,
    /// Model used for patching
    #[serde(default = "default_repair_model")]
    pub model: String,
    /// Request timeout in seconds
    #[serde(default = "default_repair_timeout")]
    pub timeout_secs: u64,
}

fn default_repair_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_repair_model() -> String {
    "anthropic/claude-sonnet-4".to_string()
}

fn default_repair_timeout() -> u64 {
    120
}

/// Pipeline budgets and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Full-restart budget per sandbox lineage
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    /// Repair-attempt budget per sandbox lineage
    #[serde(default = "default_max_repairs")]
    pub max_repairs: i32,
    /// Bound on any single command run inside an environment
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Bound on the health probe against the public URL
    #[serde(default = "default_probe_timeout")]
    pub health_probe_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_retries: default_max_retries(),
            max_repairs: default_max_repairs(),
            command_timeout_secs: default_command_timeout(),
            health_probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_max_retries() -> i32 {
    2
}

fn default_max_repairs() -> i32 {
    3
}

fn default_command_timeout() -> u64 {
    180
}

fn default_probe_timeout() -> u64 {
    15
}

/// Overlay environment variables onto an existing config.
///
/// Env vars have the highest precedence: defaults < env.
pub(super) fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(bind) = std::env::var("PREVIEWD_BIND") {
        config.server.bind = bind;
    }
    if let Ok(port) = std::env::var("PREVIEWD_PORT") {
        config.server.port = port
            .parse()
            .map_err(|_| crate::Error::Config(format!("Invalid PREVIEWD_PORT: {}", port)))?;
    }
    if let Ok(token) = std::env::var("PREVIEWD_AUTH_TOKEN") {
        config.server.auth_token = Some(SecretString::from(token));
    }

    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.storage.backend = StorageBackend::Postgres;
        config.storage.postgres = Some(PostgresConfig {
            url: SecretString::from(url),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        });
    }
    if let Ok(backend) = std::env::var("PREVIEWD_STORAGE") {
        config.storage.backend = match backend.to_lowercase().as_str() {
            "postgres" => StorageBackend::Postgres,
            "memory" => StorageBackend::Memory,
            other => {
                return Err(crate::Error::Config(format!(
                    "Invalid PREVIEWD_STORAGE: {}. Valid: postgres, memory",
                    other
                )))
            }
        };
    }

    if let Ok(key) = std::env::var("REMOTE_SANDBOX_API_KEY") {
        let remote = config.providers.remote.get_or_insert_with(|| RemoteSandboxConfig {
            api_key: default_secret(),
            base_url: default_remote_url(),
            template: default_template(),
            timeout_secs: default_provider_timeout(),
        });
        remote.api_key = SecretString::from(key);
    }
    if let Ok(url) = std::env::var("REMOTE_SANDBOX_BASE_URL") {
        if let Some(ref mut remote) = config.providers.remote {
            remote.base_url = url;
        }
    }
    if let Ok(template) = std::env::var("REMOTE_SANDBOX_TEMPLATE") {
        if let Some(ref mut remote) = config.providers.remote {
            remote.template = template;
        }
    }

    if let Ok(token) = std::env::var("SERVERLESS_DEPLOY_TOKEN") {
        let serverless = config
            .providers
            .serverless
            .get_or_insert_with(|| ServerlessDeployConfig {
                token: default_secret(),
                base_url: default_serverless_url(),
                timeout_secs: default_provider_timeout(),
            });
        serverless.token = SecretString::from(token);
    }
    if let Ok(url) = std::env::var("SERVERLESS_DEPLOY_BASE_URL") {
        if let Some(ref mut serverless) = config.providers.serverless {
            serverless.base_url = url;
        }
    }

    if let Ok(kind) = std::env::var("PREVIEWD_DEFAULT_PROVIDER") {
        config.providers.default = Some(kind.parse()?);
    }

    if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
        let repair = config.repair.get_or_insert_with(|| RepairConfig {
            api_key: default_secret(),
            base_url: default_repair_url(),
            model: default_repair_model(),
            timeout_secs: default_repair_timeout(),
        });
        repair.api_key = SecretString::from(key);
    }
    if let Ok(model) = std::env::var("OPENROUTER_MODEL") {
        if let Some(ref mut repair) = config.repair {
            repair.model = model;
        }
    }
    if let Ok(url) = std::env::var("OPENROUTER_BASE_URL") {
        if let Some(ref mut repair) = config.repair {
            repair.base_url = url;
        }
    }

    if let Ok(retries) = std::env::var("PREVIEWD_MAX_RETRIES") {
        config.pipeline.max_retries = retries
            .parse()
            .map_err(|_| crate::Error::Config(format!("Invalid PREVIEWD_MAX_RETRIES: {}", retries)))?;
    }
    if let Ok(repairs) = std::env::var("PREVIEWD_MAX_REPAIRS") {
        config.pipeline.max_repairs = repairs
            .parse()
            .map_err(|_| crate::Error::Config(format!("Invalid PREVIEWD_MAX_REPAIRS: {}", repairs)))?;
    }

    Ok(())
}
