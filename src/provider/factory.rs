//! Provider selection and fallback
//!
//! Builds an adapter per configured provider (credentials present) and
//! hands them out in preference order: the configured default first,
//! otherwise the first available. Zero configured providers is a
//! configuration error surfaced before any provisioning attempt.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::{Error, Result};

use super::{ProviderKind, RemoteSandboxProvider, SandboxProvider, ServerlessDeployProvider};

/// Chooses a sandbox provider based on configuration and availability
#[derive(Clone)]
pub struct ProviderFactory {
    /// Adapters in preference order
    providers: Vec<Arc<dyn SandboxProvider>>,
}

impl ProviderFactory {
    /// Build adapters for every configured provider
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut providers: Vec<Arc<dyn SandboxProvider>> = Vec::new();

        for kind in config.providers.configured() {
            match kind {
                ProviderKind::RemoteSandbox => {
                    let remote = config
                        .providers
                        .remote
                        .as_ref()
                        .ok_or_else(|| Error::Config("remote provider listed but not configured".into()))?;
                    match RemoteSandboxProvider::new(remote) {
                        Ok(provider) => providers.push(Arc::new(provider)),
                        Err(e) => warn!("Failed to construct remote sandbox adapter: {}", e),
                    }
                }
                ProviderKind::ServerlessDeploy => {
                    let serverless = config
                        .providers
                        .serverless
                        .as_ref()
                        .ok_or_else(|| Error::Config("serverless provider listed but not configured".into()))?;
                    match ServerlessDeployProvider::new(serverless) {
                        Ok(provider) => providers.push(Arc::new(provider)),
                        Err(e) => warn!("Failed to construct serverless deploy adapter: {}", e),
                    }
                }
            }
        }

        if !providers.is_empty() {
            info!(
                providers = ?providers.iter().map(|p| p.kind()).collect::<Vec<_>>(),
                "Provider factory initialized"
            );
        }

        Ok(ProviderFactory { providers })
    }

    /// Assemble a factory from pre-built adapters, preference order
    /// preserved. Used by tests and embedders.
    pub fn from_providers(providers: Vec<Arc<dyn SandboxProvider>>) -> Self {
        ProviderFactory { providers }
    }

    /// Kinds with a working adapter, preferred first
    pub fn configured(&self) -> Vec<ProviderKind> {
        self.providers.iter().map(|p| p.kind()).collect()
    }

    /// The preferred provider. Fails fast with a configuration error
    /// when nothing is configured.
    pub fn acquire(&self) -> Result<Arc<dyn SandboxProvider>> {
        self.providers.first().cloned().ok_or_else(|| {
            Error::Config("no sandbox provider configured".to_string())
        })
    }

    /// The next provider after `failed`, for one-shot construction-time
    /// fallback. Distinct from the orchestrator's run-time retry budget.
    pub fn fallback(&self, failed: ProviderKind) -> Option<Arc<dyn SandboxProvider>> {
        self.providers
            .iter()
            .find(|p| p.kind() != failed)
            .cloned()
    }

    /// Adapter for a specific backend, e.g. to tear down an environment
    /// recorded under that provider.
    pub fn by_kind(&self, kind: ProviderKind) -> Option<Arc<dyn SandboxProvider>> {
        self.providers.iter().find(|p| p.kind() == kind).cloned()
    }
}
