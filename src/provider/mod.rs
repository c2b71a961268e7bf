//! Sandbox provider abstraction
//!
//! A provider is a pluggable backend capable of creating, running, and
//! tearing down an isolated execution environment. All operations surface
//! a typed `ProviderError` so the orchestrator can make retry and fallback
//! decisions without string-matching.

mod factory;
mod remote;
mod serverless;

pub use factory::ProviderFactory;
pub use remote::RemoteSandboxProvider;
pub use serverless::ServerlessDeployProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Supported provider backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Remote sandboxed-execution service
    RemoteSandbox,
    /// Serverless-deployment service
    ServerlessDeploy,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::RemoteSandbox => "remote-sandbox",
            ProviderKind::ServerlessDeploy => "serverless-deploy",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "remote-sandbox" | "remote" => Ok(ProviderKind::RemoteSandbox),
            "serverless-deploy" | "serverless" => Ok(ProviderKind::ServerlessDeploy),
            _ => Err(crate::Error::InvalidInput(format!(
                "Unknown provider: {}. Valid: remote-sandbox, serverless-deploy",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed provider failure, classified at the call boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The provider call exceeded its time bound
    #[error("provider call timed out after {0}s")]
    Timeout(u64),

    /// The provider rejected the request due to quota limits
    #[error("provider quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The provider is unreachable or returned a server error
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Anything the adapter could not classify
    #[error("provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Failures that justify one-shot fallback to another provider
    pub fn is_fallback_worthy(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::QuotaExceeded(_)
                | ProviderError::Unavailable(_)
        )
    }
}

/// Result alias for provider operations
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Handle to a live provider environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    /// Which backend owns the environment
    pub provider: ProviderKind,
    /// Provider-assigned identifier
    pub external_id: String,
}

impl EnvironmentHandle {
    pub fn new(provider: ProviderKind, external_id: impl Into<String>) -> Self {
        EnvironmentHandle {
            provider,
            external_id: external_id.into(),
        }
    }
}

/// Output of a command executed inside an environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined stdout + stderr, stderr last
    pub fn combined(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Uniform capability surface over sandbox backends
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Which backend this adapter talks to
    fn kind(&self) -> ProviderKind;

    /// Acquire a fresh isolated environment
    async fn create_environment(&self) -> ProviderResult<EnvironmentHandle>;

    /// Write a file into the environment
    async fn write_file(
        &self,
        env: &EnvironmentHandle,
        path: &str,
        content: &str,
    ) -> ProviderResult<()>;

    /// Run a shell command inside the environment
    async fn run_command(
        &self,
        env: &EnvironmentHandle,
        command: &str,
    ) -> ProviderResult<CommandOutput>;

    /// Fetch the public URL, if the environment is serving one yet
    async fn get_public_url(&self, env: &EnvironmentHandle) -> ProviderResult<Option<String>>;

    /// Tear the environment down. Must be idempotent: terminating an
    /// already-gone environment is success, not an error.
    async fn terminate(&self, env: &EnvironmentHandle) -> ProviderResult<()>;
}

/// Map an HTTP status from a provider API to a typed failure
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> ProviderError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::QuotaExceeded(body.to_string())
    } else if status.is_server_error() {
        ProviderError::Unavailable(format!("{}: {}", status, body))
    } else {
        ProviderError::Unknown(format!("{}: {}", status, body))
    }
}

/// Map a reqwest transport error to a typed failure
pub(crate) fn classify_transport(err: reqwest::Error, timeout_secs: u64) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout_secs)
    } else if err.is_connect() {
        ProviderError::Unavailable(err.to_string())
    } else {
        ProviderError::Unknown(err.to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!(
            "remote-sandbox".parse::<ProviderKind>().unwrap(),
            ProviderKind::RemoteSandbox
        );
        assert_eq!(
            "serverless".parse::<ProviderKind>().unwrap(),
            ProviderKind::ServerlessDeploy
        );
        assert!("heroku".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_classify_status() {
        let quota = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(quota, ProviderError::QuotaExceeded(_)));

        let unavailable = classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "down");
        assert!(matches!(unavailable, ProviderError::Unavailable(_)));

        let unknown = classify_status(reqwest::StatusCode::BAD_REQUEST, "bad");
        assert!(matches!(unknown, ProviderError::Unknown(_)));
    }

    #[test]
    fn test_command_output_combined() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "building".to_string(),
            stderr: "boom".to_string(),
        };
        assert!(!out.succeeded());
        assert_eq!(out.combined(), "building\nboom");
    }

    #[test]
    fn test_fallback_worthy() {
        assert!(ProviderError::Timeout(30).is_fallback_worthy());
        assert!(ProviderError::Unavailable("503".into()).is_fallback_worthy());
        assert!(!ProviderError::Unknown("??".into()).is_fallback_worthy());
    }
}
