//! Remote sandboxed-execution service adapter
//!
//! Talks to a hosted sandbox API: ephemeral environments instantiated
//! from a template, file writes and command execution over HTTP, and a
//! public hostname per environment.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::RemoteSandboxConfig;
use crate::{Error, Result};

use super::{
    classify_status, classify_transport, CommandOutput, EnvironmentHandle, ProviderError,
    ProviderKind, ProviderResult, SandboxProvider,
};

#[derive(Debug, Serialize)]
struct CreateSandboxRequest<'a> {
    template: &'a str,
}

#[derive(Debug, Deserialize)]
struct SandboxInfo {
    sandbox_id: String,
    #[serde(default)]
    hostname: Option<String>,
}

#[derive(Debug, Serialize)]
struct WriteFileRequest<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// Adapter for the remote sandbox service
pub struct RemoteSandboxProvider {
    client: Client,
    config: RemoteSandboxConfig,
}

impl RemoteSandboxProvider {
    pub fn new(config: &RemoteSandboxConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!(
                "Bearer {}",
                config.api_key.expose_secret()
            ))
            .map_err(|e| Error::Config(format!("Invalid remote sandbox API key: {}", e)))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(RemoteSandboxProvider {
            client,
            config: config.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn transport(&self, err: reqwest::Error) -> ProviderError {
        classify_transport(err, self.config.timeout_secs)
    }

    async fn error_from(&self, response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)
    }
}

#[async_trait]
impl SandboxProvider for RemoteSandboxProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::RemoteSandbox
    }

    async fn create_environment(&self) -> ProviderResult<EnvironmentHandle> {
        let response = self
            .client
            .post(self.url("/v1/sandboxes"))
            .json(&CreateSandboxRequest {
                template: &self.config.template,
            })
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let info: SandboxInfo = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("bad create response: {}", e)))?;

        info!(sandbox = %info.sandbox_id, "Remote sandbox environment created");
        Ok(EnvironmentHandle::new(self.kind(), info.sandbox_id))
    }

    async fn write_file(
        &self,
        env: &EnvironmentHandle,
        path: &str,
        content: &str,
    ) -> ProviderResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/v1/sandboxes/{}/files", env.external_id)))
            .json(&WriteFileRequest { path, content })
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        debug!(sandbox = %env.external_id, path, "Wrote file");
        Ok(())
    }

    async fn run_command(
        &self,
        env: &EnvironmentHandle,
        command: &str,
    ) -> ProviderResult<CommandOutput> {
        debug!(sandbox = %env.external_id, command, "Running command");

        let response = self
            .client
            .post(self.url(&format!("/v1/sandboxes/{}/exec", env.external_id)))
            .json(&ExecRequest { command })
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let exec: ExecResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("bad exec response: {}", e)))?;

        Ok(CommandOutput {
            exit_code: exec.exit_code,
            stdout: exec.stdout,
            stderr: exec.stderr,
        })
    }

    async fn get_public_url(&self, env: &EnvironmentHandle) -> ProviderResult<Option<String>> {
        let response = self
            .client
            .get(self.url(&format!("/v1/sandboxes/{}", env.external_id)))
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let info: SandboxInfo = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("bad sandbox info: {}", e)))?;

        Ok(info.hostname.map(|h| format!("https://{}", h)))
    }

    async fn terminate(&self, env: &EnvironmentHandle) -> ProviderResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/sandboxes/{}", env.external_id)))
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        // Already gone counts as terminated
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            info!(sandbox = %env.external_id, "Remote sandbox environment terminated");
            return Ok(());
        }
        Err(self.error_from(response).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> RemoteSandboxConfig {
        RemoteSandboxConfig {
            api_key: SecretString::from("sk-remote".to_string()),
            base_url,
            template: "node-dev".to_string(),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_create_write_exec_lifecycle() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .and(header("authorization", "Bearer sk-remote"))
            .and(body_json(serde_json::json!({"template": "node-dev"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(
                serde_json::json!({"sandbox_id": "sbx-1", "hostname": "sbx-1.example.test"}),
            ))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sbx-1/files"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sbx-1/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"exit_code": 0, "stdout": "done", "stderr": ""}),
            ))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/sandboxes/sbx-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"sandbox_id": "sbx-1", "hostname": "sbx-1.example.test"}),
            ))
            .mount(&server)
            .await;

        let provider = RemoteSandboxProvider::new(&config(server.uri())).unwrap();
        let env = provider.create_environment().await.unwrap();
        assert_eq!(env.external_id, "sbx-1");

        provider
            .write_file(&env, "index.js", "console.log('hi')")
            .await
            .unwrap();

        let out = provider.run_command(&env, "npm install").await.unwrap();
        assert!(out.succeeded());
        assert_eq!(out.stdout, "done");

        let url = provider.get_public_url(&env).await.unwrap();
        assert_eq!(url.as_deref(), Some("https://sbx-1.example.test"));
    }

    #[tokio::test]
    async fn test_quota_exceeded_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
            .mount(&server)
            .await;

        let provider = RemoteSandboxProvider::new(&config(server.uri())).unwrap();
        let err = provider.create_environment().await.unwrap_err();
        assert!(matches!(err, ProviderError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_terminate_idempotent_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/sandboxes/sbx-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = RemoteSandboxProvider::new(&config(server.uri())).unwrap();
        let env = EnvironmentHandle::new(ProviderKind::RemoteSandbox, "sbx-gone");
        provider.terminate(&env).await.unwrap();
        provider.terminate(&env).await.unwrap();
    }
}
