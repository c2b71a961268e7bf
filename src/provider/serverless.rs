//! Serverless-deployment service adapter
//!
//! Maps the uniform provider surface onto a deployment-style API: an
//! environment is a project, files are uploaded individually, and
//! commands run as one-off build jobs that return their logs.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ServerlessDeployConfig;
use crate::{Error, Result};

use super::{
    classify_status, classify_transport, CommandOutput, EnvironmentHandle, ProviderError,
    ProviderKind, ProviderResult, SandboxProvider,
};

#[derive(Debug, Serialize)]
struct CreateProjectRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    project_id: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadFileRequest<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct RunJobRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Deserialize)]
struct JobResult {
    exit_code: i32,
    #[serde(default)]
    logs: String,
}

/// Adapter for the serverless deployment service
pub struct ServerlessDeployProvider {
    client: Client,
    config: ServerlessDeployConfig,
}

impl ServerlessDeployProvider {
    pub fn new(config: &ServerlessDeployConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", config.token.expose_secret()))
                .map_err(|e| Error::Config(format!("Invalid serverless deploy token: {}", e)))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(ServerlessDeployProvider {
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
impl SandboxProvider for ServerlessDeployProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ServerlessDeploy
    }

    async fn create_environment(&self) -> ProviderResult<EnvironmentHandle> {
        let name = format!("previewd-{}", Uuid::new_v4());
        let response = self
            .client
            .post(self.url("/v1/projects"))
            .json(&CreateProjectRequest { name })
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let info: ProjectInfo = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("bad project response: {}", e)))?;

        info!(project = %info.project_id, "Serverless project created");
        Ok(EnvironmentHandle::new(self.kind(), info.project_id))
    }

    async fn write_file(
        &self,
        env: &EnvironmentHandle,
        path: &str,
        content: &str,
    ) -> ProviderResult<()> {
        let response = self
            .client
            .put(self.url(&format!("/v1/projects/{}/files", env.external_id)))
            .json(&UploadFileRequest { path, content })
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        debug!(project = %env.external_id, path, "Uploaded file");
        Ok(())
    }

    async fn run_command(
        &self,
        env: &EnvironmentHandle,
        command: &str,
    ) -> ProviderResult<CommandOutput> {
        debug!(project = %env.external_id, command, "Running build job");

        let response = self
            .client
            .post(self.url(&format!("/v1/projects/{}/jobs", env.external_id)))
            .json(&RunJobRequest { command })
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let job: JobResult = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("bad job response: {}", e)))?;

        // The job API returns a single log stream; route it to stderr on
        // failure so classification sees it where build tools put errors.
        let (stdout, stderr) = if job.exit_code == 0 {
            (job.logs, String::new())
        } else {
            (String::new(), job.logs)
        };

        Ok(CommandOutput {
            exit_code: job.exit_code,
            stdout,
            stderr,
        })
    }

    async fn get_public_url(&self, env: &EnvironmentHandle) -> ProviderResult<Option<String>> {
        let response = self
            .client
            .get(self.url(&format!("/v1/projects/{}", env.external_id)))
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let info: ProjectInfo = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("bad project info: {}", e)))?;

        Ok(info.url)
    }

    async fn terminate(&self, env: &EnvironmentHandle) -> ProviderResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/projects/{}", env.external_id)))
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            info!(project = %env.external_id, "Serverless project deleted");
            return Ok(());
        }
        Err(self.error_from(response).await)
    }
}
