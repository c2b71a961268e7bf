//! AI-assisted repair backend client
//!
//! Sends the failing files, the classified category, and the captured
//! error message to an OpenRouter-compatible chat-completions endpoint
//! and expects a strict-JSON patch back.

use reqwest::{header, Client};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RepairConfig;
use crate::store::CodeFiles;
use crate::{Error, Result};

use super::ErrorCategory;

const SYSTEM_PROMPT: &str = "You are a code repair assistant. You receive application source \
files and a build or runtime error. Rewrite only the files that need to change so the error \
is fixed. Respond with strict JSON, no prose and no code fences: \
{\"success\": true|false, \"files\": {\"path\": \"full new content\", ...}, \"notes\": \"...\"} \
Set success to false if the error cannot be fixed by editing these files.";

/// A patch returned by the repair backend
#[derive(Debug, Clone, Deserialize)]
pub struct RepairPatch {
    /// Whether the backend believes the patch fixes the failure
    pub success: bool,
    /// Replacement file contents, path -> full new content
    #[serde(default)]
    pub files: CodeFiles,
    /// Free-form explanation, surfaced in logs only
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Client for the AI repair backend
#[derive(Clone)]
pub struct RepairClient {
    client: Client,
    config: RepairConfig,
}

impl RepairClient {
    pub fn new(config: RepairConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!(
                "Bearer {}",
                config.api_key.expose_secret()
            ))
            .map_err(|e| Error::Config(format!("Invalid repair API key format: {}", e)))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(RepairClient { client, config })
    }

    /// Ask the backend for a patch. Returns an explicit failure patch
    /// (`success == false`) rather than an error when the model declines.
    pub async fn request_patch(
        &self,
        category: ErrorCategory,
        error_message: &str,
        files: &CodeFiles,
    ) -> Result<RepairPatch> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let mut user = format!(
            "Error category: {}\nError message:\n{}\n\nSource files:\n",
            category, error_message
        );
        for (path, content) in files {
            user.push_str(&format!("--- {} ---\n{}\n", path, content));
        }

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: 0.0,
        };

        debug!(model = %self.config.model, %category, "Requesting repair patch");

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Repair(format!(
                "repair backend returned {}: {}",
                status, body
            )));
        }

        let body: ChatResponse = response.json().await?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| Error::Repair("repair backend returned no choices".to_string()))?;

        parse_patch(content)
    }
}

/// Parse a patch out of the completion text, tolerating code fences.
fn parse_patch(content: &str) -> Result<RepairPatch> {
    let trimmed = strip_fences(content);
    let patch: RepairPatch = serde_json::from_str(trimmed).map_err(|e| {
        warn!("Unparseable repair response: {}", e);
        Error::Repair(format!("repair backend returned invalid JSON: {}", e))
    })?;
    Ok(patch)
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}
