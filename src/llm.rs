use crate::config::LlmConfig;
use crate::error::{CityQueryError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// One request to the text-completion service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    /// Sent as a second system message when present
    pub pre_instruction: Option<String>,
    pub user: String,
}

impl CompletionRequest {
    /// Chat messages in the order the service expects them
    pub fn messages(&self) -> Vec<serde_json::Value> {
        let mut messages = vec![serde_json::json!({"role": "system", "content": self.system})];
        if let Some(pre) = &self.pre_instruction {
            messages.push(serde_json::json!({"role": "system", "content": pre}));
        }
        messages.push(serde_json::json!({"role": "user", "content": self.user}));
        messages
    }
}

/// Text-completion service
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// OpenAI-compatible chat completion client
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CityQueryError::Llm(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages(),
            "temperature": self.temperature,
        });

        debug!("Requesting completion from {} ({})", self.base_url, self.model);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CityQueryError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CityQueryError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if !status.is_success() {
            let detail = response_json["error"]["message"]
                .as_str()
                .unwrap_or("no error detail");
            return Err(CityQueryError::Llm(format!(
                "LLM API returned {}: {}",
                status, detail
            )));
        }

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CityQueryError::Llm("No content in LLM response".to_string()))?;

        if content.trim().is_empty() {
            return Err(CityQueryError::Llm("Empty content in LLM response".to_string()));
        }

        Ok(content.to_string())
    }
}
