//! OpenAI-compatible HTTP provider (Chat Completions + model listing).
//!
//! Speaks to any endpoint exposing `/chat/completions` and `/models` with
//! bearer auth, such as the Shapes.inc API.

use super::provider::{ChatRequest, GenerationProvider, ProviderReply};
use crate::config::ProviderSettings;
use crate::{Result, YuzhongError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_ERROR_DETAIL_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    id: String,
}

pub struct OpenAiCompatProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatProvider {
    /// Build from settings. Fails with a configuration error when no API key
    /// is set.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| YuzhongError::Config("provider API key missing".to_string()))?;

        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("yuzhong/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = truncate_error_detail(&extract_error_detail(&body), MAX_ERROR_DETAIL_CHARS);

        let message = if detail.is_empty() {
            format!("API error {status}")
        } else {
            format!("API error {status}: {detail}")
        };

        if status == StatusCode::TOO_MANY_REQUESTS || is_rate_limit_message(&detail) {
            Err(YuzhongError::RateLimited(message))
        } else {
            Err(YuzhongError::Upstream(message))
        }
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ProviderReply> {
        debug!(
            "Chat completion: model={}, messages={}, max_tokens={}",
            request.model,
            request.messages.len(),
            request.max_tokens
        );

        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = Self::check_response_status(response).await?;

        let body: ChatResponse = response.json().await.map_err(map_reqwest_error)?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty());

        Ok(ProviderReply { content })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.endpoint("models"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = Self::check_response_status(response).await?;

        let list: ModelList = response.json().await.map_err(map_reqwest_error)?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

pub(crate) fn is_rate_limit_message(message: &str) -> bool {
    message.to_lowercase().contains("rate limit")
}

fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }

    trimmed.to_string()
}

fn truncate_error_detail(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_string();
    }

    let mut truncated = detail.chars().take(max_chars).collect::<String>();
    truncated.push_str("... [truncated]");
    truncated
}

fn map_reqwest_error(e: reqwest::Error) -> YuzhongError {
    if e.is_timeout() {
        YuzhongError::Upstream(format!("timeout: {e}"))
    } else if e.is_connect() {
        YuzhongError::Upstream(format!("network: {e}"))
    } else if e.status() == Some(StatusCode::TOO_MANY_REQUESTS) {
        YuzhongError::RateLimited(e.to_string())
    } else {
        YuzhongError::Http(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_error_detail() {
        assert_eq!(
            extract_error_detail(r#"{"error": {"message": "Rate limit exceeded"}}"#),
            "Rate limit exceeded"
        );
        assert_eq!(extract_error_detail(r#"{"message": "bad model"}"#), "bad model");
        assert_eq!(extract_error_detail("  plain text  "), "plain text");
        assert_eq!(extract_error_detail(""), "");
    }

    #[test]
    fn test_truncate_error_detail() {
        assert_eq!(truncate_error_detail("short", 10), "short");
        assert_eq!(truncate_error_detail("abcdef", 3), "abc... [truncated]");
    }

    #[test]
    fn test_rate_limit_message() {
        assert!(is_rate_limit_message("429: Rate Limit reached for model"));
        assert!(!is_rate_limit_message("internal server error"));
    }

    #[test]
    fn test_requires_api_key() {
        let settings = ProviderSettings::default();
        assert!(matches!(
            OpenAiCompatProvider::from_settings(&settings),
            Err(YuzhongError::Config(_))
        ));

        let settings = ProviderSettings {
            api_key: Some("sk-test".to_string()),
            base_url: "https://api.example.invalid/v1/".to_string(),
            ..ProviderSettings::default()
        };
        let provider = OpenAiCompatProvider::from_settings(&settings).unwrap();
        assert_eq!(
            provider.endpoint("models"),
            "https://api.example.invalid/v1/models"
        );
    }
}
