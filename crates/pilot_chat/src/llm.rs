//! HTTP chat backend for OpenAI-compatible chat completion APIs.
//!
//! The per-message credential wins over the key from the environment. HTTP
//! failures are mapped onto typed [`BackendError`]s so the coordinator never
//! has to inspect status codes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{
    BackendError, BackendResult, ChatBackend, ChatReply, ChatRequest, ChatTurn, TokenUsage,
    ToolCall,
};
use crate::config::LlmConfig;

/// Chat backend calling `{base_url}/chat/completions`
pub struct HttpChatBackend {
    config: LlmConfig,
    client: reqwest::Client,
}

impl HttpChatBackend {
    pub fn new(config: LlmConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// Provider name for billing links, when the base URL identifies one.
    fn provider(&self) -> Option<String> {
        let url = self.config.base_url.to_lowercase();
        ["openai", "anthropic", "digitalocean"]
            .iter()
            .find(|name| url.contains(*name))
            .map(|name| name.to_string())
    }

    fn api_key(&self, request: &ChatRequest) -> BackendResult<String> {
        request
            .credential
            .as_ref()
            .filter(|c| !c.is_empty())
            .map(|c| c.expose().to_string())
            .or_else(|| self.config.api_key_from_env())
            .ok_or_else(|| {
                BackendError::MissingCredentials("No LLM credentials configured".to_string())
            })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn chat(&self, request: ChatRequest) -> BackendResult<ChatReply> {
        let api_key = self.api_key(&request)?;
        let body = CompletionRequest {
            model: &self.config.model,
            messages: &request.history,
        };
        let url = self.endpoint();

        let attempts = self.config.max_retries + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s
                let delay = Duration::from_secs(1 << (attempt - 1).min(4));
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .post(&url)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(attempt = attempt + 1, "Chat request failed: {}", e);
                    last_error = Some(BackendError::Other(format!("Network error: {}", e)));
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                let text = response.text().await.unwrap_or_default();
                warn!(attempt = attempt + 1, %status, "Chat backend server error");
                last_error = Some(BackendError::Other(format!("API error {}: {}", status, text)));
                continue;
            }

            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok());
                let text = response.text().await.unwrap_or_default();
                return Err(status_error(
                    status.as_u16(),
                    &text,
                    retry_after,
                    self.provider(),
                ));
            }

            let result: CompletionResponse = response
                .json()
                .await
                .map_err(|e| BackendError::Other(format!("Failed to parse response: {}", e)))?;
            let reply = result.into_reply()?;
            debug!(
                model = %self.config.model,
                tools = reply.tool_calls.len(),
                tokens = reply.usage.as_ref().map(|u| u.total()).unwrap_or(0),
                "Chat completion received"
            );
            return Ok(reply);
        }

        Err(last_error.unwrap_or_else(|| BackendError::Other("Max retries exceeded".to_string())))
    }
}

/// Map a non-success, non-5xx status onto a typed error.
fn status_error(
    status: u16,
    body: &str,
    retry_after_secs: Option<u64>,
    provider: Option<String>,
) -> BackendError {
    let message = api_error_message(body).unwrap_or_else(|| format!("API error {}", status));
    match status {
        401 | 403 => BackendError::InvalidKey(message),
        402 => BackendError::InsufficientCredits { provider, message },
        429 if body.contains("insufficient_quota") => {
            BackendError::InsufficientCredits { provider, message }
        }
        429 => BackendError::RateLimited {
            message,
            retry_after_secs,
        },
        _ => BackendError::Other(message),
    }
}

/// `error.message` from an OpenAI-style error body.
fn api_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

impl CompletionResponse {
    fn into_reply(self) -> BackendResult<ChatReply> {
        let message = self
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| BackendError::Other("No choices in completion response".to_string()))?;

        let mut reply = ChatReply::text(message.content.unwrap_or_default());
        for call in message.tool_calls {
            // Arguments arrive as a JSON-encoded string
            let args = serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::Value::String(call.function.arguments));
            reply = reply.with_tool(ToolCall::new(call.function.name, args));
        }
        if let Some(usage) = self.usage {
            reply = reply.with_usage(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }
        Ok(reply)
    }
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::Credential;

    fn backend(base_url: &str) -> HttpChatBackend {
        HttpChatBackend::new(LlmConfig {
            base_url: base_url.to_string(),
            api_key_env: "INFRAPILOT_TEST_UNSET_KEY".to_string(),
            ..LlmConfig::default()
        })
        .unwrap()
    }

    fn request(credential: Option<Credential>) -> ChatRequest {
        ChatRequest {
            history: vec![ChatTurn::user("hello")],
            credential,
            workspace_id: "ws".into(),
            conversation_id: "c1".into(),
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_fails_before_any_request() {
        let err = backend("http://127.0.0.1:9").chat(request(None)).await.unwrap_err();
        assert_eq!(err, BackendError::MissingCredentials("No LLM credentials configured".into()));
    }

    #[test]
    fn test_message_credential_wins() {
        let b = backend("https://api.openai.com/v1/");
        let key = b.api_key(&request(Some(Credential::new("sk-user")))).unwrap();
        assert_eq!(key, "sk-user");
        assert_eq!(b.endpoint(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(b.provider().as_deref(), Some("openai"));
    }

    #[test]
    fn test_status_mapping() {
        let body = r#"{"error":{"message":"Incorrect API key provided"}}"#;
        assert_eq!(
            status_error(401, body, None, None),
            BackendError::InvalidKey("Incorrect API key provided".into())
        );
        let quota = r#"{"error":{"message":"quota","code":"insufficient_quota"}}"#;
        assert!(matches!(
            status_error(429, quota, None, Some("openai".into())),
            BackendError::InsufficientCredits { provider: Some(_), .. }
        ));
        assert_eq!(
            status_error(429, "slow down", Some(12), None),
            BackendError::RateLimited {
                message: "API error 429".into(),
                retry_after_secs: Some(12)
            }
        );
        assert!(matches!(status_error(400, "", None, None), BackendError::Other(_)));
    }

    #[test]
    fn test_parses_tool_calls_and_usage() {
        let body = r#"{
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{"id": "t1", "type": "function",
                    "function": {"name": "digitalocean.create_droplet",
                                 "arguments": "{\"region\":\"nyc1\"}"}}]
            }}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120}
        }"#;
        let response: CompletionResponse = serde_json::from_str(body).unwrap();
        let reply = response.into_reply().unwrap();
        assert_eq!(reply.message, "");
        assert_eq!(reply.tool_calls[0].name, "digitalocean.create_droplet");
        assert_eq!(reply.tool_calls[0].args["region"], "nyc1");
        assert_eq!(reply.usage.unwrap().total(), 120);
    }

    #[test]
    fn test_request_body_shape() {
        let history = vec![ChatTurn::system("be brief"), ChatTurn::user("hi")];
        let body = serde_json::to_value(CompletionRequest {
            model: "gpt-4o-mini",
            messages: &history,
        })
        .unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }
}
