//! Anthropic Messages API responder.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::{GenerateRequest, GenerateResponse, Responder, ToolCall, ToolDefinition};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";
const MAX_TOKENS: u32 = 1024;

pub struct AnthropicResponder {
    http: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl AnthropicResponder {
    pub fn new(api_key: SecretString, model: &str) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            api_key,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Responder for AnthropicResponder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: &request.system_prompt,
            messages: vec![WireMessage {
                role: "user",
                content: vec![ContentBlock::Text {
                    text: request.user_prompt.clone(),
                }],
            }],
            tools: request.tools.iter().map(WireTool::from).collect(),
        };

        let response = self
            .http
            .post(MESSAGES_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: PROVIDER.to_string(),
                        timeout: request.timeout,
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: PROVIDER.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;
        debug!(status = %status, bytes = text.len(), "Anthropic response received");

        match status.as_u16() {
            200..=299 => {}
            401 | 403 => {
                return Err(LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                });
            }
            429 => {
                return Err(LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after: None,
                });
            }
            _ => {
                return Err(LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("status={status} body={text}"),
                });
            }
        }

        parse_response(&text)
    }
}

fn parse_response(body: &str) -> Result<GenerateResponse, LlmError> {
    let parsed: MessagesResponse =
        serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;
    Ok(parsed.into_response())
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

impl From<&ToolDefinition> for WireTool {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.parameters.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

impl MessagesResponse {
    fn into_response(self) -> GenerateResponse {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in self.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::ToolUse { name, input, .. } => tool_calls.push(ToolCall {
                    name,
                    arguments: input,
                }),
                ContentBlock::Other => {}
            }
        }
        GenerateResponse { text, tool_calls }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_and_tool_use() {
        let raw = r#"{
            "content": [
                {"type": "text", "text": "Ini fotonya kak"},
                {"type": "tool_use", "id": "tu_1", "name": "send_record_photos", "input": {"recordId": "A1B2C3D4"}},
                {"type": "thinking", "thinking": "..."}
            ],
            "stop_reason": "tool_use"
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        let response = parsed.into_response();
        assert_eq!(response.text, "Ini fotonya kak");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "send_record_photos");
        assert_eq!(response.tool_calls[0].arguments["recordId"], "A1B2C3D4");
    }

    #[test]
    fn non_json_body_is_invalid_response() {
        let err = parse_response("<html>Bad Gateway</html>").unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
        assert!(parse_response(r#"{"content": []}"#).unwrap().text.is_empty());
    }

    #[test]
    fn request_omits_empty_tools() {
        let body = MessagesRequest {
            model: "m",
            max_tokens: 10,
            system: "s",
            messages: vec![WireMessage {
                role: "user",
                content: vec![ContentBlock::Text { text: "hi".into() }],
            }],
            tools: Vec::new(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("tools").is_none());
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
    }
}
