//! AI responder collaborator.
//!
//! The orchestrator only sees the [`Responder`] trait: a system prompt and a
//! user prompt go in, text and tool calls come out. Prompt content and the
//! tool catalogue live here so the pipeline never builds provider payloads.
//!
//! Backends:
//! - **Anthropic**: Messages API over `reqwest`
//! - **Echo**: offline stand-in that repeats the user's last line

mod anthropic;

pub use anthropic::AnthropicResponder;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

pub const TOOL_START_RECORD_FLOW: &str = "start_record_flow";
pub const TOOL_EDIT_RECORD_FIELD: &str = "edit_record_field";
pub const TOOL_SEND_RECORD_PHOTOS: &str = "send_record_photos";

/// Marker the responder emits when it is unsure and wants a human.
pub const ESCALATION_MARKER: &str = "[ESCALATE]";

/// A tool the responder may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// A tool call returned by the responder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    /// Per-call limit; callers also race the whole call against it.
    pub timeout: Duration,
    pub tools: Vec<ToolDefinition>,
}

/// Generated reply: text plus any structured tool calls.
#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Generative responder.
#[async_trait]
pub trait Responder: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError>;
}

/// Supported responder backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderBackend {
    Anthropic,
    Echo,
}

/// Configuration for creating a responder.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub backend: ResponderBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

impl ResponderConfig {
    /// Anthropic when `ANTHROPIC_API_KEY` is set, echo otherwise.
    pub fn from_env() -> Self {
        let model = std::env::var("CHAT_ORCH_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string());
        match std::env::var("ANTHROPIC_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Self {
                backend: ResponderBackend::Anthropic,
                api_key: secrecy::SecretString::from(key),
                model,
            },
            _ => Self {
                backend: ResponderBackend::Echo,
                api_key: secrecy::SecretString::from(String::new()),
                model: "echo".to_string(),
            },
        }
    }
}

/// Create a responder from configuration.
pub fn create_responder(config: &ResponderConfig) -> Result<Arc<dyn Responder>, LlmError> {
    match config.backend {
        ResponderBackend::Anthropic => {
            let responder = AnthropicResponder::new(config.api_key.clone(), &config.model)?;
            tracing::info!("Using Anthropic (model: {})", config.model);
            Ok(Arc::new(responder))
        }
        ResponderBackend::Echo => {
            tracing::info!("Using echo responder");
            Ok(Arc::new(EchoResponder))
        }
    }
}

/// Repeats the last line of the user prompt. For local runs without a key.
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        let last = request
            .user_prompt
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default();
        Ok(GenerateResponse {
            text: format!("(echo) {}", last.trim()),
            tool_calls: Vec::new(),
        })
    }
}

// ── Tool catalogue ──────────────────────────────────────────────────

/// Tools offered to the responder. Staff-only tools are still offered to
/// customers; the orchestrator refuses them after the fact.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: TOOL_START_RECORD_FLOW.to_string(),
            description: "Start adding a vehicle to inventory. Staff only.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "make": {"type": "string"},
                    "model": {"type": "string"},
                    "year": {"type": "integer"},
                    "price": {"type": "string", "description": "e.g. 150jt or 150000000"},
                    "color": {"type": "string"},
                    "mileageKm": {"type": "integer"}
                }
            }),
        },
        ToolDefinition {
            name: TOOL_EDIT_RECORD_FIELD.to_string(),
            description: "Change one field of a vehicle record. Staff only.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "recordId": {"type": "string"},
                    "field": {"type": "string", "enum": ["harga", "tahun", "warna", "km", "merk", "model", "status"]},
                    "value": {"type": "string"}
                },
                "required": ["field", "value"]
            }),
        },
        ToolDefinition {
            name: TOOL_SEND_RECORD_PHOTOS.to_string(),
            description: "Send the photos of a vehicle to the person asking.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "recordId": {"type": "string"}
                },
                "required": ["recordId"]
            }),
        },
    ]
}

// ── Prompt construction ─────────────────────────────────────────────

/// One prior message rendered into the prompt.
#[derive(Debug, Clone)]
pub struct HistoryLine {
    pub label: String,
    pub content: String,
}

/// Build the responder system prompt.
pub fn build_system_prompt(
    assistant_name: &str,
    business_name: &str,
    is_staff: bool,
    inventory: &str,
) -> String {
    let mut prompt = format!(
        "Kamu adalah {assistant_name}, asisten WhatsApp untuk {business_name}, showroom mobil bekas.\n\
         Jawab singkat, ramah, dalam Bahasa Indonesia.\n\
         Jangan mengarang harga atau stok; gunakan hanya data di bawah.\n\
         Jika kamu tidak yakin atau pelanggan perlu bantuan manusia, tulis {ESCALATION_MARKER} di awal jawaban.\n"
    );
    if is_staff {
        prompt.push_str(
            "Lawan bicara adalah staf showroom. Kamu boleh memakai tool untuk menambah atau mengubah data mobil.\n",
        );
    } else {
        prompt.push_str(
            "Lawan bicara adalah calon pembeli. Kamu boleh mengirim foto mobil dengan tool send_record_photos.\n",
        );
    }
    if !inventory.is_empty() {
        prompt.push_str("\nStok tersedia:\n");
        prompt.push_str(inventory);
    }
    prompt
}

/// Build the user prompt from recent history and the new message.
pub fn build_user_prompt(history: &[HistoryLine], message: &str) -> String {
    let mut prompt = String::with_capacity(512);
    if !history.is_empty() {
        prompt.push_str("Percakapan sebelumnya:\n");
        for line in history {
            let preview: String = line.content.chars().take(300).collect();
            prompt.push_str(&format!("{}: {}\n", line.label, preview));
        }
        prompt.push('\n');
    }
    let preview: String = message.chars().take(1000).collect();
    prompt.push_str(&format!("Pesan baru:\n{preview}"));
    prompt
}

/// Strip the escalation marker. Returns the cleaned text and whether it was present.
pub fn strip_escalation(text: &str) -> (String, bool) {
    if text.contains(ESCALATION_MARKER) {
        let cleaned = text.replace(ESCALATION_MARKER, "");
        (cleaned.trim().to_string(), true)
    } else {
        (text.trim().to_string(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_anthropic_responder_constructs() {
        // The key is only checked by the provider on the first request.
        let config = ResponderConfig {
            backend: ResponderBackend::Anthropic,
            api_key: secrecy::SecretString::from("test-key"),
            model: "claude-3-5-sonnet-latest".to_string(),
        };
        let responder = create_responder(&config).unwrap();
        assert_eq!(responder.model_name(), "claude-3-5-sonnet-latest");
    }

    #[tokio::test]
    async fn echo_repeats_last_line() {
        let responder = EchoResponder;
        let response = responder
            .generate(GenerateRequest {
                system_prompt: String::new(),
                user_prompt: build_user_prompt(&[], "ada Avanza?"),
                timeout: Duration::from_secs(1),
                tools: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(response.text, "(echo) ada Avanza?");
        assert!(response.tool_calls.is_empty());
    }

    #[test]
    fn escalation_marker_is_stripped() {
        let (text, escalate) = strip_escalation("[ESCALATE] Saya cek dulu ya kak");
        assert!(escalate);
        assert_eq!(text, "Saya cek dulu ya kak");

        let (text, escalate) = strip_escalation("  Halo kak ");
        assert!(!escalate);
        assert_eq!(text, "Halo kak");
    }

    #[test]
    fn user_prompt_includes_history() {
        let history = vec![HistoryLine {
            label: "Customer".into(),
            content: "halo".into(),
        }];
        let prompt = build_user_prompt(&history, "harga avanza?");
        assert!(prompt.contains("Customer: halo"));
        assert!(prompt.ends_with("harga avanza?"));
    }

    #[test]
    fn tool_catalogue_names() {
        let names: Vec<String> = tool_definitions().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![TOOL_START_RECORD_FLOW, TOOL_EDIT_RECORD_FIELD, TOOL_SEND_RECORD_PHOTOS]
        );
    }
}
