//! Language-model seam.
//!
//! One method — `complete(prompt) -> text` — shared by the task extractor
//! and the briefing generator. The production implementation talks to an
//! OpenAI-compatible chat-completions endpoint with a bounded timeout;
//! callers treat every failure as recoverable.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default request timeout. LLM latency beyond this is treated as a failure,
/// never as something to wait out inside a scan run.
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Empty completion in response")]
    EmptyCompletion,
}

/// A model that can complete a prompt into text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

// ============================================================================
// OpenAI-compatible chat client
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ChatClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LanguageModel for ChatClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.2,
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = resp.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(LlmError::EmptyCompletion);
        }
        Ok(content)
    }
}

// ============================================================================
// JSON salvage
// ============================================================================

/// Find the first complete JSON object `{...}` in the text.
///
/// Models wrap output in prose or markdown fences often enough that a
/// straight `serde_json::from_str` on the whole completion is unreliable.
pub fn extract_json_object(text: &str) -> Option<String> {
    extract_balanced(text, b'{', b'}')
}

/// Find the first complete JSON array `[...]` in the text.
pub fn extract_json_array(text: &str) -> Option<String> {
    extract_balanced(text, b'[', b']')
}

fn extract_balanced(text: &str, open: u8, close: u8) -> Option<String> {
    let start = text.find(open as char)?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escape {
            escape = false;
            continue;
        }
        if b == b'\\' && in_string {
            escape = true;
            continue;
        }
        if b == b'"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some(text[start..=i].to_string());
            }
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"Here is the result: {"foo": "bar"} and more text"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"foo": "bar"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"a": {"b": 1}, "c": 2}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_array_with_fences() {
        let text = "```json\n[{\"title\": \"Pay invoice\"}]\n```";
        assert_eq!(
            extract_json_array(text),
            Some(r#"[{"title": "Pay invoice"}]"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_braces_inside_strings() {
        let text = r#"{"text": "value with \"quotes\" and } inside"}"#;
        let parsed: serde_json::Value =
            serde_json::from_str(&extract_json_object(text).unwrap()).unwrap();
        assert!(parsed["text"].as_str().unwrap().contains('}'));
    }

    #[test]
    fn test_extract_json_none() {
        assert_eq!(extract_json_object("No JSON here"), None);
        assert_eq!(extract_json_array("still nothing"), None);
    }

    #[test]
    fn test_chat_response_parsing() {
        let json = r#"{
            "choices": [
                {"message": {"role": "assistant", "content": "[]"}}
            ]
        }"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.choices[0].message.content, "[]");
    }
}
