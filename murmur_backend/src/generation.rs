//! The seam between the simulation core and whatever produces text.
//!
//! The core only ever talks to [`GenerationService`]; `llm_client` provides the
//! OpenAI-compatible implementation and tests script their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CallError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// System prompt.
    pub prompt: String,
    pub history: Vec<Message>,
    pub options: GenerationOptions,
    pub format: ResponseFormat,
}

impl GenerationRequest {
    pub fn json(prompt: impl Into<String>, history: Vec<Message>) -> Self {
        Self {
            prompt: prompt.into(),
            history,
            options: GenerationOptions::default(),
            format: ResponseFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutput {
    Text(String),
    Json(Value),
}

impl GenerationOutput {
    pub fn into_json(self) -> Result<Value, CallError> {
        match self {
            GenerationOutput::Json(value) => Ok(value),
            GenerationOutput::Text(raw) => extract_json(&raw),
        }
    }
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn call(&self, request: GenerationRequest) -> Result<GenerationOutput, CallError>;
}

/// Pull a JSON document out of a model reply that may wrap it in reasoning
/// tags, markdown fences or chatter.
pub fn extract_json(response: &str) -> Result<Value, CallError> {
    if let Ok(parsed) = serde_json::from_str::<Value>(response) {
        return Ok(parsed);
    }

    let cleaned = match response.rfind("</think>") {
        Some(think_end) => &response[think_end + "</think>".len()..],
        None => response,
    };

    if let Ok(parsed) = serde_json::from_str::<Value>(cleaned.trim()) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        match after_start.find("```") {
            Some(end) => after_start[..end].trim(),
            None => cleaned,
        }
    } else {
        bracketed_span(cleaned).unwrap_or(cleaned)
    };

    serde_json::from_str::<Value>(json_content.trim())
        .map_err(|e| CallError::format(format!("no JSON document found: {}", e), response))
}

fn bracketed_span(text: &str) -> Option<&str> {
    let object = text.find('{').zip(text.rfind('}'));
    let array = text.find('[').zip(text.rfind(']'));
    let (start, end) = match (object, array) {
        (Some(o), Some(a)) => {
            if a.0 < o.0 {
                a
            } else {
                o
            }
        }
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return None,
    };
    (start < end).then(|| &text[start..=end])
}
