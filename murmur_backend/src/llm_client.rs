use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::CallError;
use crate::generation::{
    GenerationOutput, GenerationRequest, GenerationService, Message, ResponseFormat,
};

/// OpenAI-compatible chat completions client (Ollama, LM Studio, vLLM, OpenAI, ...).
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormatSpec>,
}

#[derive(Debug, Serialize)]
struct ResponseFormatSpec {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            temperature: 0.8,
            max_tokens: 2000,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        let mut client = Self::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone().unwrap_or_default(),
            config.llm_model.clone(),
        );
        client.temperature = config.llm_temperature;
        client.max_tokens = config.llm_max_tokens;
        client
    }

    fn completions_url(&self) -> String {
        let trimmed = self.api_url.trim_end_matches('/');
        if trimmed.ends_with("/v1") {
            format!("{}/chat/completions", trimmed)
        } else {
            format!("{}/v1/chat/completions", trimmed)
        }
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, CallError> {
        if self.api_url.trim().is_empty() || self.model.trim().is_empty() {
            return Err(CallError::Config(
                "llm_api_url and llm_model must both be set".to_string(),
            ));
        }

        let mut messages = Vec::with_capacity(request.history.len() + 1);
        messages.push(Message {
            role: "system".to_string(),
            content: request.prompt.clone(),
        });
        messages.extend(request.history.iter().cloned());

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(request.options.temperature.unwrap_or(self.temperature)),
            max_tokens: Some(request.options.max_tokens.unwrap_or(self.max_tokens)),
            response_format: (request.format == ResponseFormat::Json)
                .then_some(ResponseFormatSpec {
                    kind: "json_object",
                }),
        };

        let mut req = self.client.post(self.completions_url()).json(&body);

        // Local models usually run without a key
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| CallError::Transient(format!("failed to send LLM request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(CallError::Config(format!(
                    "LLM API rejected credentials ({}): {}",
                    status, body
                )));
            }
            return Err(CallError::Transient(format!(
                "LLM API returned error {}: {}",
                status, body
            )));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| CallError::Transient(format!("failed to read LLM response: {}", e)))?;
        let completion: ChatCompletionResponse = serde_json::from_str(&raw)
            .map_err(|e| CallError::format(format!("unexpected completion envelope: {}", e), &raw))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| CallError::format("no choices in LLM response", &raw))
    }
}

#[async_trait]
impl GenerationService for LlmClient {
    async fn call(&self, request: GenerationRequest) -> Result<GenerationOutput, CallError> {
        let content = self.complete(&request).await?;
        match request.format {
            ResponseFormat::Text => Ok(GenerationOutput::Text(content)),
            ResponseFormat::Json => GenerationOutput::Text(content)
                .into_json()
                .map(GenerationOutput::Json),
        }
    }
}
