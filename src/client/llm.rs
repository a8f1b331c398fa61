//! Chat-completion style LLM provider client
//!
//! Translates domain requests (summaries, briefing cards) into the
//! OpenAI-compatible messages shape and parses choices/usage back into
//! [`LlmResponse`]. All resilience behavior lives in [`ProviderClient`].

use super::{ProviderClient, RequestOptions, TransportRequest};
use crate::error::{ClassifiedError, ErrorKind, GatewayError, Result, Severity};
use crate::models::{ChatMessage, ContentItem, LlmResponse, TokenUsage};
use crate::retry::CancelToken;
use serde::Deserialize;
use serde_json::json;

/// Requested voice for generated text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tone {
    #[default]
    Neutral,
    Professional,
    Casual,
}

impl Tone {
    pub fn instruction(&self) -> &'static str {
        match self {
            Tone::Neutral => "Use a neutral, factual tone.",
            Tone::Professional => "Use a concise, professional tone.",
            Tone::Casual => "Use a relaxed, conversational tone.",
        }
    }
}

/// One LLM generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub cancel: Option<CancelToken>,
}

impl GenerationRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: None,
            temperature: None,
            cancel: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// LLM provider client
pub struct LlmClient {
    inner: ProviderClient,
    model: String,
}

impl LlmClient {
    pub fn new(inner: ProviderClient) -> Self {
        let model = inner
            .config()
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        Self { inner, model }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    pub fn client(&self) -> &ProviderClient {
        &self.inner
    }

    /// Execute one chat completion. Generation calls are never cached.
    pub async fn chat(&self, request: GenerationRequest) -> Result<LlmResponse> {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let transport_request = TransportRequest::post("/v1/chat/completions", body);
        let options = RequestOptions {
            cancel: request.cancel.clone(),
            ..Default::default()
        };

        let response = self.inner.request(&transport_request, &options).await?;

        let parsed: ChatCompletionResponse = serde_json::from_value(response.value)
            .map_err(|e| self.malformed(format!("completion decode: {}", e)))?;
        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| self.malformed("completion has no choices".to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        let usage = TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        };
        self.inner.record_cost(self.cost_of(usage));

        Ok(LlmResponse {
            content: choice.message.content.clone(),
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            usage,
        })
    }

    /// Summarize a set of articles in the requested tone
    pub async fn summarize_articles(
        &self,
        items: &[ContentItem],
        tone: Tone,
        max_words: usize,
        cancel: Option<CancelToken>,
    ) -> Result<LlmResponse> {
        let mut sources = String::new();
        for (idx, item) in items.iter().enumerate() {
            sources.push_str(&format!(
                "{}. {} — {}\n",
                idx + 1,
                item.title,
                truncate(&item.body, 400)
            ));
        }

        let prompt = format!(
            "Summarize the following news articles in at most {} words. {} \
             Mention only facts present in the articles.\n\nARTICLES:\n{}",
            max_words,
            tone.instruction(),
            sources
        );

        self.chat(GenerationRequest {
            messages: vec![
                ChatMessage::system("You are a news briefing assistant."),
                ChatMessage::user(prompt),
            ],
            max_tokens: Some((max_words * 2) as u32),
            temperature: Some(0.4),
            cancel,
        })
        .await
    }

    /// Cost in USD for a completed call, from configured per-million pricing
    fn cost_of(&self, usage: TokenUsage) -> f64 {
        let config = self.inner.config();
        usage.prompt_tokens as f64 / 1_000_000.0 * config.cost_per_million_input_tokens
            + usage.completion_tokens as f64 / 1_000_000.0 * config.cost_per_million_output_tokens
    }

    fn malformed(&self, detail: String) -> GatewayError {
        GatewayError::Provider(ClassifiedError {
            kind: ErrorKind::UnknownProvider,
            provider: self.inner.id().to_string(),
            retryable: false,
            http_status: None,
            severity: Severity::Low,
            retry_after: None,
            detail,
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
