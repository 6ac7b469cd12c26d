// engine/src/model_adapters.rs
//!
//! Model Adapters: one interface over heterogeneous LM provider HTTP APIs.
//!
//! - `ProviderAdapter` trait: `{name, supports(model), complete(req)}`
//! - `HttpAdapter`: a single adapter parameterised by `ApiStyle`; the style
//!   selects the wire format (chat-completions, Anthropic messages, Gemini
//!   generateContent)
//! - `CallError`: provider failures classified as retryable or terminal
//! - `extract_json`: sidecar extractor for structured output in raw text

use crate::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiStyle {
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "mistral")]
    Mistral,
    #[serde(rename = "groq")]
    Groq,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "huggingface")]
    HuggingFace,
}

impl ApiStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiStyle::OpenAiCompatible => "openai-compatible",
            ApiStyle::Anthropic => "anthropic",
            ApiStyle::Gemini => "gemini",
            ApiStyle::Mistral => "mistral",
            ApiStyle::Groq => "groq",
            ApiStyle::OpenRouter => "openrouter",
            ApiStyle::HuggingFace => "huggingface",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai-compatible" => Some(ApiStyle::OpenAiCompatible),
            "anthropic" => Some(ApiStyle::Anthropic),
            "gemini" => Some(ApiStyle::Gemini),
            "mistral" => Some(ApiStyle::Mistral),
            "groq" => Some(ApiStyle::Groq),
            "openrouter" => Some(ApiStyle::OpenRouter),
            "huggingface" => Some(ApiStyle::HuggingFace),
            _ => None,
        }
    }

    /// Styles speaking the OpenAI chat-completions wire format.
    fn is_chat_completions(&self) -> bool {
        !matches!(self, ApiStyle::Anthropic | ApiStyle::Gemini)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LmRequest {
    /// When absent the client walks its fallback chain with each provider's
    /// first model.
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Caller wants structured (JSON) output.
    #[serde(default)]
    pub json: bool,
}

impl LmRequest {
    /// `[system?, user]`, skipping an empty system prompt.
    pub fn from_prompts(model: Option<String>, system: Option<&str>, prompt: &str) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));
        Self {
            model,
            messages,
            ..Self::default()
        }
    }

    pub fn system_prompt(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn user_prompt(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmResponse {
    pub provider: String,
    pub model: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    Network,
    Timeout,
    RateLimited,
    Server,
    Client,
    InvalidModel,
    UnknownProvider,
    Cancelled,
    Decode,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider}: {message}")]
pub struct CallError {
    pub provider: String,
    pub kind: CallErrorKind,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl CallError {
    pub fn new(provider: impl Into<String>, kind: CallErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            kind,
            status: None,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn from_status(provider: &str, status: u16, message: String, retry_after: Option<Duration>) -> Self {
        let kind = classify_status(status);
        Self {
            provider: provider.to_string(),
            kind,
            status: Some(status),
            retry_after,
            message: format!("HTTP {status}: {message}"),
        }
    }

    /// Network failures, 5xx and provider rate limits may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            CallErrorKind::Network | CallErrorKind::RateLimited | CallErrorKind::Server
        )
    }
}

impl From<CallError> for crate::Error {
    fn from(err: CallError) -> Self {
        let message = err.to_string();
        match err.kind {
            CallErrorKind::RateLimited => crate::Error::RateLimited(message),
            CallErrorKind::Timeout | CallErrorKind::Cancelled => crate::Error::Timeout(message),
            CallErrorKind::InvalidModel | CallErrorKind::UnknownProvider => {
                crate::Error::InvalidInput(message)
            }
            _ => crate::Error::ProviderUnavailable(message),
        }
    }
}

pub fn classify_status(status: u16) -> CallErrorKind {
    match status {
        429 => CallErrorKind::RateLimited,
        408 | 500..=599 => CallErrorKind::Server,
        404 => CallErrorKind::InvalidModel,
        _ => CallErrorKind::Client,
    }
}

/// Common interface for every LM provider.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn api_style(&self) -> ApiStyle;

    /// Whether this provider carries `model`.
    fn supports(&self, model: &str) -> bool;

    /// Models in preference order; the first is used when a request names
    /// no model.
    fn models(&self) -> Vec<String>;

    /// Native JSON response mode.
    fn supports_json_mode(&self) -> bool {
        false
    }

    fn complete(
        &self,
        request: &LmRequest,
        model: &str,
        cancel: &CancelToken,
    ) -> Result<LmResponse, CallError>;
}

/// Wire-level parse result shared by every API style.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCompletion {
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub finish_reason: String,
}

pub struct HttpAdapter {
    name: String,
    style: ApiStyle,
    endpoint: String,
    api_key: Option<String>,
    models: Vec<String>,
    timeout: Duration,
    json_mode: bool,
}

impl HttpAdapter {
    pub fn new(
        name: impl Into<String>,
        style: ApiStyle,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        models: Vec<String>,
        timeout: Duration,
        json_mode: bool,
    ) -> Self {
        Self {
            name: name.into(),
            style,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            models,
            timeout,
            json_mode,
        }
    }

    pub fn from_config(config: &crate::config::ProviderConfig) -> Self {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());
        Self::new(
            config.name.clone(),
            config.api_style,
            config.endpoint.clone(),
            api_key,
            config.models.clone(),
            Duration::from_millis(config.timeout_ms),
            config.json_mode,
        )
    }

    fn url(&self, model: &str) -> String {
        match self.style {
            ApiStyle::Anthropic => format!("{}/messages", self.endpoint),
            ApiStyle::Gemini => match &self.api_key {
                Some(key) => format!(
                    "{}/models/{}:generateContent?key={}",
                    self.endpoint, model, key
                ),
                None => format!("{}/models/{}:generateContent", self.endpoint, model),
            },
            _ => format!("{}/chat/completions", self.endpoint),
        }
    }

    fn send(&self, url: &str, payload: &Value, timeout: Duration) -> Result<Value, CallError> {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let mut request = agent.post(url).set("Content-Type", "application/json");
        match self.style {
            ApiStyle::Anthropic => {
                request = request.set("anthropic-version", ANTHROPIC_VERSION);
                if let Some(key) = &self.api_key {
                    request = request.set("x-api-key", key);
                }
            }
            ApiStyle::Gemini => {}
            _ => {
                if let Some(key) = &self.api_key {
                    request = request.set("Authorization", &format!("Bearer {key}"));
                }
            }
        }

        let response = match request.send_json(payload) {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, resp)) => {
                let retry_after = resp
                    .header("retry-after")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let error_body: Result<Value, _> = resp.into_json();
                let error_msg = match error_body {
                    Ok(json) => json["error"]["message"]
                        .as_str()
                        .unwrap_or("Unknown API error")
                        .to_string(),
                    Err(_) => "unreadable error body".to_string(),
                };
                return Err(CallError::from_status(&self.name, code, error_msg, retry_after));
            }
            Err(err) => {
                return Err(CallError::new(
                    &self.name,
                    CallErrorKind::Network,
                    format!("failed to reach {}: {err}", self.name),
                ));
            }
        };

        response.into_json().map_err(|err| {
            CallError::new(
                &self.name,
                CallErrorKind::Decode,
                format!("invalid response body: {err}"),
            )
        })
    }
}

impl ProviderAdapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn api_style(&self) -> ApiStyle {
        self.style
    }

    fn supports(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn supports_json_mode(&self) -> bool {
        self.json_mode
    }

    fn complete(
        &self,
        request: &LmRequest,
        model: &str,
        cancel: &CancelToken,
    ) -> Result<LmResponse, CallError> {
        if cancel.is_cancelled() {
            return Err(CallError::new(&self.name, CallErrorKind::Cancelled, "cancelled before send"));
        }
        let timeout = cancel.clamp(self.timeout);
        if timeout.is_zero() {
            return Err(CallError::new(&self.name, CallErrorKind::Timeout, "no time left before deadline"));
        }

        let native_json = request.json && self.json_mode;
        let payload = build_payload(self.style, model, request, native_json);
        let started = Instant::now();
        let body = self.send(&self.url(model), &payload, timeout).map_err(|err| {
            if err.kind == CallErrorKind::Network && cancel.is_cancelled() {
                CallError::new(&self.name, CallErrorKind::Timeout, err.message)
            } else {
                err
            }
        })?;
        let parsed = parse_completion(self.style, &body)
            .map_err(|msg| CallError::new(&self.name, CallErrorKind::Decode, msg))?;

        Ok(LmResponse {
            provider: self.name.clone(),
            model: model.to_string(),
            parsed: if request.json { extract_json(&parsed.content) } else { None },
            content: parsed.content,
            tokens_in: parsed.tokens_in,
            tokens_out: parsed.tokens_out,
            latency_ms: started.elapsed().as_millis() as u64,
            finish_reason: parsed.finish_reason,
        })
    }
}

/// Request body for one provider call.
pub fn build_payload(style: ApiStyle, model: &str, request: &LmRequest, native_json: bool) -> Value {
    match style {
        ApiStyle::Anthropic => {
            let messages: Vec<Value> = request
                .messages
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                .collect();
            let mut payload = json!({
                "model": model,
                "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                "messages": messages,
            });
            let system = request.system_prompt();
            if !system.is_empty() {
                payload["system"] = Value::String(system);
            }
            if let Some(t) = request.temperature {
                payload["temperature"] = json!(t);
            }
            payload
        }
        ApiStyle::Gemini => {
            let contents: Vec<Value> = request
                .messages
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .map(|m| {
                    let role = if m.role == MessageRole::Assistant { "model" } else { "user" };
                    json!({ "role": role, "parts": [{ "text": m.content }] })
                })
                .collect();
            let mut generation = json!({
                "maxOutputTokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            });
            if let Some(t) = request.temperature {
                generation["temperature"] = json!(t);
            }
            if native_json {
                generation["responseMimeType"] = json!("application/json");
            }
            let mut payload = json!({ "contents": contents, "generationConfig": generation });
            let system = request.system_prompt();
            if !system.is_empty() {
                payload["systemInstruction"] = json!({ "parts": [{ "text": system }] });
            }
            payload
        }
        _ => {
            debug_assert!(style.is_chat_completions());
            let messages: Vec<Value> = request
                .messages
                .iter()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                .collect();
            let mut payload = json!({
                "model": model,
                "messages": messages,
                "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            });
            if let Some(t) = request.temperature {
                payload["temperature"] = json!(t);
            }
            if native_json {
                payload["response_format"] = json!({ "type": "json_object" });
            }
            payload
        }
    }
}

/// Extracts text, token usage and finish reason from a provider response.
pub fn parse_completion(style: ApiStyle, body: &Value) -> Result<ParsedCompletion, String> {
    match style {
        ApiStyle::Anthropic => {
            let blocks = body["content"]
                .as_array()
                .ok_or_else(|| "No content in Anthropic response".to_string())?;
            let content: String = blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("");
            Ok(ParsedCompletion {
                content,
                tokens_in: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
                tokens_out: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
                finish_reason: body["stop_reason"].as_str().unwrap_or("").to_string(),
            })
        }
        ApiStyle::Gemini => {
            let candidate = &body["candidates"][0];
            let parts = candidate["content"]["parts"]
                .as_array()
                .ok_or_else(|| "No text in Gemini response".to_string())?;
            let content: String = parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("");
            Ok(ParsedCompletion {
                content,
                tokens_in: body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
                tokens_out: body["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
                finish_reason: candidate["finishReason"].as_str().unwrap_or("").to_string(),
            })
        }
        _ => {
            let choice = &body["choices"][0];
            let content = choice["message"]["content"]
                .as_str()
                .ok_or_else(|| format!("No content in {} response", style.as_str()))?
                .to_string();
            Ok(ParsedCompletion {
                content,
                tokens_in: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
                tokens_out: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
                finish_reason: choice["finish_reason"].as_str().unwrap_or("").to_string(),
            })
        }
    }
}

/// Pulls a JSON object or array out of model text: strips a leading code
/// fence, then parses the outermost `{...}` or `[...]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        // drop the info string (```json) up to the first newline
        body = rest.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        body = body.trim_end();
        body = body.strip_suffix("```").unwrap_or(body).trim();
    }

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    let start = body.find(['{', '['])?;
    let close = if body[start..].starts_with('{') { '}' } else { ']' };
    let end = body.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&body[start..=end])
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}
