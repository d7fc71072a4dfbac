//! Extraction client: one structured-output request to an LLM provider.
//!
//! Providers are a closed set selected by [`ProviderConfig`]. The client makes
//! exactly one attempt per call and never retries; the report task owns the
//! retry policy.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{
    error::{ExtractionError, ExtractionErrorKind},
    models::ExtractionMetadata,
    schema::TemplateSchema,
};

const SYSTEM_PROMPT: &str =
    "You are a medical AI assistant specialized in structuring radiology reports.";
const ANTHROPIC_TOOL_NAME: &str = "extract_radiology_data";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

impl ProviderKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAi => "https://api.openai.com",
            Self::Ollama => "http://localhost:11434",
        }
    }
}

/// Everything needed to reach one provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub max_tokens: u32,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            api_key: None,
            base_url: kind.default_base_url().to_string(),
            timeout: Duration::from_secs(60),
            max_tokens: 2000,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Structured data returned by a successful extraction
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub data: Value,
    pub metadata: ExtractionMetadata,
}

/// Uniform capability over LLM providers
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        report_text: &str,
        schema: &TemplateSchema,
        config: &ProviderConfig,
    ) -> Result<Extraction, ExtractionError>;
}

/// Extractor that talks to providers over HTTP
#[derive(Clone, Default)]
pub struct HttpExtractor {
    client: Client,
}

impl HttpExtractor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn post(
        &self,
        config: &ProviderConfig,
        url: String,
        payload: &Value,
    ) -> Result<Value, ExtractionError> {
        let mut request = self
            .client
            .post(url)
            .timeout(config.timeout)
            .header("Content-Type", "application/json")
            .json(payload);

        request = match (config.kind, &config.api_key) {
            (ProviderKind::Anthropic, Some(key)) => request
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            (ProviderKind::Anthropic, None) => {
                request.header("anthropic-version", ANTHROPIC_VERSION)
            }
            (_, Some(key)) => request.header("Authorization", format!("Bearer {}", key)),
            (_, None) => request,
        };

        let response = request.send().await.map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<Value>()
            .await
            .map_err(classify_transport_error)
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(
        &self,
        report_text: &str,
        schema: &TemplateSchema,
        config: &ProviderConfig,
    ) -> Result<Extraction, ExtractionError> {
        let prompt = build_prompt(report_text, schema);
        let started = Instant::now();

        let (payload, url) = match config.kind {
            ProviderKind::Anthropic => (
                anthropic_payload(&prompt, schema, config),
                config.endpoint("/v1/messages"),
            ),
            ProviderKind::OpenAi | ProviderKind::Ollama => (
                chat_completion_payload(&prompt, schema, config),
                config.endpoint("/v1/chat/completions"),
            ),
        };

        debug!(
            provider = config.kind.as_str(),
            model = %config.model,
            url = %url,
            "Sending extraction request"
        );

        let body = self.post(config, url, &payload).await.map_err(|e| {
            warn!(provider = config.kind.as_str(), error = %e, "Extraction request failed");
            e
        })?;

        let parsed = match config.kind {
            ProviderKind::Anthropic => parse_anthropic_response(&body)?,
            ProviderKind::OpenAi | ProviderKind::Ollama => parse_chat_completion_response(&body)?,
        };

        let data = schema.conform(&parsed.payload).ok_or_else(|| {
            ExtractionError::invalid_response_shape("structured output is not a JSON object")
        })?;

        debug!(
            provider = config.kind.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Extraction response parsed"
        );

        Ok(Extraction {
            data,
            metadata: ExtractionMetadata {
                provider: config.kind.as_str().to_string(),
                model: config.model.clone(),
                attempts: 1,
                input_tokens: parsed.input_tokens,
                output_tokens: parsed.output_tokens,
            },
        })
    }
}

pub fn build_prompt(report_text: &str, schema: &TemplateSchema) -> String {
    let template_fields =
        serde_json::to_string_pretty(&schema.describe()).unwrap_or_else(|_| "{}".to_string());

    format!(
        "{SYSTEM_PROMPT}

Given the following radiology report text and template structure, extract the relevant information and return it as a structured JSON object.

RADIOLOGY REPORT:
{report_text}

TEMPLATE STRUCTURE:
{template_fields}

INSTRUCTIONS:
1. Extract information from the report that matches the template fields
2. Use null for fields where information is not found
3. Maintain medical accuracy and terminology
4. Return ONLY a valid JSON object matching the template structure
5. Do not include any explanatory text, only the JSON

RESPONSE (JSON only):"
    )
}

fn anthropic_payload(prompt: &str, schema: &TemplateSchema, config: &ProviderConfig) -> Value {
    json!({
        "model": config.model,
        "max_tokens": config.max_tokens,
        "tools": [{
            "name": ANTHROPIC_TOOL_NAME,
            "description": "Extract structured radiology report data according to the template",
            "input_schema": schema.to_json_schema(),
        }],
        "tool_choice": { "type": "tool", "name": ANTHROPIC_TOOL_NAME },
        "messages": [{ "role": "user", "content": prompt }],
    })
}

fn chat_completion_payload(prompt: &str, schema: &TemplateSchema, config: &ProviderConfig) -> Value {
    json!({
        "model": config.model,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": prompt },
        ],
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": "radiology_report",
                "schema": schema.to_json_schema(),
            },
        },
        "temperature": 0.1,
        "max_tokens": config.max_tokens,
    })
}

#[derive(Debug, PartialEq)]
struct ParsedResponse {
    payload: Value,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

fn parse_anthropic_response(body: &Value) -> Result<ParsedResponse, ExtractionError> {
    let blocks = body["content"].as_array().ok_or_else(|| {
        ExtractionError::invalid_response_shape("response has no content blocks")
    })?;

    let payload = blocks
        .iter()
        .find(|block| block["type"] == "tool_use")
        .map(|block| block["input"].clone())
        .ok_or_else(|| {
            ExtractionError::invalid_response_shape("no structured data returned from anthropic")
        })?;

    Ok(ParsedResponse {
        payload,
        input_tokens: body["usage"]["input_tokens"].as_u64(),
        output_tokens: body["usage"]["output_tokens"].as_u64(),
    })
}

fn parse_chat_completion_response(body: &Value) -> Result<ParsedResponse, ExtractionError> {
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| ExtractionError::invalid_response_shape("invalid response format from LLM"))?;

    let payload = serde_json::from_str::<Value>(strip_code_fences(content)).map_err(|e| {
        ExtractionError::invalid_response_shape(format!(
            "failed to parse AI response as JSON: {}",
            e
        ))
    })?;

    Ok(ParsedResponse {
        payload,
        input_tokens: body["usage"]["prompt_tokens"].as_u64(),
        output_tokens: body["usage"]["completion_tokens"].as_u64(),
    })
}

/// Models sometimes wrap JSON in a markdown block even when asked not to.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

fn classify_status(status: StatusCode, body: &str) -> ExtractionError {
    let message = format!("provider returned {}: {}", status, truncate(body, 200));
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => ExtractionErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ExtractionErrorKind::Timeout,
        s if s.is_server_error() => ExtractionErrorKind::ProviderUnavailable,
        s if s.is_client_error() => ExtractionErrorKind::RequestRejected,
        _ => ExtractionErrorKind::ProviderUnavailable,
    };
    ExtractionError::new(kind, message)
}

fn classify_transport_error(error: reqwest::Error) -> ExtractionError {
    if error.is_timeout() {
        ExtractionError::timeout(error.to_string())
    } else if error.is_decode() {
        ExtractionError::invalid_response_shape(error.to_string())
    } else {
        ExtractionError::provider_unavailable(error.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
