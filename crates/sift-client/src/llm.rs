use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sift_core::error::AppError;
use sift_core::models::{
    Candidates, Confidence, FieldAnswer, FieldSchema, Inference, Synthesis, Usage,
};
use sift_core::traits::{FieldOracle, PatternOracle};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(20);

const DEFAULT_DATA_PROMPT: &str = "You extract fields from document text (often OCR output). \
For every requested field, answer with an object {\"value\": <string or null>, \"confidence\": \"high\" | \"medium\" | \"low\"}. \
Use null when the document does not contain the field. Copy values exactly as they appear. \
Respond ONLY with a JSON object keyed by field name.";

const DEFAULT_PATTERN_PROMPT: &str = "You write regular expressions that extract fields from document text. \
For every field you receive its description and the value that must be extracted from this document. \
Write one pattern per field in Rust `regex` syntax (no look-around, no backreferences). \
Anchor each pattern on the nearby labels that will appear in similar documents, not on the value itself, \
and capture the value in exactly one capture group. Patterns run in multi-line mode with `.` matching newlines. \
Respond ONLY with a JSON object mapping field name to pattern string.";

/// OpenAI-compatible chat client acting as both field and pattern oracle.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
#[derive(Clone)]
pub struct OpenAiOracle {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    data_prompt: String,
    pattern_prompt: String,
}

impl OpenAiOracle {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let rebuilt = Self::build(&self.api_key, &self.model, &self.base_url, timeout)?;
        Ok(Self {
            data_prompt: self.data_prompt,
            pattern_prompt: self.pattern_prompt,
            ..rebuilt
        })
    }

    pub fn with_data_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.data_prompt = prompt.into();
        self
    }

    pub fn with_pattern_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.pattern_prompt = prompt.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
            data_prompt: DEFAULT_DATA_PROMPT.to_string(),
            pattern_prompt: DEFAULT_PATTERN_PROMPT.to_string(),
        })
    }

    /// Send one chat completion in JSON mode and return the parsed object with its usage.
    async fn complete(&self, system: &str, user: String) -> Result<(Value, Usage), AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::OracleTimeout(self.timeout)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {}", e))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            if status_code == 429 {
                return Err(AppError::RateLimitExceeded);
            }
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status_code, body));

            return Err(AppError::LlmError {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            AppError::OracleProtocolError(format!("Failed to parse LLM response: {}", e))
        })?;
        read_completion(chat_response, started.elapsed())
    }
}

/// Pull the JSON answer out of a completion. Usage is read first so a billed
/// call with an unusable answer still reports its tokens.
fn read_completion(
    chat_response: ChatResponse,
    elapsed: Duration,
) -> Result<(Value, Usage), AppError> {
    let usage = Usage {
        tokens: chat_response.usage.map_or(0, |u| u.total_tokens),
        duration: elapsed,
    };

    let content = chat_response
        .choices
        .first()
        .and_then(|c| c.message.content.as_deref())
        .ok_or_else(|| malformed("Empty response from LLM".into(), &usage))?;

    let value = serde_json::from_str(content).map_err(|e| {
        malformed(
            format!("LLM returned invalid JSON: {}. Raw: {}", e, content),
            &usage,
        )
    })?;
    Ok((value, usage))
}

fn malformed(message: String, usage: &Usage) -> AppError {
    AppError::MalformedAnswer {
        message,
        tokens: usage.tokens,
    }
}

/// Keep the tokens of a billed call when its answer fails to parse.
fn with_usage(error: AppError, usage: &Usage) -> AppError {
    match error {
        AppError::OracleProtocolError(message) => malformed(message, usage),
        other => other,
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    total_tokens: u64,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ---- Prompt building and response parsing ----

fn data_request(text: &str, fields: &FieldSchema) -> String {
    let wanted: Vec<String> = fields
        .iter()
        .map(|(name, description)| format!("- {}: {}", name, description))
        .collect();
    format!(
        "Fields:\n{}\n\nDocument text:\n\n{}",
        wanted.join("\n"),
        text
    )
}

fn pattern_request(text: &str, candidates: &Candidates) -> String {
    let wanted: Vec<String> = candidates
        .iter()
        .map(|(name, c)| {
            format!(
                "- {}: {}\n  value in this document: {}",
                name, c.description, c.reference_value
            )
        })
        .collect();
    format!(
        "Fields:\n{}\n\nDocument text:\n\n{}",
        wanted.join("\n"),
        text
    )
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Read per-field answers. Accepts `{"value"|"dado": .., "confidence": ..}`
/// objects or bare scalars; fields that were not requested are dropped.
fn parse_answers(
    response: &Value,
    fields: &FieldSchema,
) -> Result<HashMap<String, FieldAnswer>, AppError> {
    let Value::Object(map) = response else {
        return Err(AppError::OracleProtocolError(format!(
            "Expected a JSON object of field answers, got: {}",
            response
        )));
    };

    let mut answers = HashMap::new();
    for name in fields.names() {
        let Some(entry) = map.get(name) else {
            continue;
        };
        let answer = match entry {
            Value::Object(obj) => {
                let value = obj
                    .get("value")
                    .or_else(|| obj.get("dado"))
                    .and_then(scalar_to_string);
                let confidence = obj
                    .get("confidence")
                    .and_then(|c| serde_json::from_value::<Confidence>(c.clone()).ok())
                    .unwrap_or_default();
                FieldAnswer { value, confidence }
            }
            other => FieldAnswer {
                value: scalar_to_string(other),
                confidence: Confidence::Unknown,
            },
        };
        answers.insert(name.to_string(), answer);
    }
    Ok(answers)
}

/// Read per-field patterns. Accepts strings or `{"regex"|"pattern": ..}` objects.
fn parse_patterns(
    response: &Value,
    candidates: &Candidates,
) -> Result<HashMap<String, String>, AppError> {
    let Value::Object(map) = response else {
        return Err(AppError::OracleProtocolError(format!(
            "Expected a JSON object of patterns, got: {}",
            response
        )));
    };

    Ok(candidates
        .keys()
        .filter_map(|name| {
            let pattern = match map.get(name)? {
                Value::String(s) => s.clone(),
                Value::Object(obj) => obj
                    .get("regex")
                    .or_else(|| obj.get("pattern"))?
                    .as_str()?
                    .to_string(),
                _ => return None,
            };
            Some((name.clone(), pattern))
        })
        .collect())
}

impl FieldOracle for OpenAiOracle {
    async fn infer(&self, text: &str, fields: &FieldSchema) -> Result<Inference, AppError> {
        let (response, usage) = self
            .complete(&self.data_prompt, data_request(text, fields))
            .await?;
        let answers = parse_answers(&response, fields).map_err(|e| with_usage(e, &usage))?;
        tracing::debug!(
            model = %self.model,
            requested = fields.len(),
            answered = answers.len(),
            tokens = usage.tokens,
            "Field inference complete"
        );
        Ok(Inference { answers, usage })
    }
}

impl PatternOracle for OpenAiOracle {
    async fn synthesize(&self, text: &str, candidates: &Candidates) -> Result<Synthesis, AppError> {
        let (response, usage) = self
            .complete(&self.pattern_prompt, pattern_request(text, candidates))
            .await?;
        let patterns =
            parse_patterns(&response, candidates).map_err(|e| with_usage(e, &usage))?;
        tracing::debug!(
            model = %self.model,
            requested = candidates.len(),
            returned = patterns.len(),
            tokens = usage.tokens,
            "Pattern synthesis complete"
        );
        Ok(Synthesis { patterns, usage })
    }
}
