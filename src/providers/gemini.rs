/*!
 * Gemini generative language client.
 *
 * Calls `streamGenerateContent` with `alt=sse` and yields the text parts of
 * every server-sent event in the order they arrive.
 */

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use url::Url;

use crate::app_config::ProviderConfig;
use crate::credentials::Credential;
use crate::errors::ProviderError;
use crate::providers::{TextProvider, TextStream};

/// Safety categories relaxed for every call
const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Gemini request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    contents: Vec<GeminiContent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,

    generation_config: GenerationConfig,

    safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    /// Set on reasoning summaries, which are not part of the answer
    #[serde(default, skip_serializing)]
    thought: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    response_mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: u32,
}

#[derive(Debug, Clone, Serialize)]
struct SafetySetting {
    category: String,
    threshold: String,
}

/// One streamed response chunk
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl GeminiRequest {
    /// Build a single-turn request from the provider settings
    pub fn new(prompt: &str, config: &ProviderConfig, system_prompt: Option<&str>) -> Self {
        Self {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: Some(prompt.to_string()),
                    thought: None,
                }],
            }],
            system_instruction: system_prompt.map(|text| GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: Some(text.to_string()),
                    thought: None,
                }],
            }),
            generation_config: GenerationConfig {
                temperature: config.temperature,
                top_p: config.top_p,
                top_k: config.top_k,
                response_mime_type: "text/plain".to_string(),
                thinking_config: config
                    .thinking_budget
                    .map(|thinking_budget| ThinkingConfig { thinking_budget }),
            },
            safety_settings: HARM_CATEGORIES
                .iter()
                .map(|category| SafetySetting {
                    category: category.to_string(),
                    threshold: "BLOCK_NONE".to_string(),
                })
                .collect(),
        }
    }
}

/// Gemini client for streaming generation
#[derive(Debug)]
pub struct GeminiProvider {
    /// HTTP client for API requests
    client: Client,
    /// Fully built streaming endpoint
    url: Url,
    config: ProviderConfig,
    system_prompt: Option<String>,
}

impl GeminiProvider {
    /// Create a new Gemini client
    ///
    /// No client-level timeout is set: the translation client bounds every call.
    pub fn new(config: ProviderConfig, system_prompt: Option<String>) -> Result<Self, ProviderError> {
        let url = Self::stream_url(&config.endpoint, &config.model)?;

        Ok(Self {
            client: Client::builder()
                .build()
                .map_err(|e| ProviderError::ConnectionError(e.to_string()))?,
            url,
            config,
            system_prompt,
        })
    }

    fn stream_url(endpoint: &str, model: &str) -> Result<Url, ProviderError> {
        let raw = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            endpoint.trim_end_matches('/'),
            model
        );
        Url::parse(&raw).map_err(|e| ProviderError::RequestFailed(format!("invalid endpoint {}: {}", raw, e)))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn classify_status(status: StatusCode, body: String) -> ProviderError {
        match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimitExceeded(body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::AuthenticationError(body),
            _ => ProviderError::ApiError {
                status_code: status.as_u16(),
                message: body,
            },
        }
    }
}

#[async_trait]
impl TextProvider for GeminiProvider {
    async fn stream(&self, credential: &Credential, prompt: &str) -> Result<TextStream, ProviderError> {
        let request = GeminiRequest::new(prompt, &self.config, self.system_prompt.as_deref());

        let response = self
            .client
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", credential.key())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ProviderError::ConnectionError(e.to_string())
                } else {
                    ProviderError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to get error response text".to_string());
            error!("Gemini API error ({}): {}", status, error_text);
            return Err(Self::classify_status(status, error_text));
        }

        debug!("Gemini stream opened with credential {}", credential.redacted());
        Ok(sse_text_stream(response))
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

/// Splits a byte stream into SSE `data:` payloads
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed received bytes; returns the payloads of the events completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            self.feed_line(line, &mut events);
        }

        events
    }

    /// Flush whatever is left when the body ends
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end().to_string();
            self.feed_line(&line, &mut events);
        }
        self.feed_line("", &mut events);
        events
    }

    fn feed_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                events.push(self.data.join("\n"));
                self.data.clear();
            }
        } else if let Some(payload) = line.strip_prefix("data:") {
            self.data.push(payload.trim_start().to_string());
        }
    }
}

/// Extract the answer text of one SSE payload
///
/// Returns `Ok(None)` for events that carry no answer text.
pub fn parse_event(payload: &str) -> Result<Option<String>, ProviderError> {
    if payload.trim() == "[DONE]" {
        return Ok(None);
    }

    let chunk: StreamChunk =
        serde_json::from_str(payload).map_err(|e| ProviderError::ParseError(format!("{}: {}", e, payload)))?;

    if let Some(err) = chunk.error {
        let message = format!("{} {}: {}", err.code, err.status, err.message);
        return Err(if err.code == 429 || err.status == "RESOURCE_EXHAUSTED" {
            ProviderError::RateLimitExceeded(message)
        } else {
            ProviderError::ApiError {
                status_code: err.code,
                message,
            }
        });
    }

    let text: String = chunk
        .candidates
        .iter()
        .filter_map(|c| c.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .filter(|part| part.thought != Some(true))
        .filter_map(|part| part.text.as_deref())
        .collect();

    Ok((!text.is_empty()).then_some(text))
}

struct SseState {
    body: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, ProviderError>>,
    done: bool,
}

fn sse_text_stream(response: reqwest::Response) -> TextStream {
    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
        .boxed();

    let state = SseState {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            let events = match state.body.next().await {
                Some(Ok(bytes)) => state.decoder.push(&bytes),
                Some(Err(e)) => {
                    state.done = true;
                    state
                        .pending
                        .push_back(Err(ProviderError::ConnectionError(e.to_string())));
                    continue;
                }
                None => {
                    state.done = true;
                    state.decoder.finish()
                }
            };

            for payload in events {
                match parse_event(&payload) {
                    Ok(Some(text)) => state.pending.push_back(Ok(text)),
                    Ok(None) => {}
                    Err(e) => {
                        state.pending.push_back(Err(e));
                        state.done = true;
                        break;
                    }
                }
            }
        }
    })
    .boxed()
}
