//! Gemini REST client.
//!
//! - chat replies stream from `:streamGenerateContent?alt=sse`
//! - the visual classifier and memory retrieval use `:generateContent` with
//!   temperature 0 and thinking disabled
//! - images come from the Imagen `:predict` endpoint
//!
//! The client keeps the multi-turn chat history. A streamed exchange is
//! appended once its stream ends cleanly; an abandoned or failed stream
//! leaves the history untouched.

use super::sse::SseLineParser;
use super::{
    ImagePayload, MEMORY_RETRIEVAL_INSTRUCTION, ModelService, PromptRequest, TextStream,
    VISUAL_CLASSIFIER_INSTRUCTION, memory_retrieval_prompt, normalize_model_error,
    parse_visual_verdict, resolve_memory_reply, visual_classifier_prompt,
};
use crate::config::ModelConfig;
use crate::error::{AssistantError, Result};
use crate::notes::Note;
use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Connection settings for [`GeminiClient`].
#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub image_model: String,
    /// Whole-request bound for one-shot calls. A streamed reply is bounded
    /// only until its response headers arrive; the turn controller bounds
    /// the gaps between chunks.
    pub request_timeout: Duration,
    pub system_instruction: Option<String>,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("image_model", &self.image_model)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let defaults = ModelConfig::default();
        Self {
            api_key: api_key.into(),
            base_url: defaults.base_url,
            model: model.into(),
            image_model: defaults.image_model,
            request_timeout: Duration::from_secs(defaults.request_timeout_secs),
            system_instruction: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = model.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Build from the `[model]` config section.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Config`] when no API key is configured.
    pub fn from_model_config(config: &ModelConfig) -> Result<Self> {
        let api_key = config.resolved_api_key().ok_or_else(|| {
            AssistantError::Config(format!(
                "no Gemini API key: set model.api_key or {}",
                crate::config::API_KEY_ENV
            ))
        })?;
        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            model: config.model.clone(),
            image_model: config.image_model.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            system_instruction: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Content {
    role: String,
    parts: Vec<Value>,
}

impl Content {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: role.to_owned(),
            parts: vec![json!({ "text": text })],
        }
    }

    fn user(request: &PromptRequest) -> Self {
        let mut parts = Vec::with_capacity(2);
        if let Some(image) = &request.image {
            parts.push(json!({
                "inlineData": { "mimeType": image.mime_type, "data": image.data }
            }));
        }
        parts.push(json!({ "text": request.text }));
        Self {
            role: "user".to_owned(),
            parts,
        }
    }
}

/// Whether `request_timeout` covers reading the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLimit {
    Bounded,
    Streamed,
}

/// HTTP client for the Gemini API.
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
    system_instruction: Mutex<Option<String>>,
    history: Arc<Mutex<Vec<Content>>>,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("config", &self.config)
            .field("history_len", &self.history_len())
            .finish()
    }
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        let system_instruction = Mutex::new(config.system_instruction.clone());
        Self {
            config,
            client: reqwest::Client::new(),
            system_instruction,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of stored chat contents (two per completed exchange).
    pub fn history_len(&self) -> usize {
        lock(&self.history).len()
    }

    /// Forget the chat session.
    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/v1beta/models/{model}:{method}", self.config.base_url)
    }

    fn chat_body(&self, contents: &[Content]) -> Value {
        let mut body = json!({ "contents": contents });
        let instruction = match self.system_instruction.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(instruction) = instruction {
            body["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
        }
        body
    }

    /// Send a request. The response headers must arrive within
    /// `request_timeout`; `BodyLimit::Bounded` also bounds reading the body.
    async fn post(&self, url: &str, body: &Value, limit: BodyLimit) -> Result<reqwest::Response> {
        let timeout = self.config.request_timeout;
        let mut request = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(body);
        if limit == BodyLimit::Bounded {
            request = request.timeout(timeout);
        }

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| {
                warn!("Gemini did not respond within {}s", timeout.as_secs());
                AssistantError::Model(format!(
                    "Gemini did not respond within {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| AssistantError::Model(format!("Gemini request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to read Gemini error body: {e}");
                    String::new()
                }
            };
            return Err(map_http_error(status, &body_text));
        }
        Ok(response)
    }

    /// One deterministic, non-streamed completion.
    async fn generate_text(&self, system_instruction: &str, prompt: &str) -> Result<String> {
        let body = json!({
            "contents": [Content::text("user", prompt)],
            "systemInstruction": { "parts": [{ "text": system_instruction }] },
            "generationConfig": {
                "temperature": 0,
                "thinkingConfig": { "thinkingBudget": 0 }
            }
        });
        let url = self.model_url(&self.config.model, "generateContent");
        let response = self
            .post(&url, &body, BodyLimit::Bounded)
            .await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| AssistantError::Model(format!("invalid Gemini response: {e}")))?;
        let text = candidate_text(&value);
        if text.trim().is_empty() {
            return Err(AssistantError::Model(
                "No response text received from Gemini".to_owned(),
            ));
        }
        Ok(text)
    }
}

#[async_trait]
impl ModelService for GeminiClient {
    async fn stream_text(&self, request: PromptRequest) -> Result<TextStream> {
        let mut contents = lock(&self.history).clone();
        contents.push(Content::user(&request));
        let body = self.chat_body(&contents);
        let url = format!(
            "{}?alt=sse",
            self.model_url(&self.config.model, "streamGenerateContent")
        );

        let response = self.post(&url, &body, BodyLimit::Streamed).await?;
        debug!("Gemini stream opened ({} history contents)", contents.len() - 1);

        // Frames stay out of the stored history to keep later requests small.
        let user = Content::text("user", &request.text);
        Ok(Box::pin(reply_stream(
            response.bytes_stream(),
            user,
            Arc::clone(&self.history),
        )))
    }

    async fn generate_image(&self, prompt: &str) -> Result<ImagePayload> {
        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": 1,
                "outputMimeType": "image/jpeg",
                "aspectRatio": "1:1"
            }
        });
        let url = self.model_url(&self.config.image_model, "predict");
        let response = self
            .post(&url, &body, BodyLimit::Bounded)
            .await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| AssistantError::Model(format!("invalid Imagen response: {e}")))?;

        let prediction = value
            .get("predictions")
            .and_then(|p| p.get(0))
            .ok_or_else(|| AssistantError::Model("No images were generated.".to_owned()))?;
        let data = prediction
            .get("bytesBase64Encoded")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AssistantError::Model("No image was generated.".to_owned()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| AssistantError::Model(format!("image payload is not base64: {e}")))?;
        let mime_type = prediction
            .get("mimeType")
            .and_then(Value::as_str)
            .unwrap_or("image/jpeg");

        info!("image generated ({} base64 bytes)", data.len());
        Ok(ImagePayload {
            mime_type: mime_type.to_owned(),
            base64_data: data.to_owned(),
        })
    }

    async fn classify_visual(&self, prompt: &str) -> Result<bool> {
        let reply = self
            .generate_text(VISUAL_CLASSIFIER_INSTRUCTION, &visual_classifier_prompt(prompt))
            .await?;
        let visual = parse_visual_verdict(&reply);
        debug!(reply = reply.trim(), visual, "visual classifier");
        Ok(visual)
    }

    async fn retrieve_memory(&self, prompt: &str, memories: &[Note]) -> Result<Option<String>> {
        if !memories.iter().any(Note::is_memory) {
            return Ok(None);
        }
        let reply = self
            .generate_text(
                MEMORY_RETRIEVAL_INSTRUCTION,
                &memory_retrieval_prompt(prompt, memories),
            )
            .await?;
        let context = resolve_memory_reply(&reply, memories);
        if context.is_some() {
            info!("memory context found (reply {})", reply.trim());
        }
        Ok(context)
    }

    fn reset_session(&self, system_instruction: &str) {
        match self.system_instruction.lock() {
            Ok(mut guard) => *guard = Some(system_instruction.to_owned()),
            Err(poisoned) => *poisoned.into_inner() = Some(system_instruction.to_owned()),
        }
        self.clear_history();
        info!("chat session reset");
    }
}

fn lock(history: &Mutex<Vec<Content>>) -> MutexGuard<'_, Vec<Content>> {
    match history.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Map an HTTP error status to the user-facing error.
fn map_http_error(status: reqwest::StatusCode, body: &str) -> AssistantError {
    let message = extract_error_message(body);
    warn!("Gemini HTTP {}: {message}", status.as_u16());
    normalize_model_error(
        Some(status.as_u16()),
        &format!("Gemini HTTP {}: {message}", status.as_u16()),
    )
}

/// Extract `error.message` from a Gemini error body, or return the body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

/// Concatenated text parts of the first candidate.
fn candidate_text(value: &Value) -> String {
    value
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Text carried by one SSE `data:` payload.
///
/// Unparseable payloads are skipped; an embedded `error` object ends the
/// stream with an error.
fn parse_stream_chunk(data: &str) -> Result<Option<String>> {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            warn!("skipping malformed stream chunk: {e}");
            return Ok(None);
        }
    };
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown stream error");
        let code = error
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok());
        return Err(normalize_model_error(code, message));
    }
    let text = candidate_text(&value);
    Ok((!text.is_empty()).then_some(text))
}

struct StreamState {
    byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    parser: SseLineParser,
    buffer: VecDeque<Result<String>>,
    reply: String,
    user: Content,
    history: Arc<Mutex<Vec<Content>>>,
    failed: bool,
    finished: bool,
}

impl StreamState {
    fn ingest(&mut self, data: &str) {
        match parse_stream_chunk(data) {
            Ok(Some(text)) => {
                self.reply.push_str(&text);
                self.buffer.push_back(Ok(text));
            }
            Ok(None) => {}
            Err(e) => {
                self.failed = true;
                self.finished = true;
                self.buffer.push_back(Err(e));
            }
        }
    }

    fn record_exchange(&self) {
        if self.failed || self.reply.is_empty() {
            return;
        }
        let mut history = lock(&self.history);
        history.push(self.user.clone());
        history.push(Content::text("model", &self.reply));
    }
}

fn reply_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    user: Content,
    history: Arc<Mutex<Vec<Content>>>,
) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        StreamState {
            byte_stream: Box::pin(byte_stream),
            parser: SseLineParser::new(),
            buffer: VecDeque::new(),
            reply: String::new(),
            user,
            history,
            failed: false,
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.buffer.pop_front() {
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        for event in state.parser.push(&chunk) {
                            state.ingest(&event.data);
                            if state.finished {
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.failed = true;
                        state.finished = true;
                        let err = AssistantError::Model(format!("stream read error: {e}"));
                        return Some((Err(err), state));
                    }
                    None => {
                        if let Some(event) = state.parser.flush() {
                            state.ingest(&event.data);
                        }
                        state.finished = true;
                        state.record_exchange();
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::model::ImageFrame;

    fn client() -> GeminiClient {
        GeminiClient::new(
            GeminiConfig::new("key", "gemini-2.5-flash")
                .with_base_url("http://localhost:1")
                .with_system_instruction("be brief"),
        )
    }

    // ── request building ────────────────────────────────────────────

    #[test]
    fn chat_body_carries_system_instruction() {
        let body = client().chat_body(&[Content::text("user", "hi")]);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn reset_session_replaces_instruction_and_history() {
        let c = client();
        lock(&c.history).push(Content::text("user", "old"));
        c.reset_session("be kind");
        assert_eq!(c.history_len(), 0);
        let body = c.chat_body(&[]);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be kind");
    }

    #[test]
    fn user_content_puts_frame_before_text() {
        let request = PromptRequest {
            text: "what is this?".into(),
            image: Some(ImageFrame {
                mime_type: "image/jpeg".into(),
                data: "AAAA".into(),
            }),
        };
        let content = Content::user(&request);
        assert_eq!(content.parts[0]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(content.parts[1]["text"], "what is this?");
    }

    #[test]
    fn model_urls() {
        let c = client();
        assert_eq!(
            c.model_url("gemini-2.5-flash", "generateContent"),
            "http://localhost:1/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn config_requires_api_key() {
        let config = ModelConfig {
            api_key: Some("k".into()),
            base_url: "http://example.test/".into(),
            ..ModelConfig::default()
        };
        let gemini = GeminiConfig::from_model_config(&config).unwrap();
        assert_eq!(gemini.base_url, "http://example.test");
        assert!(!format!("{gemini:?}").contains("\"k\""));
    }

    // ── response parsing ────────────────────────────────────────────

    #[test]
    fn stream_chunk_text_is_concatenated() {
        let data = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#;
        assert_eq!(parse_stream_chunk(data).unwrap().as_deref(), Some("Hello"));
    }

    #[test]
    fn stream_chunk_without_text_is_skipped() {
        let data = r#"{"candidates":[{"finishReason":"STOP"}],"usageMetadata":{}}"#;
        assert!(parse_stream_chunk(data).unwrap().is_none());
        assert!(parse_stream_chunk("not json").unwrap().is_none());
    }

    #[test]
    fn stream_chunk_error_is_normalized() {
        let data = r#"{"error":{"code":429,"message":"Resource has been exhausted","status":"RESOURCE_EXHAUSTED"}}"#;
        assert!(matches!(
            parse_stream_chunk(data),
            Err(AssistantError::QuotaExceeded)
        ));
    }

    #[test]
    fn extract_error_from_json_or_body() {
        assert_eq!(
            extract_error_message(r#"{"error":{"code":400,"message":"API key not valid"}}"#),
            "API key not valid"
        );
        assert_eq!(extract_error_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn http_errors_map_to_taxonomy() {
        assert!(matches!(
            map_http_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "{}"),
            AssistantError::QuotaExceeded
        ));
        match map_http_error(reqwest::StatusCode::BAD_REQUEST, r#"{"error":{"message":"bad"}}"#) {
            AssistantError::Model(msg) => assert_eq!(msg, "Gemini HTTP 400: bad"),
            other => panic!("unexpected {other:?}"),
        }
    }

    // ── reply stream ────────────────────────────────────────────────

    fn byte_chunks(chunks: &[&'static str]) -> impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static {
        let items: Vec<reqwest::Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        futures_util::stream::iter(items)
    }

    #[tokio::test]
    async fn completed_stream_is_recorded_in_history() {
        let history = Arc::new(Mutex::new(Vec::new()));
        let stream = reply_stream(
            byte_chunks(&[
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi \"}]}}]}\r\n\r\n",
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"there\"}]}}]}\r\n\r\n",
            ]),
            Content::text("user", "hello"),
            Arc::clone(&history),
        );
        let parts: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(parts, vec!["Hi ", "there"]);

        let history = history.lock().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], Content::text("model", "Hi there"));
    }

    #[tokio::test]
    async fn failed_stream_is_not_recorded() {
        let history = Arc::new(Mutex::new(Vec::new()));
        let stream = reply_stream(
            byte_chunks(&[
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\n\n",
                "data: {\"error\":{\"code\":500,\"message\":\"internal\"}}\n\n",
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"never\"}]}}]}\n\n",
            ]),
            Content::text("user", "hello"),
            Arc::clone(&history),
        );
        let items: Vec<Result<String>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(&items[1], Err(AssistantError::Model(m)) if m == "internal"));
        assert!(history.lock().unwrap().is_empty());
    }
}
