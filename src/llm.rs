//! Gemini language model client

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{RemoteError, RemoteErrorKind};
use crate::services::{DialogueMessage, LanguageModel, Role, http_client, json_body, send_checked};
use crate::{Error, Result};

const SERVICE: &str = "gemini";
const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const LLM_TIMEOUT: Duration = Duration::from_secs(60);

/// Models tried after the configured one, in order
pub const FALLBACK_MODELS: &[&str] = &[
    "gemini-3-flash-preview",
    "gemini-2.5-flash",
    "gemini-flash-latest",
];

/// Configured model followed by the fallbacks, blanks and duplicates removed
#[must_use]
pub fn model_candidates(configured: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for model in std::iter::once(configured).chain(FALLBACK_MODELS.iter().copied()) {
        let model = model.trim();
        if !model.is_empty() && !out.iter().any(|m| m == model) {
            out.push(model.to_string());
        }
    }
    out
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct SystemInstruction<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    system_instruction: SystemInstruction<'a>,
}

fn build_request<'a>(context: &'a [DialogueMessage], system_prompt: &'a str) -> Result<GenerateRequest<'a>> {
    let contents: Vec<Content<'a>> = context
        .iter()
        .filter_map(|message| {
            let text = message.text.trim();
            if text.is_empty() {
                return None;
            }
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            Some(Content {
                role,
                parts: [Part { text }],
            })
        })
        .collect();

    if contents.is_empty() {
        return Err(Error::Config(
            "dialogue context has no non-empty messages".to_string(),
        ));
    }

    Ok(GenerateRequest {
        contents,
        system_instruction: SystemInstruction {
            parts: [Part {
                text: system_prompt,
            }],
        },
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

fn extract_reply(response: GenerateResponse) -> std::result::Result<String, RemoteError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(RemoteError::new(
            SERVICE,
            RemoteErrorKind::ContentFiltered,
            format!("prompt blocked: {reason}"),
        ));
    }

    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(RemoteError::new(SERVICE, RemoteErrorKind::Malformed, "no candidates"));
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    let text = text.trim();

    if text.is_empty() {
        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(RemoteError::new(
                SERVICE,
                RemoteErrorKind::ContentFiltered,
                "reply blocked for safety",
            ));
        }
        return Err(RemoteError::new(SERVICE, RemoteErrorKind::Malformed, "empty reply"));
    }

    Ok(text.to_string())
}

/// Splits a `text/event-stream` body into `data:` payloads
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed body bytes, returning every event they complete
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            if let Some(event) = self.line(String::from_utf8_lossy(&line).trim()) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is left when the body ends
    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if let Some(event) = self.line(String::from_utf8_lossy(&rest).trim()) {
            return Some(event);
        }
        self.line("")
    }

    fn line(&mut self, row: &str) -> Option<String> {
        if row.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let event = self.data.join("\n");
            self.data.clear();
            return Some(event);
        }
        // ':' comments and non-data fields are ignored
        if let Some(payload) = row.strip_prefix("data:") {
            self.data.push(payload.trim().to_string());
        }
        None
    }
}

/// Text in `chunk` not yet seen, updating `accumulated`
///
/// Chunks are usually increments, but a chunk that repeats the reply so far
/// yields only its new tail.
fn extract_delta(chunk: &str, accumulated: &mut String) -> String {
    if let Some(tail) = chunk.strip_prefix(accumulated.as_str()) {
        let delta = tail.to_string();
        chunk.clone_into(accumulated);
        return delta;
    }
    accumulated.push_str(chunk);
    chunk.to_string()
}

fn finish_reason(response: &GenerateResponse) -> Option<&str> {
    response.candidates.first()?.finish_reason.as_deref()
}

/// Builds a reply from streamed `generateContent` events
#[derive(Debug, Default)]
struct StreamAssembler {
    decoder: SseDecoder,
    text: String,
    finish_reason: Option<String>,
    block_reason: Option<String>,
    done: bool,
}

impl StreamAssembler {
    /// Feed body bytes, returning new text deltas
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let events = self.decoder.push(bytes);
        events.iter().filter_map(|e| self.accept(e)).collect()
    }

    /// End of body
    fn finish(&mut self) -> Vec<String> {
        let events: Vec<String> = self.decoder.finish().into_iter().collect();
        events.iter().filter_map(|e| self.accept(e)).collect()
    }

    fn accept(&mut self, event: &str) -> Option<String> {
        if self.done {
            return None;
        }
        if event == "[DONE]" {
            self.done = true;
            return None;
        }
        let Ok(response) = serde_json::from_str::<GenerateResponse>(event) else {
            tracing::debug!(event, "skipping undecodable stream event");
            return None;
        };

        if let Some(reason) = finish_reason(&response) {
            self.finish_reason = Some(reason.to_string());
        }
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            self.block_reason = Some(reason);
        }

        let text: String = response
            .candidates
            .into_iter()
            .next()?
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.is_empty() {
            return None;
        }
        let delta = extract_delta(&text, &mut self.text);
        (!delta.is_empty()).then_some(delta)
    }

    /// The complete reply, classified the same way as a single response
    fn into_reply(self) -> std::result::Result<String, RemoteError> {
        if let Some(reason) = self.block_reason {
            return Err(RemoteError::new(
                SERVICE,
                RemoteErrorKind::ContentFiltered,
                format!("prompt blocked: {reason}"),
            ));
        }

        let text = self.text.trim();
        if text.is_empty() {
            if self.finish_reason.as_deref() == Some("SAFETY") {
                return Err(RemoteError::new(
                    SERVICE,
                    RemoteErrorKind::ContentFiltered,
                    "reply blocked for safety",
                ));
            }
            return Err(RemoteError::new(SERVICE, RemoteErrorKind::Malformed, "empty reply"));
        }

        if self.finish_reason.as_deref() == Some("MAX_TOKENS") {
            tracing::warn!(chars = text.len(), "reply truncated at the token limit");
        }
        Ok(text.to_string())
    }
}

/// Gemini `generateContent` client with a model fallback chain
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: SecretString,
    models: Vec<String>,
    system_prompt: String,
}

impl GeminiClient {
    /// Create a client for `model` with a fixed system prompt
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(api_key: Option<SecretString>, model: &str, system_prompt: String) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.expose_secret().trim().is_empty())
            .ok_or_else(|| Error::Config("GEMINI_API_KEY is required for replies".to_string()))?;

        Ok(Self {
            client: http_client(LLM_TIMEOUT)?,
            api_key,
            models: model_candidates(model),
            system_prompt,
        })
    }

    /// Models in the order they are tried
    #[must_use]
    pub fn models(&self) -> &[String] {
        &self.models
    }

    async fn generate_once(&self, model: &str, body: &GenerateRequest<'_>) -> Result<String> {
        let request = self
            .client
            .post(format!("{BASE_URL}/models/{model}:generateContent"))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(body);

        let response = send_checked(SERVICE, request).await?;
        let parsed: GenerateResponse = json_body(SERVICE, response).await?;
        Ok(extract_reply(parsed)?)
    }

    async fn stream_once(
        &self,
        model: &str,
        body: &GenerateRequest<'_>,
        deltas: &mpsc::UnboundedSender<String>,
    ) -> Result<String> {
        let request = self
            .client
            .post(format!("{BASE_URL}/models/{model}:streamGenerateContent?alt=sse"))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(body);

        let mut response = send_checked(SERVICE, request).await?;
        let mut assembler = StreamAssembler::default();
        while let Some(bytes) = response
            .chunk()
            .await
            .map_err(|e| RemoteError::from_transport(SERVICE, &e))?
        {
            for delta in assembler.push(&bytes) {
                let _ = deltas.send(delta);
            }
        }
        for delta in assembler.finish() {
            let _ = deltas.send(delta);
        }
        Ok(assembler.into_reply()?)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn reply(&self, context: &[DialogueMessage]) -> Result<String> {
        let body = build_request(context, &self.system_prompt)?;

        let mut last_error = None;
        for model in &self.models {
            match self.generate_once(model, &body).await {
                Ok(text) => {
                    tracing::debug!(model = %model, chars = text.len(), "reply generated");
                    return Ok(text);
                }
                Err(e) if e.remote_kind() == Some(RemoteErrorKind::ModelNotFound) => {
                    tracing::warn!(model = %model, error = %e, "model unavailable, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RemoteError::new(SERVICE, RemoteErrorKind::ModelNotFound, "no model candidates").into()
        }))
    }

    async fn reply_stream(
        &self,
        context: &[DialogueMessage],
        deltas: mpsc::UnboundedSender<String>,
    ) -> Result<String> {
        let body = build_request(context, &self.system_prompt)?;

        // a missing model fails on the status line, before any delta is sent
        let mut last_error = None;
        for model in &self.models {
            match self.stream_once(model, &body, &deltas).await {
                Ok(text) => {
                    tracing::debug!(model = %model, chars = text.len(), "reply streamed");
                    return Ok(text);
                }
                Err(e) if e.remote_kind() == Some(RemoteErrorKind::ModelNotFound) => {
                    tracing::warn!(model = %model, error = %e, "model unavailable, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RemoteError::new(SERVICE, RemoteErrorKind::ModelNotFound, "no model candidates").into()
        }))
    }
}
