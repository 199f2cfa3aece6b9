//! Cloud collaborator interfaces
//!
//! The conversation loop only sees these traits; provider clients live in
//! [`crate::voice::stt`], [`crate::voice::tts`] and [`crate::llm`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{RemoteError, RemoteErrorKind};
use crate::voice::AudioClip;
use crate::{Error, Result};

/// Speaker of a dialogue message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The person talking to the pet
    User,
    /// The pet's reply
    Assistant,
}

/// One utterance in the dialogue context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueMessage {
    /// Who said it
    pub role: Role,
    /// What was said
    pub text: String,
}

impl DialogueMessage {
    /// A user utterance
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    /// An assistant reply
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Remote speech-to-text
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe a captured utterance
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] on network, auth or quota failures
    async fn transcribe(&self, clip: &AudioClip) -> Result<String>;
}

/// Remote language model
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Reply to the dialogue so far; the last message is the user's
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] on network, auth, quota or content-filter
    /// failures
    async fn reply(&self, context: &[DialogueMessage]) -> Result<String>;

    /// Reply while sending text deltas to `deltas` as they arrive
    ///
    /// Returns the complete reply. Models without a streaming endpoint send
    /// the whole reply as a single delta.
    ///
    /// # Errors
    ///
    /// Same as [`LanguageModel::reply`]
    async fn reply_stream(
        &self,
        context: &[DialogueMessage],
        deltas: mpsc::UnboundedSender<String>,
    ) -> Result<String> {
        let text = self.reply(context).await?;
        let _ = deltas.send(text.clone());
        Ok(text)
    }
}

/// Text-to-speech with a voice fixed at construction
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into audio
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] on network, auth or quota failures
    async fn synthesize(&self, text: &str) -> Result<AudioClip>;
}

/// Stand-in for a collaborator that could not be built at startup
///
/// Every call fails with [`Error::Config`], which ends the session.
#[derive(Debug, Clone)]
pub struct Unconfigured {
    reason: String,
}

impl Unconfigured {
    /// Create a stand-in carrying the construction error
    #[must_use]
    pub fn new(reason: impl fmt::Display) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(Error::Config(self.reason.clone()))
    }
}

#[async_trait]
impl SpeechToText for Unconfigured {
    async fn transcribe(&self, _clip: &AudioClip) -> Result<String> {
        self.fail()
    }
}

#[async_trait]
impl LanguageModel for Unconfigured {
    async fn reply(&self, _context: &[DialogueMessage]) -> Result<String> {
        self.fail()
    }
}

#[async_trait]
impl SpeechSynthesizer for Unconfigured {
    async fn synthesize(&self, _text: &str) -> Result<AudioClip> {
        self.fail()
    }
}

/// HTTP client with a whole-request timeout
///
/// # Errors
///
/// Returns error if the TLS backend cannot be initialized
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

/// Send a request, classifying transport and HTTP failures
///
/// # Errors
///
/// Returns [`Error::Remote`] for transport failures and non-2xx responses
pub async fn send_checked(
    service: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let response = request.send().await.map_err(|e| {
        tracing::warn!(service, error = %e, "request failed");
        RemoteError::from_transport(service, &e)
    })?;

    let status = response.status();
    tracing::debug!(service, status = %status, "received response");

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let err = RemoteError::from_response(service, status.as_u16(), &body);
    tracing::warn!(service, status = %status, error = %err, "remote API error");
    Err(err.into())
}

/// Decode a JSON response body, classifying failures as malformed
///
/// # Errors
///
/// Returns [`Error::Remote`] of kind `Malformed` if the body does not parse
pub async fn json_body<T: serde::de::DeserializeOwned>(
    service: &'static str,
    response: reqwest::Response,
) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RemoteError::from_transport(service, &e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        RemoteError::new(service, RemoteErrorKind::Malformed, e.to_string()).into()
    })
}
