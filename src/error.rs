//! Error types for `VoicePi`

use std::fmt;

use thiserror::Error;

/// Result type alias for `VoicePi` operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in `VoicePi`
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (including a missing credential)
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone or speaker unavailable
    #[error("device error: {0}")]
    Device(String),

    /// No voice detected or capture window exceeded
    #[error("timeout: {0}")]
    Timeout(String),

    /// Local recognition model failed on a clip
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Local recognition model is missing or unreadable
    #[error("model unavailable: {0}")]
    ModelMissing(String),

    /// Cloud STT/LLM/TTS call failed
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// All playback backends exhausted
    #[error("playback error: {0}")]
    Playback(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encode/decode error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether this error should end a conversation session outright
    ///
    /// Everything else is recoverable and counts as a miss.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::ModelMissing(_) | Self::Device(_) => true,
            Self::Remote(e) => matches!(e.kind, RemoteErrorKind::Auth),
            _ => false,
        }
    }

    /// Remote error kind, if this is a remote failure
    #[must_use]
    pub const fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Self::Remote(e) => Some(e.kind),
            Self::Http(_) => Some(RemoteErrorKind::Network),
            _ => None,
        }
    }
}

/// Classification of a cloud call failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Transport failure or request timeout
    Network,
    /// Credential rejected
    Auth,
    /// Rate limit or quota exhausted
    Quota,
    /// Provider refused the content
    ContentFiltered,
    /// Requested model does not exist
    ModelNotFound,
    /// Response body could not be understood
    Malformed,
}

impl RemoteErrorKind {
    /// Classify an HTTP error status and body
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Auth,
            404 => Self::ModelNotFound,
            429 => Self::Quota,
            _ if body.to_lowercase().contains("not found") => Self::ModelNotFound,
            _ => Self::Network,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::ContentFiltered => "content filtered",
            Self::ModelNotFound => "model not found",
            Self::Malformed => "malformed response",
        };
        f.write_str(name)
    }
}

/// A failed call to a cloud collaborator
#[derive(Debug, Clone, Error)]
#[error("{service} {kind} error: {message}")]
pub struct RemoteError {
    /// Service name (e.g. "elevenlabs-stt", "gemini")
    pub service: &'static str,
    /// Failure classification
    pub kind: RemoteErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl RemoteError {
    /// Create a new remote error
    #[must_use]
    pub fn new(service: &'static str, kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            service,
            kind,
            message: message.into(),
        }
    }

    /// Build from an unsuccessful HTTP response
    #[must_use]
    pub fn from_response(service: &'static str, status: u16, body: &str) -> Self {
        Self::new(
            service,
            RemoteErrorKind::from_status(status, body),
            format!("HTTP {status}: {}", error_detail(body)),
        )
    }

    /// Build from a transport-level `reqwest` failure
    #[must_use]
    pub fn from_transport(service: &'static str, err: &reqwest::Error) -> Self {
        let kind = if err.is_decode() {
            RemoteErrorKind::Malformed
        } else {
            RemoteErrorKind::Network
        };
        Self::new(service, kind, err.to_string())
    }
}

/// Pull a readable message out of a provider error body
///
/// Providers wrap messages as `{"detail": {"message": ..}}`, `{"detail": ..}`
/// or `{"error": {"message": ..}}`; anything else is returned trimmed.
fn error_detail(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };

    let candidates = [
        value.pointer("/detail/message"),
        value.pointer("/detail"),
        value.pointer("/error/message"),
        value.pointer("/message"),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(ToString::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
