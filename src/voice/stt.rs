//! Speech-to-text (STT) processing

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::clip::AudioClip;
use crate::services::{SpeechToText, http_client, json_body, send_checked};
use crate::{Error, Result};

/// Request timeout for transcription calls
const STT_TIMEOUT: Duration = Duration::from_secs(30);

/// Response from ElevenLabs and `OpenAI` transcription APIs
#[derive(serde::Deserialize)]
struct TranscriptResponse {
    #[serde(default)]
    text: String,
}

/// STT provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttProvider {
    /// ElevenLabs Scribe
    ElevenLabs,
    /// `OpenAI` Whisper API
    OpenAi,
}

impl std::str::FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "elevenlabs" => Ok(Self::ElevenLabs),
            "openai" | "whisper" => Ok(Self::OpenAi),
            other => Err(Error::Config(format!(
                "STT_PROVIDER must be one of: elevenlabs, openai (got '{other}')"
            ))),
        }
    }
}

/// Transcribes utterances with a cloud STT service
pub struct CloudStt {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    language: Option<String>,
    provider: SttProvider,
}

impl CloudStt {
    /// Create a new STT instance using ElevenLabs Scribe
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(
        api_key: Option<SecretString>,
        model: String,
        language: Option<String>,
    ) -> Result<Self> {
        Self::new(SttProvider::ElevenLabs, api_key, model, language, "ELEVENLABS_API_KEY")
    }

    /// Create a new STT instance using `OpenAI` Whisper
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(
        api_key: Option<SecretString>,
        model: String,
        language: Option<String>,
    ) -> Result<Self> {
        Self::new(SttProvider::OpenAi, api_key, model, language, "OPENAI_API_KEY")
    }

    fn new(
        provider: SttProvider,
        api_key: Option<SecretString>,
        model: String,
        language: Option<String>,
        key_name: &str,
    ) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.expose_secret().trim().is_empty())
            .ok_or_else(|| Error::Config(format!("{key_name} is required for speech-to-text")))?;

        Ok(Self {
            client: http_client(STT_TIMEOUT)?,
            api_key,
            model,
            language,
            provider,
        })
    }

    /// Selected provider
    #[must_use]
    pub const fn provider(&self) -> SttProvider {
        self.provider
    }

    fn form(&self, wav: Vec<u8>) -> Result<reqwest::multipart::Form> {
        let file = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Config(e.to_string()))?;

        let model_field = match self.provider {
            SttProvider::ElevenLabs => "model_id",
            SttProvider::OpenAi => "model",
        };
        let language_field = match self.provider {
            SttProvider::ElevenLabs => "language_code",
            SttProvider::OpenAi => "language",
        };

        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text(model_field, self.model.clone());
        if let Some(language) = &self.language {
            form = form.text(language_field, language.clone());
        }
        Ok(form)
    }
}

#[async_trait]
impl SpeechToText for CloudStt {
    async fn transcribe(&self, clip: &AudioClip) -> Result<String> {
        if clip.is_empty() {
            return Ok(String::new());
        }

        let wav = clip.to_wav_bytes()?;
        tracing::debug!(audio_bytes = wav.len(), provider = ?self.provider, "starting transcription");

        let request = match self.provider {
            SttProvider::ElevenLabs => self
                .client
                .post("https://api.elevenlabs.io/v1/speech-to-text")
                .header("xi-api-key", self.api_key.expose_secret()),
            SttProvider::OpenAi => self
                .client
                .post("https://api.openai.com/v1/audio/transcriptions")
                .bearer_auth(self.api_key.expose_secret()),
        };
        let service = match self.provider {
            SttProvider::ElevenLabs => "elevenlabs-stt",
            SttProvider::OpenAi => "openai-stt",
        };

        let response = send_checked(service, request.multipart(self.form(wav)?)).await?;
        let result: TranscriptResponse = json_body(service, response).await?;

        let text = result.text.trim().to_string();
        tracing::info!(transcript = %text, "transcription complete");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parsing() {
        assert_eq!("ElevenLabs".parse::<SttProvider>().unwrap(), SttProvider::ElevenLabs);
        assert_eq!("whisper".parse::<SttProvider>().unwrap(), SttProvider::OpenAi);
        assert!("deepgram".parse::<SttProvider>().is_err());
    }

    #[test]
    fn missing_key_is_config_error() {
        let err = CloudStt::new_elevenlabs(None, "scribe_v1".into(), None).err().unwrap();
        assert!(matches!(err, Error::Config(ref m) if m.contains("ELEVENLABS_API_KEY")));

        let blank = Some(SecretString::from("  ".to_string()));
        assert!(CloudStt::new_openai(blank, "whisper-1".into(), None).is_err());
    }
}
