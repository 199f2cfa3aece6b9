//! Text-to-speech (TTS) processing

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;

use super::clip::AudioClip;
use crate::config::{ApiKeys, PiperConfig, TtsConfig};
use crate::services::{SpeechSynthesizer, http_client, send_checked};
use crate::{Error, Result};

/// Request timeout for cloud synthesis
const TTS_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a local Piper run
const PIPER_TIMEOUT: Duration = Duration::from_secs(60);

/// Voice used by `OpenAI` when none is configured
const OPENAI_DEFAULT_VOICE: &str = "alloy";

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    /// ElevenLabs cloud voices
    ElevenLabs,
    /// `OpenAI` speech API
    OpenAi,
    /// Local Piper binary
    Piper,
}

impl TtsProvider {
    /// Config name of the provider
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ElevenLabs => "elevenlabs",
            Self::OpenAi => "openai",
            Self::Piper => "piper",
        }
    }
}

impl std::str::FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "elevenlabs" => Ok(Self::ElevenLabs),
            "openai" => Ok(Self::OpenAi),
            "piper" => Ok(Self::Piper),
            "kitten" => Err(Error::Config(
                "TTS_PROVIDER=kitten is not supported; use piper for offline speech".to_string(),
            )),
            other => Err(Error::Config(format!(
                "TTS_PROVIDER must be one of: elevenlabs, openai, piper (got '{other}')"
            ))),
        }
    }
}

/// Build the synthesizer selected by config
///
/// # Errors
///
/// Returns error if the provider's key, voice or model is missing
pub fn build_synthesizer(config: &TtsConfig, keys: &ApiKeys) -> Result<Arc<dyn SpeechSynthesizer>> {
    let synthesizer: Arc<dyn SpeechSynthesizer> = match config.provider {
        TtsProvider::ElevenLabs => {
            let voice = config.voice_id.clone().ok_or_else(|| {
                Error::Config("VOICE_ID is required when TTS_PROVIDER=elevenlabs".to_string())
            })?;
            Arc::new(ElevenLabsTts::new(keys.elevenlabs.clone(), voice)?)
        }
        TtsProvider::OpenAi => {
            let voice = config
                .voice_id
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_VOICE.to_string());
            Arc::new(OpenAiTts::new(keys.openai.clone(), voice)?)
        }
        TtsProvider::Piper => Arc::new(PiperTts::new(&config.piper)?),
    };
    tracing::info!(provider = config.provider.as_str(), "tts ready");
    Ok(synthesizer)
}

fn require_key(key: Option<SecretString>, name: &str) -> Result<SecretString> {
    key.filter(|k| !k.expose_secret().trim().is_empty())
        .ok_or_else(|| Error::Config(format!("{name} is required for text-to-speech")))
}

/// ElevenLabs voice synthesis
pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: SecretString,
    voice_id: String,
    model: String,
}

impl ElevenLabsTts {
    /// Create a synthesizer for one ElevenLabs voice
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: Option<SecretString>, voice_id: String) -> Result<Self> {
        Ok(Self {
            client: http_client(TTS_TIMEOUT)?,
            api_key: require_key(api_key, "ELEVENLABS_API_KEY")?,
            voice_id,
            model: "eleven_multilingual_v2".to_string(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsTts {
    async fn synthesize(&self, text: &str) -> Result<AudioClip> {
        #[derive(serde::Serialize)]
        struct VoiceSettings {
            stability: f32,
            similarity_boost: f32,
        }

        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
            voice_settings: VoiceSettings,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}",
            self.voice_id
        );

        let request = self
            .client
            .post(&url)
            .query(&[("output_format", "mp3_44100_128")])
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Accept", "audio/mpeg")
            .json(&ElevenLabsRequest {
                text,
                model_id: &self.model,
                voice_settings: VoiceSettings {
                    stability: 0.5,
                    similarity_boost: 0.7,
                },
            });

        let response = send_checked("elevenlabs-tts", request).await?;
        let audio = response.bytes().await?;
        tracing::debug!(bytes = audio.len(), "elevenlabs audio received");
        AudioClip::from_mp3_bytes(&audio)
    }
}

/// `OpenAI` speech synthesis
pub struct OpenAiTts {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    model: String,
}

impl OpenAiTts {
    /// Create a synthesizer for one `OpenAI` voice
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: Option<SecretString>, voice: String) -> Result<Self> {
        Ok(Self {
            client: http_client(TTS_TIMEOUT)?,
            api_key: require_key(api_key, "OPENAI_API_KEY")?,
            voice,
            model: "tts-1".to_string(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiTts {
    async fn synthesize(&self, text: &str) -> Result<AudioClip> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
        }

        let request = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(self.api_key.expose_secret())
            .json(&TtsRequest {
                model: &self.model,
                input: text,
                voice: &self.voice,
                response_format: "mp3",
            });

        let response = send_checked("openai-tts", request).await?;
        let audio = response.bytes().await?;
        tracing::debug!(bytes = audio.len(), "openai audio received");
        AudioClip::from_mp3_bytes(&audio)
    }
}

/// Offline synthesis through the `piper` binary
pub struct PiperTts {
    binary: PathBuf,
    model: PathBuf,
    speaker: u32,
}

impl PiperTts {
    /// Locate the binary and voice model
    ///
    /// # Errors
    ///
    /// Returns error if the binary is not on `PATH` or the model is missing
    pub fn new(config: &PiperConfig) -> Result<Self> {
        let binary = which::which(&config.binary).map_err(|e| {
            Error::Config(format!("piper binary '{}' not found: {e}", config.binary))
        })?;
        let data_dir = directories::BaseDirs::new().map(|d| d.data_dir().join("piper"));
        let model = resolve_piper_model(&config.model, data_dir.as_deref())?;

        tracing::debug!(binary = %binary.display(), model = %model.display(), "piper located");
        Ok(Self {
            binary,
            model,
            speaker: config.speaker,
        })
    }
}

/// Find a Piper `.onnx` voice from an explicit path or a shorthand name
///
/// # Errors
///
/// Returns [`Error::ModelMissing`] if no candidate exists
pub fn resolve_piper_model(name: &str, data_dir: Option<&Path>) -> Result<PathBuf> {
    let explicit = PathBuf::from(name);
    if explicit.extension().is_some_and(|ext| ext == "onnx") && explicit.is_file() {
        return Ok(explicit);
    }

    let candidates = data_dir
        .map(|dir| {
            vec![
                dir.join(format!("{name}.onnx")),
                dir.join(name).join(format!("{name}.onnx")),
            ]
        })
        .unwrap_or_default();

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| Error::ModelMissing(format!("piper voice '{name}' not found")))
}

#[async_trait]
impl SpeechSynthesizer for PiperTts {
    async fn synthesize(&self, text: &str) -> Result<AudioClip> {
        let output = tempfile::Builder::new()
            .prefix("voicepi-piper-")
            .suffix(".wav")
            .tempfile()?;

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg("--model")
            .arg(&self.model)
            .arg("--output_file")
            .arg(output.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.speaker > 0 {
            command.arg("--speaker").arg(self.speaker.to_string());
        }

        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }

        let result = tokio::time::timeout(PIPER_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout("piper synthesis".to_string()))??;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(Error::Io(std::io::Error::other(format!(
                "piper exited with {}: {}",
                result.status,
                stderr.trim()
            ))));
        }

        let path = output.path().to_path_buf();
        let clip = tokio::task::spawn_blocking(move || AudioClip::from_wav_file(&path))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        drop(output);
        Ok(clip)
    }
}
