//! TOML configuration file loading
//!
//! Supports `~/.config/voicepi/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoicePiConfigFile {
    /// API keys for cloud services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Wake-word listener
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Conversation turns
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// Wake acknowledgement sound
    #[serde(default)]
    pub ack: AckFileConfig,

    /// Audio output
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Speech-to-text
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Language model
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Text-to-speech
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Persona prompt files
    #[serde(default)]
    pub persona: PersonaFileConfig,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub elevenlabs: Option<String>,
    pub gemini: Option<String>,
    pub openai: Option<String>,
}

/// Capture tuning shared by the wake and conversation phases
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Hard cap on one capture, seconds
    pub max_seconds: Option<f64>,
    /// Wait for voicing before giving up, seconds
    pub start_timeout: Option<f64>,
    /// Trailing silence that ends an utterance
    pub end_silence_ms: Option<u64>,
    /// webrtc-vad aggressiveness (0..=3)
    pub vad_mode: Option<u8>,
    /// RMS floor on the int16 scale
    pub min_rms: Option<f32>,
    /// Consecutive voiced frames needed to start
    pub min_speech_frames: Option<usize>,
}

/// Wake-word listener configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Local recognition model (file or directory)
    pub model_path: Option<String>,
    /// Keyword list, one per line
    pub keywords_path: Option<String>,
    /// Fraction of keyword length tolerated as edits
    pub max_edit_ratio: Option<f64>,
    /// Pause between capture cycles, seconds
    pub cycle_sleep_seconds: Option<f64>,
    #[serde(flatten)]
    pub capture: CaptureFileConfig,
}

/// Conversation turn configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    /// Shortest accepted utterance
    pub min_valid_ms: Option<u64>,
    /// Invalid turns tolerated before the session ends
    pub max_misses: Option<u32>,
    /// Speak streamed replies sentence by sentence
    pub stream_reply: Option<bool>,
    pub stream_max_chars: Option<usize>,
    pub stream_max_wait_ms: Option<u64>,
    #[serde(flatten)]
    pub capture: CaptureFileConfig,
}

/// Wake acknowledgement configuration
#[derive(Debug, Default, Deserialize)]
pub struct AckFileConfig {
    pub audio_path: Option<String>,
    pub repeat: Option<u32>,
    pub gap_seconds: Option<f64>,
    pub min_lead_silence_seconds: Option<f64>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Backend names in fallback order
    pub backends: Option<Vec<String>>,
    pub lead_silence_seconds: Option<f64>,
    pub warmup_seconds: Option<f64>,
    pub retries: Option<u32>,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// "elevenlabs" or "openai"
    pub provider: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
}

/// Language model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Gemini model identifier
    pub model: Option<String>,
}

/// Text-to-speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "elevenlabs", "openai" or "piper"
    pub provider: Option<String>,
    pub voice_id: Option<String>,
    pub piper_binary: Option<String>,
    pub piper_model: Option<String>,
    pub piper_speaker: Option<u32>,
}

/// Persona prompt configuration
#[derive(Debug, Default, Deserialize)]
pub struct PersonaFileConfig {
    pub identity_path: Option<String>,
    pub soul_path: Option<String>,
}

/// Load the TOML config file
///
/// `path` overrides the standard location. A missing file yields defaults.
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<VoicePiConfigFile> {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return Ok(VoicePiConfigFile::default());
    };

    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file");
        return Ok(VoicePiConfigFile::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config = parse_config_file(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error on invalid TOML or unknown sections
pub fn parse_config_file(content: &str) -> Result<VoicePiConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/voicepi/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voicepi").join("config.toml"))
}
