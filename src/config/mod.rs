//! Configuration management for `VoicePi`
//!
//! Values resolve as environment > TOML file > built-in default and are
//! frozen into an immutable [`Config`] at startup.

pub mod file;

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use self::file::{CaptureFileConfig, VoicePiConfigFile};
use crate::voice::{
    CaptureProfile, KeywordSet, ListenerTiming, PlaybackOptions, SttProvider, TtsProvider,
    keyword::DEFAULT_MAX_EDIT_RATIO,
};
use crate::{Error, Result};

/// Default Gemini model
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-3-flash-preview";

/// Default playback backend order
pub const DEFAULT_PLAYBACK_BACKENDS: &[&str] = &["pw-play", "aplay", "cpal"];

/// `VoicePi` configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API keys
    pub api_keys: ApiKeys,
    /// Wake-word listener
    pub wake: WakeConfig,
    /// Conversation turns
    pub conversation: ConversationConfig,
    /// Wake acknowledgement sound
    pub ack: AckConfig,
    /// Audio output
    pub playback: PlaybackConfig,
    /// Speech-to-text
    pub stt: SttConfig,
    /// Language model
    pub llm: LlmConfig,
    /// Text-to-speech
    pub tts: TtsConfig,
    /// Persona prompt files
    pub persona: PersonaConfig,
}

/// API keys for cloud services; `Debug` output is redacted
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub elevenlabs: Option<SecretString>,
    pub gemini: Option<SecretString>,
    pub openai: Option<SecretString>,
}

/// Wake-word listener configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Local recognition model (file or directory)
    pub model_path: PathBuf,
    /// Keyword list, one per line
    pub keywords_path: PathBuf,
    /// Fraction of keyword length tolerated as edits
    pub max_edit_ratio: f64,
    /// Wake-phase capture gating
    pub capture: CaptureProfile,
    /// Listener loop pacing
    pub timing: ListenerTiming,
}

/// Conversation turn configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationConfig {
    /// Conversation-phase capture gating
    pub capture: CaptureProfile,
    /// Shortest accepted utterance
    pub min_valid: Duration,
    /// Invalid turns tolerated before the session ends
    pub max_misses: u32,
    /// Speak the reply sentence by sentence as it streams in
    pub streaming: Option<StreamingConfig>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            capture: CaptureProfile::conversation_default(),
            min_valid: Duration::from_millis(700),
            max_misses: 2,
            streaming: None,
        }
    }
}

/// Chunking limits for streamed replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingConfig {
    /// Longest chunk held back waiting for a sentence end
    pub max_chars: usize,
    /// Longest a partial chunk waits before it is spoken anyway
    pub max_wait: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_chars: 120,
            max_wait: Duration::from_millis(700),
        }
    }
}

/// Wake acknowledgement configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckConfig {
    /// WAV played at the start of a session
    pub audio_path: PathBuf,
    /// Times the clip is played; 0 disables it
    pub repeat: u32,
    /// Silence between repeats
    pub gap: Duration,
    /// Minimum lead-in silence before the clip
    pub min_lead_silence: Duration,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            audio_path: PathBuf::from("assets/wake_ack.wav"),
            repeat: 1,
            gap: Duration::from_millis(80),
            min_lead_silence: Duration::from_millis(450),
        }
    }
}

/// Playback configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Backend names in fallback order
    pub backends: Vec<String>,
    /// Sequencer tuning
    pub options: PlaybackOptions,
}

/// Speech-to-text configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SttConfig {
    pub provider: SttProvider,
    pub model: String,
    /// Optional language hint
    pub language: Option<String>,
}

/// Language model configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmConfig {
    /// Preferred Gemini model; fallbacks follow it
    pub model: String,
}

/// Text-to-speech configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsConfig {
    pub provider: TtsProvider,
    /// Provider voice; required for ElevenLabs
    pub voice_id: Option<String>,
    pub piper: PiperConfig,
}

/// Piper binary and voice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiperConfig {
    pub binary: String,
    /// `.onnx` path or voice shorthand
    pub model: String,
    pub speaker: u32,
}

/// Persona prompt files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaConfig {
    pub identity_path: PathBuf,
    pub soul_path: PathBuf,
}

/// Resolves one key from the environment, then the file, then a default
struct Sources<F> {
    env: F,
}

impl<F: Fn(&str) -> Option<String>> Sources<F> {
    fn env(&self, key: &str) -> Option<String> {
        (self.env)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, file: Option<String>) -> Option<String> {
        self.env(key)
            .or_else(|| file.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    }

    fn string_or(&self, key: &str, file: Option<String>, default: &str) -> String {
        self.string(key, file).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, file: Option<T>, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.env(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("{key}: invalid value '{raw}': {e}"))),
            None => Ok(file.unwrap_or(default)),
        }
    }

    fn seconds(&self, key: &str, file: Option<f64>, default: f64) -> Result<Duration> {
        let value = self.parse(key, file, default)?;
        Duration::try_from_secs_f64(value)
            .map_err(|_| Error::Config(format!("{key}: expected non-negative seconds, got {value}")))
    }

    fn flag(&self, key: &str, file: Option<bool>, default: bool) -> Result<bool> {
        let Some(raw) = self.env(key) else {
            return Ok(file.unwrap_or(default));
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Config(format!("{key}: expected a boolean, got '{raw}'"))),
        }
    }

    fn millis(&self, key: &str, file: Option<u64>, default: u64) -> Result<Duration> {
        Ok(Duration::from_millis(self.parse(key, file, default)?))
    }

    fn secret(&self, key: &str, file: Option<String>) -> Option<SecretString> {
        self.string(key, file).map(SecretString::from)
    }

    /// Capture profile for keys prefixed with `prefix` (e.g. "KEYWORD")
    fn capture(
        &self,
        prefix: &str,
        file: CaptureFileConfig,
        defaults: &CaptureProfile,
    ) -> Result<CaptureProfile> {
        let key = |name: &str| format!("{prefix}_{name}");

        let vad_mode = self.parse(&key("VAD_MODE"), file.vad_mode, defaults.vad_mode)?;
        if vad_mode > 3 {
            return Err(Error::Config(format!(
                "{}: must be 0..=3, got {vad_mode}",
                key("VAD_MODE")
            )));
        }

        let min_rms = self.parse(&key("MIN_RMS"), file.min_rms, defaults.min_rms)?;
        if !min_rms.is_finite() || min_rms < 0.0 {
            return Err(Error::Config(format!(
                "{}: must be non-negative, got {min_rms}",
                key("MIN_RMS")
            )));
        }

        Ok(CaptureProfile {
            max_duration: self.seconds(
                &key("MAX_SECONDS"),
                file.max_seconds,
                defaults.max_duration.as_secs_f64(),
            )?,
            start_timeout: self.seconds(
                &key("START_TIMEOUT"),
                file.start_timeout,
                defaults.start_timeout.as_secs_f64(),
            )?,
            end_silence: self.millis(
                &key("END_SILENCE_MS"),
                file.end_silence_ms,
                u64::try_from(defaults.end_silence.as_millis()).unwrap_or(u64::MAX),
            )?,
            min_duration: defaults.min_duration,
            vad_mode,
            min_rms,
            min_speech_frames: self
                .parse(
                    &key("MIN_SPEECH_FRAMES"),
                    file.min_speech_frames,
                    defaults.min_speech_frames,
                )?
                .max(1),
        })
    }
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// `path` overrides the standard config file location.
    ///
    /// # Errors
    ///
    /// Returns error if the file is malformed or a value is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = file::load_config_file(path)?;
        Self::from_sources(|key| std::env::var(key).ok(), file)
    }

    /// Build configuration from an environment lookup and a parsed file
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key
    pub fn from_sources<F>(env: F, file: VoicePiConfigFile) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let src = Sources { env };
        let VoicePiConfigFile {
            api_keys,
            wake,
            conversation,
            ack,
            playback,
            stt,
            llm,
            tts,
            persona,
        } = file;

        let api_keys = ApiKeys {
            elevenlabs: src.secret("ELEVENLABS_API_KEY", api_keys.elevenlabs),
            gemini: src.secret("GEMINI_API_KEY", api_keys.gemini),
            openai: src.secret("OPENAI_API_KEY", api_keys.openai),
        };

        let max_edit_ratio =
            src.parse("KEYWORD_MAX_EDIT_RATIO", wake.max_edit_ratio, DEFAULT_MAX_EDIT_RATIO)?;
        if !(0.0..=1.0).contains(&max_edit_ratio) {
            return Err(Error::Config(format!(
                "KEYWORD_MAX_EDIT_RATIO: must be within 0..=1, got {max_edit_ratio}"
            )));
        }

        let wake = WakeConfig {
            model_path: src
                .string_or("LOCAL_ASR_MODEL_PATH", wake.model_path, "models/ggml-tiny.en.bin")
                .into(),
            keywords_path: src
                .string_or("KEYWORDS_PATH", wake.keywords_path, "config/keywords.txt")
                .into(),
            max_edit_ratio,
            capture: src.capture("KEYWORD", wake.capture, &CaptureProfile::wake_default())?,
            timing: ListenerTiming {
                cycle_sleep: src.seconds(
                    "KEYWORD_CYCLE_SLEEP_SECONDS",
                    wake.cycle_sleep_seconds,
                    0.25,
                )?,
                ..ListenerTiming::default()
            },
        };

        let conversation_defaults = ConversationConfig::default();
        let max_misses = src.parse(
            "CONVERSATION_MAX_MISSES",
            conversation.max_misses,
            conversation_defaults.max_misses,
        )?;
        if max_misses < 1 {
            return Err(Error::Config(
                "CONVERSATION_MAX_MISSES: must be at least 1".to_string(),
            ));
        }
        let stream_defaults = StreamingConfig::default();
        let streaming = if src.flag("CONVERSATION_STREAM_REPLY", conversation.stream_reply, false)? {
            let max_chars = src.parse(
                "CONVERSATION_STREAM_MAX_CHARS",
                conversation.stream_max_chars,
                stream_defaults.max_chars,
            )?;
            if max_chars < 1 {
                return Err(Error::Config(
                    "CONVERSATION_STREAM_MAX_CHARS: must be at least 1".to_string(),
                ));
            }
            Some(StreamingConfig {
                max_chars,
                max_wait: src.millis(
                    "CONVERSATION_STREAM_MAX_WAIT_MS",
                    conversation.stream_max_wait_ms,
                    700,
                )?,
            })
        } else {
            None
        };
        let conversation = ConversationConfig {
            streaming,
            min_valid: src.millis(
                "CONVERSATION_MIN_VALID_MS",
                conversation.min_valid_ms,
                700,
            )?,
            capture: src.capture(
                "CONVERSATION",
                conversation.capture,
                &conversation_defaults.capture,
            )?,
            max_misses,
        };

        let ack_defaults = AckConfig::default();
        let ack = AckConfig {
            audio_path: src
                .string("WAKE_ACK_AUDIO_PATH", ack.audio_path)
                .map_or(ack_defaults.audio_path, PathBuf::from),
            repeat: src.parse("WAKE_ACK_REPEAT", ack.repeat, ack_defaults.repeat)?,
            gap: src.seconds("WAKE_ACK_GAP_SECONDS", ack.gap_seconds, 0.08)?,
            min_lead_silence: src.seconds(
                "WAKE_ACK_MIN_LEAD_SILENCE_SECONDS",
                ack.min_lead_silence_seconds,
                0.45,
            )?,
        };

        let backends = match src.env("PLAYBACK_BACKENDS") {
            Some(raw) => split_list(&raw),
            None => playback.backends.map_or_else(
                || DEFAULT_PLAYBACK_BACKENDS.iter().map(ToString::to_string).collect(),
                |names| split_list(&names.join(",")),
            ),
        };
        let playback = PlaybackConfig {
            backends,
            options: PlaybackOptions {
                lead_silence: src.seconds(
                    "PLAYBACK_LEAD_SILENCE_SECONDS",
                    playback.lead_silence_seconds,
                    0.0,
                )?,
                force_lead_silence: false,
                warmup: src.seconds("PLAYBACK_WARMUP_SECONDS", playback.warmup_seconds, 0.0)?,
                retries: src.parse("PLAYBACK_RETRIES", playback.retries, 1)?,
            },
        };

        let stt_provider: SttProvider = src
            .string_or("STT_PROVIDER", stt.provider, "elevenlabs")
            .parse()?;
        let default_stt_model = match stt_provider {
            SttProvider::ElevenLabs => "scribe_v1",
            SttProvider::OpenAi => "whisper-1",
        };
        let stt = SttConfig {
            provider: stt_provider,
            model: src.string_or("STT_MODEL", stt.model, default_stt_model),
            language: src.string("STT_LANGUAGE", stt.language),
        };

        let llm = LlmConfig {
            model: src.string_or("GEMINI_MODEL", llm.model, DEFAULT_GEMINI_MODEL),
        };

        let tts = TtsConfig {
            provider: src.string_or("TTS_PROVIDER", tts.provider, "piper").parse()?,
            voice_id: src.string("VOICE_ID", tts.voice_id),
            piper: PiperConfig {
                binary: src.string_or("PIPER_BINARY", tts.piper_binary, "piper"),
                model: src.string_or("PIPER_MODEL", tts.piper_model, "en_US-lessac-medium"),
                speaker: src.parse("PIPER_SPEAKER", tts.piper_speaker, 0)?,
            },
        };

        let persona = PersonaConfig {
            identity_path: src
                .string_or("IDENTITY_PATH", persona.identity_path, "identity.md")
                .into(),
            soul_path: src.string_or("SOUL_PATH", persona.soul_path, "soul.md").into(),
        };

        Ok(Self {
            api_keys,
            wake,
            conversation,
            ack,
            playback,
            stt,
            llm,
            tts,
            persona,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Parse a keyword file: one per line, `#` comments and blank lines skipped
#[must_use]
pub fn parse_keywords(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect()
}

/// Read and normalize the keyword file
///
/// # Errors
///
/// Returns [`Error::Config`] if the file is unreadable or lists no keywords
pub fn load_keywords(path: &Path) -> Result<KeywordSet> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("keyword file {}: {e}", path.display()))
    })?;
    let keywords = KeywordSet::new(parse_keywords(&content));
    if keywords.is_empty() {
        return Err(Error::Config(format!(
            "keyword file {} lists no keywords",
            path.display()
        )));
    }
    Ok(keywords)
}
