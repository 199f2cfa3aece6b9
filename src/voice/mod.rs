//! Voice processing module
//!
//! Handles audio capture, local wake word detection, cloud STT/TTS and
//! playback. Conversation turns are driven by [`crate::conversation`].

pub mod capture;
pub mod clip;
pub mod keyword;
pub mod listener;
pub mod playback;
pub mod recognizer;
pub mod recorder;
pub mod stt;
pub mod tts;
pub mod vad;

pub use capture::{AudioSource, CpalSource, FrameStream};
pub use clip::{AudioClip, SAMPLE_RATE};
pub use keyword::{KeywordMatch, KeywordMatcher, KeywordSet, LocalKeywordSpotter};
pub use listener::{ListenerControl, ListenerState, ListenerTiming, MicListener, WakeEvent};
pub use playback::{
    PlaybackBackend, PlaybackOptions, PlaybackOutcome, PlaybackRequest, PlaybackSequencer,
};
pub use recognizer::SpeechRecognizer;
pub use recorder::{CaptureOutcome, CaptureProfile, SpeechCapture, VoiceActivityRecorder};
pub use stt::{CloudStt, SttProvider};
pub use tts::{TtsProvider, build_synthesizer};
pub use vad::FrameClassifier;
