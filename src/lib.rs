//! `VoicePi` - voice-interactive desktop companion
//!
//! This library provides the core of the companion:
//! - Continuous local wake-word listening (VAD capture + offline recognizer)
//! - Conversation sessions over cloud STT, LLM and TTS
//! - Playback through an ordered chain of output backends
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  MicListener thread                  │
//! │   VAD recorder  │  keyword spotter  │  wake callback │
//! └────────────────────┬────────────────────────────────┘
//!                      │ WakeEvent (mpsc)
//! ┌────────────────────▼────────────────────────────────┐
//! │             ConversationOrchestrator                 │
//! │   capture  │  STT  │  LLM  │  TTS  │  playback       │
//! └────────────────────┬────────────────────────────────┘
//!                      │ UiEvent (mpsc)
//! ┌────────────────────▼────────────────────────────────┐
//! │                  UI event loop                       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod daemon;
pub mod error;
pub mod llm;
pub mod persona;
pub mod services;
pub mod ui;
pub mod voice;

pub use config::Config;
pub use conversation::{ConversationOrchestrator, SessionEnd, SessionSummary};
pub use daemon::Daemon;
pub use error::{Error, RemoteError, RemoteErrorKind, Result};
pub use llm::GeminiClient;
pub use services::{DialogueMessage, LanguageModel, Role, SpeechSynthesizer, SpeechToText};
pub use ui::{ChannelUiSink, UiEvent, UiSink, VisualState};
