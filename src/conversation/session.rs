//! Per-wake conversation state

use std::fmt;

use uuid::Uuid;

use crate::error::RemoteErrorKind;
use crate::services::{DialogueMessage, Role};
use crate::voice::AudioClip;

/// Why a turn produced no usable exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// No voice before the start timeout
    NoSpeech,
    /// Utterance shorter than the minimum valid duration
    TooShort,
    /// Utterance below the conversation RMS floor
    TooQuiet,
    /// STT returned no text
    EmptyTranscript,
    /// Recoverable cloud failure
    Remote(RemoteErrorKind),
    /// Recoverable local failure (timeout, I/O, decode)
    LocalFault,
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSpeech => f.write_str("no speech"),
            Self::TooShort => f.write_str("too short"),
            Self::TooQuiet => f.write_str("too quiet"),
            Self::EmptyTranscript => f.write_str("empty transcript"),
            Self::Remote(kind) => write!(f, "remote {kind} error"),
            Self::LocalFault => f.write_str("local failure"),
        }
    }
}

/// Outcome of one conversation turn
#[derive(Debug)]
pub enum TurnResult {
    /// Full capture, STT, LLM, TTS and playback cycle
    Success {
        text_in: String,
        text_out: String,
        audio_out: AudioClip,
    },
    /// Counts toward the miss limit
    Miss(MissReason),
    /// Unrecoverable; ends the session
    Error(crate::Error),
}

/// Why a session resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Consecutive misses reached the configured limit
    MissLimit,
    /// An unrecoverable error, with its message
    Fatal(String),
    /// Shutdown was requested
    Shutdown,
}

/// What a finished session did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    /// Completed exchanges
    pub turns: u32,
    /// Consecutive misses at resolution
    pub misses: u32,
    pub end: SessionEnd,
}

/// One wake-to-resolution cycle
///
/// The dialogue context only ever holds complete user/assistant pairs
/// between turns; an unanswered user utterance is dropped on failure.
#[derive(Debug)]
pub struct ConversationSession {
    id: Uuid,
    turns: u32,
    misses: u32,
    context: Vec<DialogueMessage>,
}

impl ConversationSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            turns: 0,
            misses: 0,
            context: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Completed exchanges so far
    #[must_use]
    pub const fn turns(&self) -> u32 {
        self.turns
    }

    /// Consecutive misses since the last transcript
    #[must_use]
    pub const fn misses(&self) -> u32 {
        self.misses
    }

    /// Dialogue so far, oldest first
    #[must_use]
    pub fn context(&self) -> &[DialogueMessage] {
        &self.context
    }

    /// Whether this is the first turn of the session
    #[must_use]
    pub const fn is_first_turn(&self) -> bool {
        self.turns == 0 && self.misses == 0 && self.context.is_empty()
    }

    /// A transcript arrived: resets the miss counter and opens a pair
    pub fn record_transcript(&mut self, text: impl Into<String>) {
        self.misses = 0;
        self.discard_unanswered();
        self.context.push(DialogueMessage::user(text));
    }

    /// Close the open pair with the assistant's reply
    pub fn record_reply(&mut self, text: impl Into<String>) {
        self.context.push(DialogueMessage::assistant(text));
        self.turns += 1;
    }

    /// Drop a user utterance that never got a reply
    pub fn discard_unanswered(&mut self) {
        if self.context.last().is_some_and(|m| m.role == Role::User) {
            self.context.pop();
        }
    }

    /// Count a miss, returning the new consecutive count
    pub fn record_miss(&mut self) -> u32 {
        self.misses += 1;
        self.misses
    }

    /// Resolve into a summary
    #[must_use]
    pub const fn finish(&self, end: SessionEnd) -> SessionSummary {
        SessionSummary {
            id: self.id,
            turns: self.turns,
            misses: self.misses,
            end,
        }
    }
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self::new()
    }
}
