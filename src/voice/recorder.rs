//! VAD-gated utterance recorder

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::capture::AudioSource;
use super::clip::AudioClip;
use super::vad::{FRAME_SAMPLES, FrameClassifier, SegmentPolicy, SegmentStep, Segmenter};
use crate::Result;

/// How long a single frame wait may block before checking cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Extra wall-clock slack before a stalled device is abandoned
const STALL_GRACE: Duration = Duration::from_secs(1);

/// Timing and gating parameters for one capture phase
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureProfile {
    /// Hard cap on capture length
    pub max_duration: Duration,
    /// Time to wait for voicing before giving up
    pub start_timeout: Duration,
    /// Trailing silence that ends an utterance
    pub end_silence: Duration,
    /// Shortest recording that silence may end
    pub min_duration: Duration,
    /// webrtc-vad aggressiveness (0..=3)
    pub vad_mode: u8,
    /// RMS floor (int16 scale) for a voiced frame
    pub min_rms: f32,
    /// Consecutive voiced frames needed to start recording
    pub min_speech_frames: usize,
}

impl CaptureProfile {
    /// Wake-phase defaults: short windows, permissive gating
    #[must_use]
    pub const fn wake_default() -> Self {
        Self {
            max_duration: Duration::from_millis(3200),
            start_timeout: Duration::from_millis(2200),
            end_silence: Duration::from_millis(550),
            min_duration: Duration::ZERO,
            vad_mode: 1,
            min_rms: 140.0,
            min_speech_frames: 2,
        }
    }

    /// Conversation-phase defaults: longer windows, strict gating
    #[must_use]
    pub const fn conversation_default() -> Self {
        Self {
            max_duration: Duration::from_secs(6),
            start_timeout: Duration::from_millis(1800),
            end_silence: Duration::from_millis(700),
            min_duration: Duration::ZERO,
            vad_mode: 3,
            min_rms: 650.0,
            min_speech_frames: 5,
        }
    }

    /// Frame-count segmentation policy for this profile
    #[must_use]
    pub fn policy(&self) -> SegmentPolicy {
        SegmentPolicy::from_durations(
            self.max_duration,
            self.start_timeout,
            self.end_silence,
            self.min_duration,
            self.min_speech_frames,
        )
    }
}

/// Result of a capture call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// An utterance was recorded
    Clip(AudioClip),
    /// No voice before the start timeout
    TimedOut,
    /// The cancel flag was raised
    Cancelled,
}

/// Something that records one utterance at a time
///
/// Implementations must hold the microphone only for the duration of a
/// call and must return promptly once `cancel` is raised.
pub trait SpeechCapture: Send + Sync {
    /// Record one utterance
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Device`] if the microphone is unavailable
    fn capture(&self, profile: &CaptureProfile, cancel: &AtomicBool) -> Result<CaptureOutcome>;
}

/// Records utterances from an [`AudioSource`] using VAD segmentation
pub struct VoiceActivityRecorder {
    source: Arc<dyn AudioSource>,
}

impl VoiceActivityRecorder {
    /// Create a recorder over an audio source
    #[must_use]
    pub fn new(source: Arc<dyn AudioSource>) -> Self {
        Self { source }
    }
}

impl SpeechCapture for VoiceActivityRecorder {
    fn capture(&self, profile: &CaptureProfile, cancel: &AtomicBool) -> Result<CaptureOutcome> {
        if cancel.load(Ordering::Acquire) {
            return Ok(CaptureOutcome::Cancelled);
        }

        let mut classifier = FrameClassifier::new(profile.vad_mode, profile.min_rms);
        let mut segmenter = Segmenter::new(profile.policy());
        let deadline = Instant::now() + profile.max_duration + STALL_GRACE;

        // Stream is dropped (device released) on every return below
        let mut stream = self.source.open(FRAME_SAMPLES)?;

        loop {
            if cancel.load(Ordering::Acquire) {
                tracing::debug!("capture cancelled");
                return Ok(CaptureOutcome::Cancelled);
            }

            if Instant::now() >= deadline {
                tracing::warn!("capture device stalled");
                return Ok(if segmenter.has_started() {
                    CaptureOutcome::Clip(segmenter.finish())
                } else {
                    CaptureOutcome::TimedOut
                });
            }

            let Some(frame) = stream.next_frame(POLL_INTERVAL)? else {
                continue;
            };

            let voiced = classifier.is_voiced(&frame);
            match segmenter.push(&frame, voiced) {
                SegmentStep::Continue => {}
                SegmentStep::TimedOut => return Ok(CaptureOutcome::TimedOut),
                SegmentStep::Complete => {
                    let clip = segmenter.finish();
                    tracing::debug!(
                        duration_ms = clip.duration().as_millis(),
                        rms = clip.rms(),
                        "utterance captured"
                    );
                    return Ok(CaptureOutcome::Clip(clip));
                }
            }
        }
    }
}
