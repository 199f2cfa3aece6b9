//! Voice activity detection and utterance segmentation
//!
//! A frame is voiced only when it clears an RMS floor AND webrtc-vad
//! confirms speech-band content. [`Segmenter`] turns a stream of classified
//! frames into one utterance; it is pure so it can be driven without audio
//! hardware.

use std::collections::VecDeque;
use std::time::Duration;

use webrtc_vad::{SampleRate, Vad, VadMode};

use super::clip::{AudioClip, SAMPLE_RATE, rms_i16};

/// Frame length used for VAD decisions
pub const FRAME_MS: u32 = 30;

/// Samples per frame at 16kHz
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE * FRAME_MS / 1000) as usize;

/// Frames of audio kept from before voicing starts (300ms)
pub const PRE_ROLL_FRAMES: usize = 10;

/// Classifies 30ms frames as voiced or unvoiced
///
/// `Vad` is not `Send`, so a classifier is created on the thread that
/// consumes the capture stream.
pub struct FrameClassifier {
    vad: Vad,
    min_rms: f32,
}

impl FrameClassifier {
    /// Create a classifier
    ///
    /// `mode` is the webrtc aggressiveness 0..=3 (higher rejects more
    /// non-speech); `min_rms` is on the int16 scale.
    #[must_use]
    pub fn new(mode: u8, min_rms: f32) -> Self {
        Self {
            vad: Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, vad_mode(mode)),
            min_rms,
        }
    }

    /// Whether a frame carries speech
    pub fn is_voiced(&mut self, frame: &[i16]) -> bool {
        if frame.len() != FRAME_SAMPLES || rms_i16(frame) < self.min_rms {
            return false;
        }
        self.vad.is_voice_segment(frame).unwrap_or(false)
    }
}

const fn vad_mode(mode: u8) -> VadMode {
    match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

/// Frame-count limits for one utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPolicy {
    /// Consecutive voiced frames needed before recording starts
    pub min_speech_frames: usize,
    /// Consecutive unvoiced frames that end a recording
    pub end_silence_frames: usize,
    /// Recording length (frames) required before silence may end it
    pub min_frames: usize,
    /// Frames since capture start after which recording stops
    pub max_frames: usize,
    /// Frames since capture start to wait for voicing
    pub start_timeout_frames: usize,
    /// Frames retained from before voicing starts
    pub pre_roll_frames: usize,
}

impl SegmentPolicy {
    /// Build a policy from wall-clock limits
    #[must_use]
    pub fn from_durations(
        max_duration: Duration,
        start_timeout: Duration,
        end_silence: Duration,
        min_duration: Duration,
        min_speech_frames: usize,
    ) -> Self {
        Self {
            min_speech_frames: min_speech_frames.max(1),
            end_silence_frames: frames_for(end_silence).max(1),
            min_frames: frames_for(min_duration),
            max_frames: frames_for(max_duration).max(1),
            start_timeout_frames: frames_for(start_timeout).max(1),
            pre_roll_frames: PRE_ROLL_FRAMES,
        }
    }
}

/// Number of whole frames covering `duration`, rounded up
#[must_use]
pub fn frames_for(duration: Duration) -> usize {
    let ms = duration.as_millis();
    let frames = ms.div_ceil(u128::from(FRAME_MS));
    usize::try_from(frames).unwrap_or(usize::MAX)
}

/// Result of feeding one frame to a [`Segmenter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStep {
    /// Keep feeding frames
    Continue,
    /// Utterance is complete; call [`Segmenter::finish`]
    Complete,
    /// No voicing before the start timeout
    TimedOut,
}

/// Accumulates one utterance from classified frames
#[derive(Debug)]
pub struct Segmenter {
    policy: SegmentPolicy,
    pre_roll: VecDeque<Vec<i16>>,
    recorded: Vec<i16>,
    voiced_run: usize,
    silence_run: usize,
    frames_seen: usize,
    frames_recorded: usize,
    started: bool,
}

impl Segmenter {
    /// Create a segmenter for one capture
    #[must_use]
    pub fn new(policy: SegmentPolicy) -> Self {
        Self {
            policy,
            pre_roll: VecDeque::with_capacity(policy.pre_roll_frames + policy.min_speech_frames),
            recorded: Vec::new(),
            voiced_run: 0,
            silence_run: 0,
            frames_seen: 0,
            frames_recorded: 0,
            started: false,
        }
    }

    /// Whether voicing has started
    #[must_use]
    pub const fn has_started(&self) -> bool {
        self.started
    }

    /// Feed the next frame
    pub fn push(&mut self, frame: &[i16], voiced: bool) -> SegmentStep {
        self.frames_seen += 1;

        if self.started {
            self.recorded.extend_from_slice(frame);
            self.frames_recorded += 1;
            if voiced {
                self.silence_run = 0;
            } else {
                self.silence_run += 1;
            }

            let silence_done = self.silence_run >= self.policy.end_silence_frames
                && self.frames_recorded >= self.policy.min_frames;
            if silence_done || self.frames_seen >= self.policy.max_frames {
                return SegmentStep::Complete;
            }
            return SegmentStep::Continue;
        }

        self.pre_roll.push_back(frame.to_vec());
        while self.pre_roll.len() > self.policy.pre_roll_frames + self.policy.min_speech_frames {
            self.pre_roll.pop_front();
        }

        self.voiced_run = if voiced { self.voiced_run + 1 } else { 0 };

        if self.voiced_run >= self.policy.min_speech_frames {
            self.started = true;
            self.frames_recorded = self.pre_roll.len();
            for buffered in self.pre_roll.drain(..) {
                self.recorded.extend(buffered);
            }
            if self.frames_seen >= self.policy.max_frames {
                return SegmentStep::Complete;
            }
            return SegmentStep::Continue;
        }

        if self.frames_seen >= self.policy.start_timeout_frames
            || self.frames_seen >= self.policy.max_frames
        {
            return SegmentStep::TimedOut;
        }

        SegmentStep::Continue
    }

    /// Take the recorded utterance
    #[must_use]
    pub fn finish(self) -> AudioClip {
        AudioClip::new(self.recorded, SAMPLE_RATE)
    }
}
