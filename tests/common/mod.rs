//! Shared test utilities
//!
//! Scripted stand-ins for every collaborator, so no test touches audio
//! hardware or the network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use voicepi::config::{AckConfig, ConversationConfig, StreamingConfig};
use voicepi::conversation::{Collaborators, ConversationOrchestrator};
use voicepi::voice::playback::BackendFailure;
use voicepi::voice::{
    AudioClip, CaptureOutcome, CaptureProfile, ListenerControl, ListenerState, PlaybackBackend,
    PlaybackOptions, PlaybackSequencer, SAMPLE_RATE, SpeechCapture, SpeechRecognizer,
};
use voicepi::{
    DialogueMessage, Error, LanguageModel, RemoteError, RemoteErrorKind, Result,
    SpeechSynthesizer, SpeechToText, UiEvent, UiSink, VisualState,
};

/// A loud 220Hz tone, well above every RMS floor
#[must_use]
pub fn speech_clip(duration_ms: u64) -> AudioClip {
    #[allow(clippy::cast_possible_truncation)]
    let len = (u64::from(SAMPLE_RATE) * duration_ms / 1000) as usize;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..len)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            0.25 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
        })
        .collect();
    AudioClip::from_f32(&samples, SAMPLE_RATE)
}

/// A remote failure of the given kind
#[must_use]
pub fn remote(kind: RemoteErrorKind) -> Error {
    Error::Remote(RemoteError::new("fake", kind, "scripted failure"))
}

/// Poll `cond` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// What a [`ScriptedCapture`] does once its script runs out
#[derive(Clone, Copy)]
pub enum WhenEmpty {
    /// Return `TimedOut` immediately
    TimeOut,
    /// Hold the "device" until cancelled, like a quiet room
    HoldUntilCancelled,
}

/// Capture that replays a script and tracks device ownership
pub struct ScriptedCapture {
    script: Mutex<VecDeque<Result<CaptureOutcome>>>,
    when_empty: WhenEmpty,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedCapture {
    #[must_use]
    pub fn new(script: Vec<Result<CaptureOutcome>>, when_empty: WhenEmpty) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            when_empty,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    /// Every call times out
    #[must_use]
    pub fn silent() -> Arc<Self> {
        Self::new(Vec::new(), WhenEmpty::TimeOut)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Captures currently holding the device
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Most captures ever open at once
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn hold(cancel: &AtomicBool) -> CaptureOutcome {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cancel.load(Ordering::Acquire) {
                return CaptureOutcome::Cancelled;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        CaptureOutcome::TimedOut
    }
}

impl SpeechCapture for ScriptedCapture {
    fn capture(&self, _profile: &CaptureProfile, cancel: &AtomicBool) -> Result<CaptureOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let next = self.script.lock().unwrap().pop_front();
        let result = match next {
            Some(result) => result,
            None if cancel.load(Ordering::Acquire) => Ok(CaptureOutcome::Cancelled),
            None => match self.when_empty {
                WhenEmpty::TimeOut => Ok(CaptureOutcome::TimedOut),
                WhenEmpty::HoldUntilCancelled => Ok(Self::hold(cancel)),
            },
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Offline recognizer returning a fixed transcript
pub struct FixedRecognizer(pub String);

impl SpeechRecognizer for FixedRecognizer {
    fn transcribe(&self, _clip: &AudioClip) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Cloud STT replaying a script, then echoing "turn N"
#[derive(Default)]
pub struct ScriptedStt {
    script: Mutex<VecDeque<Result<String>>>,
    calls: AtomicUsize,
}

impl ScriptedStt {
    #[must_use]
    pub fn new(script: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(&self, _clip: &AudioClip) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("turn {n}")))
    }
}

/// LLM that records every context it is given
#[derive(Default)]
pub struct RecordingLlm {
    script: Mutex<VecDeque<Result<String>>>,
    contexts: Mutex<Vec<Vec<DialogueMessage>>>,
}

impl RecordingLlm {
    #[must_use]
    pub fn new(script: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn contexts(&self) -> Vec<Vec<DialogueMessage>> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for RecordingLlm {
    async fn reply(&self, context: &[DialogueMessage]) -> Result<String> {
        let n = {
            let mut contexts = self.contexts.lock().unwrap();
            contexts.push(context.to_vec());
            contexts.len()
        };
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("reply {n}")))
    }
}

/// TTS returning a short tone, or scripted errors
#[derive(Default)]
pub struct ScriptedTts {
    script: Mutex<VecDeque<Result<AudioClip>>>,
    calls: AtomicUsize,
}

impl ScriptedTts {
    #[must_use]
    pub fn new(script: Vec<Result<AudioClip>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedTts {
    async fn synthesize(&self, _text: &str) -> Result<AudioClip> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(speech_clip(200)))
    }
}

/// Playback backend replaying scripted results, then succeeding
pub struct ScriptedBackend {
    name: &'static str,
    results: Mutex<VecDeque<std::result::Result<(), BackendFailure>>>,
    always_fail: bool,
    played: Mutex<Vec<usize>>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new(name: &'static str, results: Vec<std::result::Result<(), BackendFailure>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            results: Mutex::new(results.into()),
            always_fail: false,
            played: Mutex::new(Vec::new()),
        })
    }

    /// A backend whose player always exits non-zero
    #[must_use]
    pub fn broken(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            results: Mutex::new(VecDeque::new()),
            always_fail: true,
            played: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.played.lock().unwrap().len()
    }

    /// Sample counts of every clip played
    pub fn played(&self) -> Vec<usize> {
        self.played.lock().unwrap().clone()
    }
}

impl PlaybackBackend for ScriptedBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn play(&self, clip: &AudioClip, _timeout: Duration) -> std::result::Result<(), BackendFailure> {
        self.played.lock().unwrap().push(clip.samples().len());
        if self.always_fail {
            return Err(BackendFailure::Failed("exit status 1".to_string()));
        }
        self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// UI sink keeping every event, without de-duplication
#[derive(Default)]
pub struct RecordingUi {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingUi {
    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Status(text) => Some(text),
                UiEvent::Visual(_) => None,
            })
            .collect()
    }

    pub fn visuals(&self) -> Vec<VisualState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Visual(state) => Some(state),
                UiEvent::Status(_) => None,
            })
            .collect()
    }

    pub fn last_status(&self) -> Option<String> {
        self.statuses().pop()
    }
}

impl UiSink for RecordingUi {
    fn set_visual(&self, state: VisualState) {
        self.events.lock().unwrap().push(UiEvent::Visual(state));
    }

    fn set_status(&self, text: &str) {
        self.events.lock().unwrap().push(UiEvent::Status(text.to_string()));
    }
}

/// Listener stand-in counting suspend/resume calls
pub struct FakeListener {
    state: Mutex<ListenerState>,
    suspends: AtomicUsize,
    resumes: AtomicUsize,
}

impl FakeListener {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ListenerState::Listening),
            suspends: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
        })
    }

    pub fn stop(&self) {
        *self.state.lock().unwrap() = ListenerState::Stopped;
    }

    pub fn suspends(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }
}

impl ListenerControl for FakeListener {
    fn suspend(&self) {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if *state == ListenerState::Listening {
            *state = ListenerState::Suspended;
        }
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if *state == ListenerState::Suspended {
            *state = ListenerState::Listening;
        }
    }

    fn state(&self) -> ListenerState {
        *self.state.lock().unwrap()
    }
}

/// Every fake an orchestrator needs, kept for assertions
pub struct Harness {
    pub capture: Arc<ScriptedCapture>,
    pub stt: Arc<ScriptedStt>,
    pub llm: Arc<RecordingLlm>,
    pub tts: Arc<ScriptedTts>,
    pub backend: Arc<ScriptedBackend>,
    pub ui: Arc<RecordingUi>,
    pub listener: Arc<FakeListener>,
}

impl Harness {
    /// All collaborators succeed; capture replays `script` then times out
    #[must_use]
    pub fn new(script: Vec<Result<CaptureOutcome>>) -> Self {
        Self {
            capture: ScriptedCapture::new(script, WhenEmpty::TimeOut),
            stt: ScriptedStt::new(Vec::new()),
            llm: RecordingLlm::new(Vec::new()),
            tts: ScriptedTts::new(Vec::new()),
            backend: ScriptedBackend::new("fake", Vec::new()),
            ui: Arc::new(RecordingUi::default()),
            listener: FakeListener::new(),
        }
    }

    /// Build an orchestrator with no acknowledgement sound
    #[must_use]
    pub fn orchestrator(&self, max_misses: u32) -> ConversationOrchestrator {
        let ack = AckConfig {
            repeat: 0,
            ..AckConfig::default()
        };
        self.orchestrator_with(max_misses, ack)
    }

    #[must_use]
    pub fn orchestrator_with(&self, max_misses: u32, ack: AckConfig) -> ConversationOrchestrator {
        let listener = Arc::clone(&self.listener) as Arc<dyn ListenerControl>;
        self.build(listener, Self::conversation(max_misses), ack)
    }

    /// Build an orchestrator that speaks replies sentence by sentence
    #[must_use]
    pub fn streaming_orchestrator(&self, max_misses: u32) -> ConversationOrchestrator {
        let listener = Arc::clone(&self.listener) as Arc<dyn ListenerControl>;
        let config = ConversationConfig {
            streaming: Some(StreamingConfig::default()),
            ..Self::conversation(max_misses)
        };
        let ack = AckConfig {
            repeat: 0,
            ..AckConfig::default()
        };
        self.build(listener, config, ack)
    }

    /// Build an orchestrator that drives a real listener instead of the fake
    #[must_use]
    pub fn orchestrator_for(
        &self,
        listener: Arc<dyn ListenerControl>,
        max_misses: u32,
    ) -> ConversationOrchestrator {
        let ack = AckConfig {
            repeat: 0,
            ..AckConfig::default()
        };
        self.build(listener, Self::conversation(max_misses), ack)
    }

    fn conversation(max_misses: u32) -> ConversationConfig {
        ConversationConfig {
            max_misses,
            ..ConversationConfig::default()
        }
    }

    fn build(
        &self,
        listener: Arc<dyn ListenerControl>,
        config: ConversationConfig,
        ack: AckConfig,
    ) -> ConversationOrchestrator {
        let parts = Collaborators {
            capture: Arc::clone(&self.capture) as Arc<dyn SpeechCapture>,
            stt: Arc::clone(&self.stt) as Arc<dyn SpeechToText>,
            llm: Arc::clone(&self.llm) as Arc<dyn LanguageModel>,
            tts: Arc::clone(&self.tts) as Arc<dyn SpeechSynthesizer>,
            playback: Arc::new(PlaybackSequencer::new(
                vec![Arc::clone(&self.backend) as Arc<dyn PlaybackBackend>],
                PlaybackOptions::default(),
            )),
            ui: Arc::clone(&self.ui) as Arc<dyn UiSink>,
            listener,
        };
        ConversationOrchestrator::new(parts, config, ack)
    }
}

/// A clip outcome long and loud enough to pass the turn filters
#[must_use]
pub fn utterance() -> Result<CaptureOutcome> {
    Ok(CaptureOutcome::Clip(speech_clip(1000)))
}
