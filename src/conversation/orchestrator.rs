//! Wake-triggered turn-taking loop
//!
//! A session suspends the wake listener, runs capture → STT → LLM → TTS →
//! playback turns until the miss limit or an unrecoverable error, and then
//! hands the microphone back to the listener exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, mpsc};
use tracing::Instrument;

use super::chunker::SentenceChunker;
use super::session::{ConversationSession, MissReason, SessionEnd, SessionSummary, TurnResult};
use crate::config::{AckConfig, ConversationConfig, StreamingConfig};
use crate::services::{LanguageModel, SpeechSynthesizer, SpeechToText};
use crate::ui::{UiSink, VisualState};
use crate::voice::{
    AudioClip, CaptureOutcome, ListenerControl, ListenerState, PlaybackOutcome, PlaybackRequest,
    PlaybackSequencer, SAMPLE_RATE, SpeechCapture, WakeEvent,
};
use crate::{Error, Result};

/// Pause after the acknowledgement so its tail is not captured
const ACK_SETTLE: Duration = Duration::from_millis(180);

/// Characters of the transcript echoed to the status line
const ECHO_CHARS: usize = 28;

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorPhase {
    WaitingForWake,
    TurnCapture,
    TurnProcessing,
    TurnPlayback,
    Resolved,
}

/// Everything a session talks to
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn SpeechCapture>,
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn SpeechSynthesizer>,
    pub playback: Arc<PlaybackSequencer>,
    pub ui: Arc<dyn UiSink>,
    pub listener: Arc<dyn ListenerControl>,
}

/// A turn either produced a result or was interrupted by shutdown
enum TurnFlow {
    Done(TurnResult),
    Interrupted,
}

/// Runs conversation sessions, one at a time
pub struct ConversationOrchestrator {
    parts: Collaborators,
    config: ConversationConfig,
    ack: AckConfig,
    phase: Mutex<OrchestratorPhase>,
    stopping: Arc<AtomicBool>,
    stop_notify: Notify,
}

/// Restores the idle state and resumes the listener when a session ends
struct SessionGuard<'a> {
    orchestrator: &'a ConversationOrchestrator,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let parts = &self.orchestrator.parts;
        parts.ui.set_visual(VisualState::Idle);
        // free the slot first: the next wake can only fire once the listener resumes
        self.orchestrator.set_phase(OrchestratorPhase::WaitingForWake);
        parts.listener.resume();

        if parts.listener.state() == ListenerState::Stopped {
            parts.ui.set_status("Session ended");
        } else {
            parts.ui.set_status("Session ended. Listening");
        }
    }
}

impl ConversationOrchestrator {
    #[must_use]
    pub fn new(parts: Collaborators, config: ConversationConfig, ack: AckConfig) -> Self {
        Self {
            parts,
            config,
            ack,
            phase: Mutex::new(OrchestratorPhase::WaitingForWake),
            stopping: Arc::new(AtomicBool::new(false)),
            stop_notify: Notify::new(),
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> OrchestratorPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: OrchestratorPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    /// Claim the single session slot
    fn try_begin(&self) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != OrchestratorPhase::WaitingForWake {
            return false;
        }
        *phase = OrchestratorPhase::TurnCapture;
        true
    }

    /// Ask the current session to finish its network call and resolve
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop_notify.notify_one();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Handle wake events serially until the channel closes or stop is requested
    ///
    /// The listener parks itself before raising a wake, so every queued event
    /// gets its own session; that session is what resumes the listener.
    pub async fn run(&self, mut wake_rx: mpsc::Receiver<WakeEvent>) {
        loop {
            if self.is_stopping() {
                break;
            }
            tokio::select! {
                event = wake_rx.recv() => {
                    let Some(event) = event else { break };
                    if let Some(summary) = self.handle_wake(event).await {
                        tracing::info!(
                            session = %summary.id,
                            turns = summary.turns,
                            end = ?summary.end,
                            "session resolved"
                        );
                    }
                }
                () = self.stop_notify.notified() => break,
            }
        }
        tracing::debug!("conversation loop finished");
    }

    /// Run one session for a wake event
    ///
    /// Returns `None` if a session is already active. The active session
    /// resumes the listener when it resolves, so a parked listener is not lost.
    pub async fn handle_wake(&self, event: WakeEvent) -> Option<SessionSummary> {
        if !self.try_begin() {
            tracing::debug!(keyword = %event.keyword, "wake ignored, session already active");
            self.parts.ui.set_status("Busy");
            return None;
        }
        let _guard = SessionGuard { orchestrator: self };

        let session = ConversationSession::new();
        let span = tracing::info_span!("session", id = %session.id());
        let summary = self.run_session(session, event).instrument(span).await;
        self.set_phase(OrchestratorPhase::Resolved);
        Some(summary)
    }

    async fn run_session(&self, mut session: ConversationSession, event: WakeEvent) -> SessionSummary {
        tracing::info!(keyword = %event.keyword, transcript = %event.transcript, "session started");

        let listener = Arc::clone(&self.parts.listener);
        if tokio::task::spawn_blocking(move || listener.suspend())
            .await
            .is_err()
        {
            tracing::error!("listener suspend task panicked");
        }

        loop {
            if self.is_stopping() {
                return session.finish(SessionEnd::Shutdown);
            }

            if session.is_first_turn() {
                self.acknowledge().await;
            }

            let result = match self.run_turn(&mut session).await {
                TurnFlow::Done(result) => result,
                TurnFlow::Interrupted => return session.finish(SessionEnd::Shutdown),
            };

            match result {
                TurnResult::Success {
                    text_in, text_out, ..
                } => {
                    tracing::debug!(turn = session.turns(), %text_in, %text_out, "turn complete");
                    self.parts
                        .ui
                        .set_status(&format!("Turn {} done. Speak now.", session.turns()));
                }
                TurnResult::Miss(reason) => {
                    let misses = session.record_miss();
                    tracing::warn!(%reason, misses, max = self.config.max_misses, "turn missed");
                    self.parts.ui.set_status(&format!(
                        "No valid input ({misses}/{})",
                        self.config.max_misses
                    ));
                    if misses >= self.config.max_misses {
                        tracing::info!(turns = session.turns(), "miss limit reached");
                        return session.finish(SessionEnd::MissLimit);
                    }
                }
                TurnResult::Error(e) => {
                    tracing::error!(error = %e, "session ended by unrecoverable error");
                    self.parts.ui.set_status(&format!("Error: {e}"));
                    return session.finish(SessionEnd::Fatal(e.to_string()));
                }
            }
        }
    }

    async fn run_turn(&self, session: &mut ConversationSession) -> TurnFlow {
        self.set_phase(OrchestratorPhase::TurnCapture);

        let clip = match self.capture_utterance().await {
            Ok(CaptureOutcome::Clip(clip)) => clip,
            Ok(CaptureOutcome::TimedOut) => return TurnFlow::Done(TurnResult::Miss(MissReason::NoSpeech)),
            Ok(CaptureOutcome::Cancelled) => return TurnFlow::Interrupted,
            Err(e) => return TurnFlow::Done(classify(e)),
        };

        if clip.duration() < self.config.min_valid {
            tracing::debug!(duration_ms = clip.duration().as_millis(), "utterance too short");
            return TurnFlow::Done(TurnResult::Miss(MissReason::TooShort));
        }
        if clip.rms() < self.config.capture.min_rms {
            tracing::debug!(rms = clip.rms(), "utterance too quiet");
            return TurnFlow::Done(TurnResult::Miss(MissReason::TooQuiet));
        }

        self.set_phase(OrchestratorPhase::TurnProcessing);
        self.parts.ui.set_status(&format!(
            "Captured {}ms. STT...",
            clip.duration().as_millis()
        ));

        let text_in = match self.parts.stt.transcribe(&clip).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => return TurnFlow::Done(classify(e)),
        };
        if text_in.is_empty() {
            return TurnFlow::Done(TurnResult::Miss(MissReason::EmptyTranscript));
        }

        session.record_transcript(text_in.clone());
        let echo: String = text_in.chars().take(ECHO_CHARS).collect();
        self.parts.ui.set_status(&format!("You: {echo}"));

        if let Some(streaming) = &self.config.streaming {
            return TurnFlow::Done(self.streamed_reply(session, text_in, streaming).await);
        }

        let text_out = match self.parts.llm.reply(session.context()).await {
            Ok(reply) => reply,
            Err(e) => {
                session.discard_unanswered();
                return TurnFlow::Done(classify(e));
            }
        };

        self.parts.ui.set_status("Reply ready. TTS...");
        let audio_out = match self.parts.tts.synthesize(&text_out).await {
            Ok(audio) => audio,
            Err(e) => {
                session.discard_unanswered();
                return TurnFlow::Done(classify(e));
            }
        };
        session.record_reply(text_out.clone());

        self.set_phase(OrchestratorPhase::TurnPlayback);
        self.parts.ui.set_status("Playing...");
        self.parts.ui.set_visual(VisualState::Talking);
        let outcome = self.play(PlaybackRequest::new(audio_out.clone())).await;
        self.parts.ui.set_visual(VisualState::Idle);

        if let PlaybackOutcome::Failed(failure) = outcome {
            tracing::warn!(error = %failure, "reply playback failed, continuing session");
        }

        TurnFlow::Done(TurnResult::Success {
            text_in,
            text_out,
            audio_out,
        })
    }

    /// Speak the reply sentence by sentence while it is still being generated
    async fn streamed_reply(
        &self,
        session: &mut ConversationSession,
        text_in: String,
        streaming: &StreamingConfig,
    ) -> TurnResult {
        self.parts.ui.set_status("Streaming reply...");
        let (tx, rx) = mpsc::unbounded_channel();

        let (reply, (clips, speech_error)) = tokio::join!(
            self.parts.llm.reply_stream(session.context(), tx),
            self.speak_deltas(rx, streaming),
        );
        if !clips.is_empty() {
            self.parts.ui.set_visual(VisualState::Idle);
        }

        let text_out = match reply.and_then(|text| speech_error.map_or(Ok(text), Err)) {
            Ok(text) => text,
            Err(e) => {
                session.discard_unanswered();
                return classify(e);
            }
        };
        session.record_reply(text_out.clone());

        let audio_out = AudioClip::concat(&clips).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not join streamed reply audio");
            AudioClip::silence(Duration::ZERO, SAMPLE_RATE)
        });
        TurnResult::Success {
            text_in,
            text_out,
            audio_out,
        }
    }

    /// Chunk deltas into sentences and speak each in order
    ///
    /// Stops synthesizing at the first failure but keeps draining so the
    /// model stream can finish.
    async fn speak_deltas(
        &self,
        mut deltas: mpsc::UnboundedReceiver<String>,
        streaming: &StreamingConfig,
    ) -> (Vec<AudioClip>, Option<Error>) {
        let mut chunker = SentenceChunker::new(streaming.max_chars, streaming.max_wait, Instant::now());
        let mut clips = Vec::new();
        let mut failure = None;

        loop {
            let next = match chunker.deadline() {
                Some(deadline) => {
                    tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), deltas.recv())
                        .await
                        .unwrap_or_else(|_| Some(String::new()))
                }
                None => deltas.recv().await,
            };
            let Some(delta) = next else { break };

            for chunk in chunker.push(&delta, Instant::now()) {
                if failure.is_none() {
                    failure = self.speak_chunk(&chunk, &mut clips).await.err();
                }
            }
        }

        if let Some(tail) = chunker.finish()
            && failure.is_none()
        {
            failure = self.speak_chunk(&tail, &mut clips).await.err();
        }
        (clips, failure)
    }

    async fn speak_chunk(&self, text: &str, clips: &mut Vec<AudioClip>) -> Result<()> {
        let clip = self.parts.tts.synthesize(text).await?;

        self.set_phase(OrchestratorPhase::TurnPlayback);
        if clips.is_empty() {
            self.parts.ui.set_status("Playing...");
            self.parts.ui.set_visual(VisualState::Talking);
        }
        if let PlaybackOutcome::Failed(failure) = self.play(PlaybackRequest::new(clip.clone())).await {
            tracing::warn!(error = %failure, chars = text.chars().count(), "reply chunk playback failed");
        }
        clips.push(clip);
        Ok(())
    }

    async fn capture_utterance(&self) -> Result<CaptureOutcome> {
        let capture = Arc::clone(&self.parts.capture);
        let profile = self.config.capture.clone();
        let stopping = Arc::clone(&self.stopping);

        tokio::task::spawn_blocking(move || capture.capture(&profile, &stopping))
            .await
            .map_err(|e| Error::Device(format!("capture task failed: {e}")))?
    }

    async fn play(&self, request: PlaybackRequest) -> PlaybackOutcome {
        let playback = Arc::clone(&self.parts.playback);
        match tokio::task::spawn_blocking(move || playback.play(&request)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "playback task failed");
                PlaybackOutcome::Failed(crate::voice::playback::PlaybackFailure::default())
            }
        }
    }

    /// Play the wake acknowledgement before the first turn
    async fn acknowledge(&self) {
        if self.ack.repeat == 0 {
            self.parts.ui.set_status("Session started. Speak now.");
            return;
        }

        match self.play_ack().await {
            Ok(()) => {
                self.parts.ui.set_status("Session started. Speak now.");
                tokio::time::sleep(ACK_SETTLE).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %self.ack.audio_path.display(), "wake acknowledgement failed");
                self.parts
                    .ui
                    .set_status("Ack audio failed. Session started. Speak now.");
            }
        }
    }

    async fn play_ack(&self) -> Result<()> {
        let path = self.ack.audio_path.clone();
        let clip = tokio::task::spawn_blocking(move || AudioClip::from_wav_file(&path))
            .await
            .map_err(|e| Error::Playback(format!("ack load task failed: {e}")))??;

        for attempt in 0..self.ack.repeat {
            if attempt > 0 && !self.ack.gap.is_zero() {
                tokio::time::sleep(self.ack.gap).await;
            }
            let request = PlaybackRequest::new(clip.clone()).with_lead_silence(self.ack.min_lead_silence);
            if let PlaybackOutcome::Failed(failure) = self.play(request).await {
                return Err(Error::Playback(failure.to_string()));
            }
        }
        Ok(())
    }
}

/// Fatal errors end the session; everything else is a miss
fn classify(err: Error) -> TurnResult {
    if err.is_fatal() {
        return TurnResult::Error(err);
    }
    tracing::warn!(error = %err, "recoverable turn failure");
    let reason = err
        .remote_kind()
        .map_or(MissReason::LocalFault, MissReason::Remote);
    TurnResult::Miss(reason)
}
