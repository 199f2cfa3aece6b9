//! Conversation session tests
//!
//! Drive the orchestrator with scripted collaborators

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use voicepi::config::AckConfig;
use voicepi::conversation::OrchestratorPhase;
use voicepi::voice::keyword::DEFAULT_MAX_EDIT_RATIO;
use voicepi::voice::listener::WakeCallback;
use voicepi::voice::{
    AudioClip, CaptureOutcome, CaptureProfile, KeywordMatcher, KeywordSet, ListenerControl,
    ListenerState, ListenerTiming, LocalKeywordSpotter, MicListener, SAMPLE_RATE, SpeechCapture,
    WakeEvent,
};
use voicepi::{DialogueMessage, RemoteErrorKind, SessionEnd, UiSink, VisualState};

mod common;

use common::{
    FixedRecognizer, Harness, RecordingLlm, ScriptedBackend, ScriptedCapture, ScriptedStt,
    ScriptedTts, WhenEmpty, remote, speech_clip, utterance,
};

fn wake() -> WakeEvent {
    WakeEvent {
        transcript: "hey pi".to_string(),
        keyword: "hey pi".to_string(),
    }
}

#[tokio::test]
async fn test_silence_ends_session_at_miss_limit() {
    let h = Harness::new(Vec::new());
    let orchestrator = h.orchestrator(3);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();

    assert_eq!(summary.end, SessionEnd::MissLimit);
    assert_eq!(summary.turns, 0);
    assert_eq!(summary.misses, 3);
    assert_eq!(h.capture.calls(), 3);
    assert_eq!(h.stt.calls(), 0);

    assert_eq!(h.listener.suspends(), 1);
    assert_eq!(h.listener.resumes(), 1);
    assert_eq!(orchestrator.phase(), OrchestratorPhase::WaitingForWake);

    let statuses = h.ui.statuses();
    assert!(statuses.contains(&"No valid input (3/3)".to_string()));
    assert_eq!(h.ui.last_status().as_deref(), Some("Session ended. Listening"));
}

#[tokio::test]
async fn test_context_grows_by_one_exchange_per_turn() {
    let h = Harness::new(vec![utterance(), utterance(), utterance()]);
    let orchestrator = h.orchestrator(1);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();
    assert_eq!(summary.turns, 3);
    assert_eq!(summary.end, SessionEnd::MissLimit);

    let contexts = h.llm.contexts();
    let lengths: Vec<usize> = contexts.iter().map(Vec::len).collect();
    assert_eq!(lengths, [1, 3, 5]);
    assert_eq!(
        contexts[2],
        vec![
            DialogueMessage::user("turn 1"),
            DialogueMessage::assistant("reply 1"),
            DialogueMessage::user("turn 2"),
            DialogueMessage::assistant("reply 2"),
            DialogueMessage::user("turn 3"),
        ]
    );

    assert_eq!(h.tts.calls(), 3);
    assert_eq!(h.backend.calls(), 3);
    assert!(h.ui.statuses().contains(&"Turn 3 done. Speak now.".to_string()));
}

#[tokio::test]
async fn test_transient_stt_failure_is_a_miss_not_an_end() {
    let mut h = Harness::new(vec![utterance(), utterance()]);
    h.stt = ScriptedStt::new(vec![
        Err(remote(RemoteErrorKind::Network)),
        Ok("hello there".to_string()),
    ]);
    let orchestrator = h.orchestrator(2);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();

    // miss, success (resets), timeout, timeout
    assert_eq!(h.capture.calls(), 4);
    assert_eq!(summary.turns, 1);
    assert_eq!(summary.end, SessionEnd::MissLimit);
    assert_eq!(h.llm.contexts(), vec![vec![DialogueMessage::user("hello there")]]);

    let statuses = h.ui.statuses();
    assert!(statuses.contains(&"No valid input (1/2)".to_string()));
    assert!(statuses.contains(&"Turn 1 done. Speak now.".to_string()));
}

#[tokio::test]
async fn test_playback_failure_does_not_end_session() {
    let mut h = Harness::new(vec![utterance()]);
    h.backend = ScriptedBackend::broken("fake");
    let orchestrator = h.orchestrator(1);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();

    assert_eq!(summary.turns, 1);
    assert_eq!(summary.end, SessionEnd::MissLimit);
    // one retry on a non-zero exit
    assert_eq!(h.backend.calls(), 2);
    assert!(h.ui.statuses().contains(&"Turn 1 done. Speak now.".to_string()));

    let visuals = h.ui.visuals();
    assert_eq!(&visuals[..2], &[VisualState::Talking, VisualState::Idle]);
    assert_eq!(visuals.last(), Some(&VisualState::Idle));
}

#[tokio::test]
async fn test_auth_failure_ends_session() {
    let mut h = Harness::new(vec![utterance(), utterance()]);
    h.llm = RecordingLlm::new(vec![Err(remote(RemoteErrorKind::Auth))]);
    let orchestrator = h.orchestrator(3);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();

    assert!(matches!(summary.end, SessionEnd::Fatal(_)));
    assert_eq!(summary.turns, 0);
    assert_eq!(h.capture.calls(), 1);
    assert_eq!(h.tts.calls(), 0);
    assert_eq!(h.listener.resumes(), 1);
    assert!(h.ui.statuses().iter().any(|s| s.starts_with("Error: ")));
    assert_eq!(orchestrator.phase(), OrchestratorPhase::WaitingForWake);
}

#[tokio::test]
async fn test_recoverable_llm_failure_drops_unanswered_message() {
    let mut h = Harness::new(vec![utterance(), utterance()]);
    h.stt = ScriptedStt::new(vec![Ok("first".to_string()), Ok("second".to_string())]);
    h.llm = RecordingLlm::new(vec![Err(remote(RemoteErrorKind::Quota))]);
    let orchestrator = h.orchestrator(2);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();
    assert_eq!(summary.turns, 1);

    let contexts = h.llm.contexts();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0], vec![DialogueMessage::user("first")]);
    assert_eq!(contexts[1], vec![DialogueMessage::user("second")]);
}

#[tokio::test]
async fn test_streamed_reply_is_spoken_per_sentence() {
    let mut h = Harness::new(vec![utterance()]);
    h.llm = RecordingLlm::new(vec![Ok("Hi there. How are you? Fine".to_string())]);
    let orchestrator = h.streaming_orchestrator(1);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();

    assert_eq!(summary.turns, 1);
    assert_eq!(summary.end, SessionEnd::MissLimit);
    assert_eq!(h.tts.calls(), 3);
    assert_eq!(h.backend.calls(), 3);

    let visuals = h.ui.visuals();
    assert_eq!(&visuals[..2], &[VisualState::Talking, VisualState::Idle]);
    assert!(h.ui.statuses().contains(&"Turn 1 done. Speak now.".to_string()));
}

#[tokio::test]
async fn test_streamed_reply_keeps_full_text_in_context() {
    let mut h = Harness::new(vec![utterance(), utterance()]);
    h.llm = RecordingLlm::new(vec![Ok("One. Two.".to_string())]);
    let orchestrator = h.streaming_orchestrator(1);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();
    assert_eq!(summary.turns, 2);

    let contexts = h.llm.contexts();
    assert_eq!(
        contexts[1],
        vec![
            DialogueMessage::user("turn 1"),
            DialogueMessage::assistant("One. Two."),
            DialogueMessage::user("turn 2"),
        ]
    );
}

#[tokio::test]
async fn test_streamed_synthesis_failure_drops_unanswered_message() {
    let mut h = Harness::new(vec![utterance(), utterance()]);
    h.llm = RecordingLlm::new(vec![Ok("One. Two. Three.".to_string())]);
    h.tts = ScriptedTts::new(vec![Ok(speech_clip(200)), Err(remote(RemoteErrorKind::Quota))]);
    let orchestrator = h.streaming_orchestrator(2);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();
    assert_eq!(summary.turns, 1);

    // synthesis stops at the failed sentence
    assert_eq!(h.backend.played().len(), 2);
    let contexts = h.llm.contexts();
    assert_eq!(contexts[1], vec![DialogueMessage::user("turn 2")]);
}

#[tokio::test]
async fn test_short_and_quiet_clips_skip_stt() {
    let quiet = AudioClip::silence(Duration::from_secs(1), SAMPLE_RATE);
    let h = Harness::new(vec![
        Ok(CaptureOutcome::Clip(speech_clip(300))),
        Ok(CaptureOutcome::Clip(quiet)),
    ]);
    let orchestrator = h.orchestrator(2);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();

    assert_eq!(summary.end, SessionEnd::MissLimit);
    assert_eq!(h.capture.calls(), 2);
    assert_eq!(h.stt.calls(), 0);
}

#[tokio::test]
async fn test_wake_during_session_is_ignored() {
    let h = Harness::new(vec![utterance()]);
    let orchestrator = h.orchestrator(1);

    let (first, second) = tokio::join!(orchestrator.handle_wake(wake()), orchestrator.handle_wake(wake()));

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(h.listener.suspends(), 1);
    assert_eq!(h.listener.resumes(), 1);
}

#[tokio::test]
async fn test_stop_before_first_turn_resolves_as_shutdown() {
    let h = Harness::new(vec![utterance()]);
    let orchestrator = h.orchestrator(2);
    orchestrator.request_stop();

    let summary = orchestrator.handle_wake(wake()).await.unwrap();

    assert_eq!(summary.end, SessionEnd::Shutdown);
    assert_eq!(h.capture.calls(), 0);
    assert_eq!(h.listener.resumes(), 1);
}

#[tokio::test]
async fn test_stop_cancels_capture_in_flight() {
    let mut h = Harness::new(Vec::new());
    h.capture = ScriptedCapture::new(Vec::new(), WhenEmpty::HoldUntilCancelled);
    let orchestrator = Arc::new(h.orchestrator(2));

    let task = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.handle_wake(wake()).await })
    };

    for _ in 0..500 {
        if h.capture.active() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(h.capture.active(), 1);

    orchestrator.request_stop();
    let summary = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("session did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(summary.end, SessionEnd::Shutdown);
    assert_eq!(h.capture.active(), 0);
    assert_eq!(h.listener.resumes(), 1);
}

#[tokio::test]
async fn test_session_end_while_listener_stopped() {
    let h = Harness::new(Vec::new());
    h.listener.stop();
    let orchestrator = h.orchestrator(1);

    orchestrator.handle_wake(wake()).await.unwrap();

    assert_eq!(h.ui.last_status().as_deref(), Some("Session ended"));
}

#[tokio::test]
async fn test_ack_plays_before_first_turn() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ack.wav");
    std::fs::write(&path, speech_clip(100).to_wav_bytes().unwrap()).unwrap();

    let h = Harness::new(vec![utterance()]);
    let ack = AckConfig {
        audio_path: path,
        repeat: 2,
        gap: Duration::from_millis(10),
        min_lead_silence: Duration::ZERO,
    };
    let orchestrator = h.orchestrator_with(1, ack);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();
    assert_eq!(summary.turns, 1);

    // two ack plays, then the reply
    assert_eq!(h.backend.calls(), 3);
    let statuses = h.ui.statuses();
    let started = statuses
        .iter()
        .filter(|s| *s == "Session started. Speak now.")
        .count();
    assert_eq!(started, 1);
}

#[tokio::test]
async fn test_missing_ack_file_still_starts_session() {
    let h = Harness::new(vec![utterance()]);
    let ack = AckConfig {
        audio_path: "/nonexistent/voicepi/ack.wav".into(),
        ..AckConfig::default()
    };
    let orchestrator = h.orchestrator_with(1, ack);

    let summary = orchestrator.handle_wake(wake()).await.unwrap();

    assert_eq!(summary.turns, 1);
    assert_eq!(h.backend.calls(), 1);
    assert!(
        h.ui.statuses()
            .contains(&"Ack audio failed. Session started. Speak now.".to_string())
    );
}

#[tokio::test]
async fn test_run_gives_every_queued_wake_a_session() {
    let h = Harness::new(Vec::new());
    let orchestrator = h.orchestrator(1);

    let (tx, rx) = mpsc::channel(4);
    tx.send(wake()).await.unwrap();
    tx.send(wake()).await.unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(5), orchestrator.run(rx))
        .await
        .expect("run loop did not finish");

    assert_eq!(h.capture.calls(), 2);
    assert_eq!(h.listener.suspends(), 2);
    assert_eq!(h.listener.resumes(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_never_left_suspended_between_sessions() {
    // every wake-phase capture hears the keyword
    let wake_capture = ScriptedCapture::new(
        vec![utterance(), utterance(), utterance()],
        WhenEmpty::HoldUntilCancelled,
    );
    let spotter = LocalKeywordSpotter::new(
        Box::new(FixedRecognizer("hey pi".to_string())),
        KeywordMatcher::new(KeywordSet::new(["hey pi"]), DEFAULT_MAX_EDIT_RATIO),
    );
    let h = Harness::new(Vec::new());

    let (tx, rx) = mpsc::channel(8);
    let on_wake: WakeCallback = Arc::new(move |event| {
        let _ = tx.try_send(event);
    });
    let listener = Arc::new(MicListener::new(
        Arc::clone(&wake_capture) as Arc<dyn SpeechCapture>,
        Arc::new(spotter),
        CaptureProfile::wake_default(),
        ListenerTiming {
            cycle_sleep: Duration::from_millis(1),
            match_pause: Duration::from_millis(1),
            error_backoff: Duration::from_millis(5),
        },
        Arc::clone(&h.ui) as Arc<dyn UiSink>,
        on_wake,
    ));
    let orchestrator = Arc::new(h.orchestrator_for(
        Arc::clone(&listener) as Arc<dyn ListenerControl>,
        1,
    ));

    let task = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(rx).await })
    };
    listener.start().unwrap();

    // three wakes, three sessions, then back to a held wake capture
    let mut settled = false;
    for _ in 0..1000 {
        if h.capture.calls() == 3 && wake_capture.calls() == 4 && wake_capture.active() == 1 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(
        settled,
        "sessions={} wake captures={} state={:?}",
        h.capture.calls(),
        wake_capture.calls(),
        listener.state()
    );
    assert_eq!(listener.state(), ListenerState::Listening);
    assert_eq!(orchestrator.phase(), OrchestratorPhase::WaitingForWake);

    listener.stop();
    orchestrator.request_stop();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("run loop did not stop")
        .unwrap();
}
