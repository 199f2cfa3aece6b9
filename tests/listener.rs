//! Wake listener tests
//!
//! Run the real listener thread over a scripted capture and a fixed
//! recognizer

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use voicepi::UiSink;
use voicepi::voice::keyword::DEFAULT_MAX_EDIT_RATIO;
use voicepi::voice::listener::WakeCallback;
use voicepi::voice::{
    CaptureProfile, KeywordMatcher, KeywordSet, ListenerControl, ListenerState, ListenerTiming,
    LocalKeywordSpotter, MicListener, SpeechCapture, WakeEvent,
};

mod common;

use common::{FixedRecognizer, RecordingUi, ScriptedCapture, WhenEmpty, utterance, wait_until};

const WAIT: Duration = Duration::from_secs(2);

struct Rig {
    listener: MicListener,
    capture: Arc<ScriptedCapture>,
    ui: Arc<RecordingUi>,
    wakes: mpsc::Receiver<WakeEvent>,
}

fn rig(heard: &str, script: Vec<voicepi::Result<voicepi::voice::CaptureOutcome>>) -> Rig {
    let capture = ScriptedCapture::new(script, WhenEmpty::HoldUntilCancelled);
    let ui = Arc::new(RecordingUi::default());
    let spotter = LocalKeywordSpotter::new(
        Box::new(FixedRecognizer(heard.to_string())),
        KeywordMatcher::new(KeywordSet::new(["hey pi", "computer"]), DEFAULT_MAX_EDIT_RATIO),
    );

    let (tx, wakes) = mpsc::channel();
    let tx = Mutex::new(tx);
    let on_wake: WakeCallback = Arc::new(move |event| {
        let _ = tx.lock().unwrap().send(event);
    });

    let timing = ListenerTiming {
        cycle_sleep: Duration::from_millis(5),
        match_pause: Duration::from_millis(5),
        error_backoff: Duration::from_millis(5),
    };

    let listener = MicListener::new(
        Arc::clone(&capture) as Arc<dyn SpeechCapture>,
        Arc::new(spotter),
        CaptureProfile::wake_default(),
        timing,
        Arc::clone(&ui) as Arc<dyn UiSink>,
        on_wake,
    );

    Rig {
        listener,
        capture,
        ui,
        wakes,
    }
}

#[test]
fn test_listener_starts_idle() {
    let rig = rig("hey pi", Vec::new());
    assert_eq!(rig.listener.state(), ListenerState::Idle);
    assert_eq!(rig.capture.calls(), 0);
}

#[test]
fn test_wake_match_fires_callback_and_suspends() {
    let rig = rig("Hey, Pi!", vec![utterance()]);
    rig.listener.start().unwrap();

    let event = rig.wakes.recv_timeout(WAIT).unwrap();
    assert_eq!(event.keyword, "hey pi");
    assert_eq!(event.transcript, "Hey, Pi!");
    assert_eq!(rig.listener.state(), ListenerState::Suspended);
    assert!(rig.ui.statuses().contains(&"Wake word: hey pi".to_string()));

    // no capture while suspended
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(rig.capture.calls(), 1);

    rig.listener.resume();
    assert_eq!(rig.listener.state(), ListenerState::Listening);
    assert!(wait_until(WAIT, || rig.capture.active() == 1));
    assert_eq!(rig.capture.calls(), 2);

    rig.listener.stop();
}

#[test]
fn test_unmatched_transcript_is_reported() {
    let rig = rig("good morning", vec![utterance()]);
    rig.listener.start().unwrap();

    let expected = "Heard: 'good morning' (no match)".to_string();
    assert!(wait_until(WAIT, || rig.ui.statuses().contains(&expected)));
    assert!(rig.wakes.try_recv().is_err());
    assert_eq!(rig.listener.state(), ListenerState::Listening);

    // the loop carries on into the next capture
    assert!(wait_until(WAIT, || rig.capture.calls() == 2));
    rig.listener.stop();
}

#[test]
fn test_stop_interrupts_blocking_capture() {
    let rig = rig("hey pi", Vec::new());
    rig.listener.start().unwrap();
    assert!(wait_until(WAIT, || rig.capture.active() == 1));

    let started = Instant::now();
    rig.listener.stop();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(rig.capture.active(), 0);
    assert_eq!(rig.listener.state(), ListenerState::Stopped);
    assert_eq!(rig.ui.last_status().as_deref(), Some("Stopped"));

    // terminal
    rig.listener.resume();
    assert_eq!(rig.listener.state(), ListenerState::Stopped);
}

#[test]
fn test_suspend_returns_after_device_release() {
    let rig = rig("hey pi", Vec::new());
    rig.listener.start().unwrap();
    assert!(wait_until(WAIT, || rig.capture.active() == 1));

    rig.listener.suspend();
    assert_eq!(rig.capture.active(), 0);
    assert_eq!(rig.listener.state(), ListenerState::Suspended);

    // suspending twice is harmless
    rig.listener.suspend();
    assert_eq!(rig.listener.state(), ListenerState::Suspended);

    rig.listener.resume();
    assert!(wait_until(WAIT, || rig.capture.calls() == 2 && rig.capture.active() == 1));
    assert_eq!(rig.capture.max_active(), 1);

    rig.listener.stop();
}

#[test]
fn test_user_pause_survives_session_resume() {
    let rig = rig("hey pi", Vec::new());
    rig.listener.start().unwrap();
    assert!(wait_until(WAIT, || rig.capture.active() == 1));

    rig.listener.disable();
    assert_eq!(rig.listener.state(), ListenerState::Suspended);
    assert_eq!(rig.ui.last_status().as_deref(), Some("Paused"));

    rig.listener.resume();
    assert_eq!(rig.listener.state(), ListenerState::Suspended);
    assert_eq!(rig.capture.calls(), 1);

    rig.listener.enable();
    assert_eq!(rig.listener.state(), ListenerState::Listening);
    assert!(wait_until(WAIT, || rig.capture.calls() == 2));

    rig.listener.stop();
}

#[test]
fn test_drop_stops_listener() {
    let rig = rig("hey pi", Vec::new());
    rig.listener.start().unwrap();
    assert!(wait_until(WAIT, || rig.capture.active() == 1));

    let capture = Arc::clone(&rig.capture);
    drop(rig);
    assert_eq!(capture.active(), 0);
}
