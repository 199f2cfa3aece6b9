//! Background wake-word listener
//!
//! A single worker thread owns the wake-phase capture loop. All state lives
//! behind one mutex; the worker only opens the microphone while the state
//! is [`ListenerState::Listening`], and `suspend`/`stop` cancel an in-flight
//! capture and wait for the device to be released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use super::keyword::LocalKeywordSpotter;
use super::recorder::{CaptureOutcome, CaptureProfile, SpeechCapture};
use crate::Result;
use crate::ui::UiSink;

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Created, not yet started
    Idle,
    /// Capture loop running
    Listening,
    /// Capture loop parked (conversation active or user pause)
    Suspended,
    /// Terminal
    Stopped,
}

/// A wake keyword was heard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeEvent {
    /// Full local transcript
    pub transcript: String,
    /// Configured keyword that matched
    pub keyword: String,
}

/// Invoked on the listener thread when a keyword matches
pub type WakeCallback = Arc<dyn Fn(WakeEvent) + Send + Sync>;

/// Suspend/resume handle the conversation side holds
pub trait ListenerControl: Send + Sync {
    /// Park the capture loop and wait until the microphone is released
    fn suspend(&self);

    /// Restart the capture loop if it was suspended
    fn resume(&self);

    /// Current state
    fn state(&self) -> ListenerState;
}

/// Loop pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerTiming {
    /// Pause between capture cycles
    pub cycle_sleep: Duration,
    /// Extra pause after a wake match
    pub match_pause: Duration,
    /// Minimum pause after a capture or recognition error
    pub error_backoff: Duration,
}

impl Default for ListenerTiming {
    fn default() -> Self {
        Self {
            cycle_sleep: Duration::from_millis(250),
            match_pause: Duration::from_millis(500),
            error_backoff: Duration::from_millis(300),
        }
    }
}

struct Inner {
    state: ListenerState,
    capturing: bool,
    user_paused: bool,
    worker: Option<ThreadId>,
}

struct Shared {
    inner: Mutex<Inner>,
    changed: Condvar,
    cancel: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn on_worker(inner: &Inner) -> bool {
        inner.worker == Some(std::thread::current().id())
    }

    /// Block until a capture in flight has returned (device released)
    fn await_release<'a>(&self, mut guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        if Self::on_worker(&guard) {
            return guard;
        }
        while guard.capturing {
            guard = self.wait(guard);
        }
        guard
    }

    /// Sleep for `duration`, returning early if stopped
    fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let guard = self.lock();
        drop(
            self.changed
                .wait_timeout_while(guard, duration, |inner| {
                    inner.state != ListenerState::Stopped
                })
                .unwrap_or_else(PoisonError::into_inner),
        );
    }
}

/// Continuously listens for a wake keyword
pub struct MicListener {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<Worker>>,
    ui: Arc<dyn UiSink>,
}

impl MicListener {
    /// Create a listener; nothing runs until [`MicListener::start`]
    #[must_use]
    pub fn new(
        capture: Arc<dyn SpeechCapture>,
        spotter: Arc<LocalKeywordSpotter>,
        profile: CaptureProfile,
        timing: ListenerTiming,
        ui: Arc<dyn UiSink>,
        on_wake: WakeCallback,
    ) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: ListenerState::Idle,
                capturing: false,
                user_paused: false,
                worker: None,
            }),
            changed: Condvar::new(),
            cancel: AtomicBool::new(false),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            capture,
            spotter,
            profile,
            timing,
            ui: Arc::clone(&ui),
            on_wake,
        };

        Self {
            shared,
            handle: Mutex::new(None),
            worker: Mutex::new(Some(worker)),
            ui,
        }
    }

    /// Idle -> Listening; spawns the capture loop
    ///
    /// # Errors
    ///
    /// Returns error if the worker thread cannot be spawned
    pub fn start(&self) -> Result<()> {
        let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            tracing::debug!("listener already started");
            return Ok(());
        };

        let mut inner = self.shared.lock();
        if inner.state != ListenerState::Idle {
            return Ok(());
        }

        let handle = std::thread::Builder::new()
            .name("voicepi-listener".to_string())
            .spawn(move || worker.run())?;

        inner.worker = Some(handle.thread().id());
        inner.state = ListenerState::Listening;
        drop(inner);
        self.shared.changed.notify_all();

        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!("wake listener started");
        self.ui.set_status("Listening");
        Ok(())
    }

    /// Any state -> Stopped; cancels an in-flight capture and joins the loop
    pub fn stop(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.state == ListenerState::Stopped {
                return;
            }
            inner.state = ListenerState::Stopped;
            self.shared.cancel.store(true, Ordering::Release);
        }
        self.shared.changed.notify_all();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                tracing::debug!("stop requested from listener thread");
            } else if handle.join().is_err() {
                tracing::error!("listener thread panicked");
            }
        }

        tracing::info!("wake listener stopped");
        self.ui.set_status("Stopped");
    }

    /// User pause; unlike `suspend`, a later `resume` does not undo it
    pub fn disable(&self) {
        self.shared.lock().user_paused = true;
        self.suspend();
        self.ui.set_status("Paused");
    }

    /// Undo a user pause
    pub fn enable(&self) {
        {
            let mut inner = self.shared.lock();
            inner.user_paused = false;
            if inner.state == ListenerState::Stopped || inner.state == ListenerState::Idle {
                return;
            }
        }
        self.resume();
        self.ui.set_status("Listening");
    }
}

impl ListenerControl for MicListener {
    fn suspend(&self) {
        let mut inner = self.shared.lock();
        if inner.state == ListenerState::Listening {
            inner.state = ListenerState::Suspended;
            self.shared.cancel.store(true, Ordering::Release);
            self.shared.changed.notify_all();
            tracing::debug!("wake listener suspended");
        }
        drop(self.shared.await_release(inner));
    }

    fn resume(&self) {
        let mut inner = self.shared.lock();
        if inner.state != ListenerState::Suspended || inner.user_paused {
            return;
        }
        inner = self.shared.await_release(inner);
        inner.state = ListenerState::Listening;
        drop(inner);
        self.shared.changed.notify_all();
        tracing::debug!("wake listener resumed");
    }

    fn state(&self) -> ListenerState {
        self.shared.lock().state
    }
}

impl Drop for MicListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved onto the listener thread
struct Worker {
    shared: Arc<Shared>,
    capture: Arc<dyn SpeechCapture>,
    spotter: Arc<LocalKeywordSpotter>,
    profile: CaptureProfile,
    timing: ListenerTiming,
    ui: Arc<dyn UiSink>,
    on_wake: WakeCallback,
}

impl Worker {
    fn run(self) {
        loop {
            {
                let mut inner = self.shared.lock();
                loop {
                    match inner.state {
                        ListenerState::Listening => break,
                        ListenerState::Stopped => return,
                        ListenerState::Idle | ListenerState::Suspended => {
                            inner = self.shared.wait(inner);
                        }
                    }
                }
                inner.capturing = true;
                self.shared.cancel.store(false, Ordering::Release);
            }

            let outcome = self.capture.capture(&self.profile, &self.shared.cancel);

            let still_listening = {
                let mut inner = self.shared.lock();
                inner.capturing = false;
                inner.state == ListenerState::Listening
            };
            self.shared.changed.notify_all();

            if !still_listening {
                continue;
            }

            let pause = self.handle(outcome);
            self.shared.pause(pause);
        }
    }

    /// Process one capture result; returns how long to pause
    fn handle(&self, outcome: Result<CaptureOutcome>) -> Duration {
        let clip = match outcome {
            Ok(CaptureOutcome::Clip(clip)) => clip,
            Ok(CaptureOutcome::TimedOut) => return self.timing.cycle_sleep,
            Ok(CaptureOutcome::Cancelled) => return Duration::ZERO,
            Err(e) => return self.report_error(&e),
        };

        let text = match self.spotter.transcribe(&clip) {
            Ok(text) => text,
            Err(e) => return self.report_error(&e),
        };

        if text.is_empty() {
            return self.timing.cycle_sleep;
        }

        let Some(found) = self.spotter.find_match(&text) else {
            tracing::debug!(transcript = %text, "no keyword match");
            self.ui.set_status(&format!("Heard: '{text}' (no match)"));
            return self.timing.cycle_sleep;
        };

        {
            let mut inner = self.shared.lock();
            if inner.state != ListenerState::Listening {
                return Duration::ZERO;
            }
            inner.state = ListenerState::Suspended;
        }
        self.shared.changed.notify_all();

        tracing::info!(
            keyword = %found.keyword,
            distance = found.distance,
            transcript = %text,
            "wake word detected"
        );
        self.ui.set_status(&format!("Wake word: {}", found.keyword));

        (self.on_wake)(WakeEvent {
            transcript: text,
            keyword: found.keyword,
        });

        self.timing.match_pause + self.timing.cycle_sleep
    }

    fn report_error(&self, err: &crate::Error) -> Duration {
        tracing::warn!(error = %err, "wake cycle failed");
        self.ui.set_status(&format!("Wake error: {err}"));
        self.timing.error_backoff.max(self.timing.cycle_sleep)
    }
}
