//! Audio playback through an ordered chain of output backends
//!
//! The first backend that starts is used to completion. A backend that
//! cannot start is skipped immediately; one that fails at runtime is retried
//! a bounded number of times before the chain moves on.

use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::clip::AudioClip;
use crate::Result;

/// Delay between runtime retries on the same backend
const RETRY_DELAY: Duration = Duration::from_millis(60);

/// Poll interval while waiting for a player process
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Backend names understood by [`backend_by_name`]
pub const KNOWN_BACKENDS: &[&str] = &["pw-play", "aplay", "paplay", "cpal"];

/// Why a backend did not complete playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendFailure {
    /// Could not start (binary missing, device busy)
    Unavailable(String),
    /// Started but failed
    Failed(String),
    /// Did not finish within the play timeout
    TimedOut,
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "failed to start: {msg}"),
            Self::Failed(msg) => write!(f, "failed: {msg}"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

/// An audio output method
pub trait PlaybackBackend: Send + Sync {
    /// Stable name used in preference lists
    fn name(&self) -> &str;

    /// Whether the backend clips the first moments of audio when cold
    fn cold_start(&self) -> bool {
        false
    }

    /// Play a clip to completion, blocking the caller
    ///
    /// # Errors
    ///
    /// Returns a [`BackendFailure`] describing why playback did not complete
    fn play(&self, clip: &AudioClip, timeout: Duration) -> std::result::Result<(), BackendFailure>;
}

/// Sequencer tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackOptions {
    /// Minimum lead-in silence before audio
    pub lead_silence: Duration,
    /// Prepend `lead_silence` even when the clip already has some
    pub force_lead_silence: bool,
    /// Length of a silent warm-up clip played on cold-start backends
    pub warmup: Duration,
    /// Extra attempts after a runtime failure on one backend
    pub retries: u32,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            lead_silence: Duration::ZERO,
            force_lead_silence: false,
            warmup: Duration::ZERO,
            retries: 1,
        }
    }
}

/// A clip to play plus optional overrides
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    /// Audio to play
    pub clip: AudioClip,
    /// Backend names to try first, in order
    pub preference: Vec<String>,
    /// Lead-in silence for this request, overriding the sequencer default
    pub lead_silence: Option<Duration>,
}

impl PlaybackRequest {
    /// Request with default ordering
    #[must_use]
    pub const fn new(clip: AudioClip) -> Self {
        Self {
            clip,
            preference: Vec::new(),
            lead_silence: None,
        }
    }

    /// Prefer these backends, in order
    #[must_use]
    pub fn prefer<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preference = names.into_iter().map(Into::into).collect();
        self
    }

    /// Require at least `lead` of lead-in silence
    #[must_use]
    pub const fn with_lead_silence(mut self, lead: Duration) -> Self {
        self.lead_silence = Some(lead);
        self
    }
}

/// One backend's failure within a play call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAttempt {
    /// Backend name
    pub backend: String,
    /// Final failure after any retries
    pub failure: BackendFailure,
}

/// All backends were exhausted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackFailure {
    /// Failures in the order backends were tried
    pub attempts: Vec<BackendAttempt>,
}

impl fmt::Display for PlaybackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return f.write_str("no playback backends configured");
        }
        let parts: Vec<String> = self
            .attempts
            .iter()
            .map(|a| format!("{} {}", a.backend, a.failure))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

/// Result of a play call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Played to completion
    Completed {
        /// Backend that played the clip
        backend: String,
    },
    /// Every backend failed
    Failed(PlaybackFailure),
}

impl PlaybackOutcome {
    /// Whether playback completed
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Per-play timeout: generous for slow players, bounded for hung ones
#[must_use]
pub fn play_timeout(duration: Duration) -> Duration {
    let scaled = duration.mul_f64(1.6) + Duration::from_secs(4);
    scaled.max(Duration::from_secs(12))
}

/// Plays clips through an ordered fallback chain
pub struct PlaybackSequencer {
    backends: Vec<Arc<dyn PlaybackBackend>>,
    options: PlaybackOptions,
}

impl PlaybackSequencer {
    /// Create a sequencer over explicit backends
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn PlaybackBackend>>, options: PlaybackOptions) -> Self {
        Self { backends, options }
    }

    /// Create a sequencer from backend names, skipping unknown names
    #[must_use]
    pub fn from_names(names: &[String], options: PlaybackOptions) -> Self {
        let backends = names
            .iter()
            .filter_map(|name| {
                let backend = backend_by_name(name);
                if backend.is_none() {
                    tracing::warn!(backend = %name, "unknown playback backend ignored");
                }
                backend
            })
            .collect();
        Self::new(backends, options)
    }

    /// Backend names in default order
    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Play a clip, blocking until it completes or every backend fails
    #[must_use]
    pub fn play(&self, request: &PlaybackRequest) -> PlaybackOutcome {
        let lead = request.lead_silence.unwrap_or(self.options.lead_silence);
        let clip = if lead.is_zero() {
            request.clip.clone()
        } else {
            request
                .clip
                .with_lead_silence(lead, self.options.force_lead_silence)
        };
        let timeout = play_timeout(clip.duration());

        let mut failure = PlaybackFailure::default();

        for backend in self.ordered(&request.preference) {
            match self.play_on(backend.as_ref(), &clip, timeout) {
                Ok(()) => {
                    tracing::debug!(
                        backend = backend.name(),
                        duration_ms = clip.duration().as_millis(),
                        "playback complete"
                    );
                    return PlaybackOutcome::Completed {
                        backend: backend.name().to_string(),
                    };
                }
                Err(reason) => {
                    tracing::warn!(backend = backend.name(), error = %reason, "playback backend failed");
                    failure.attempts.push(BackendAttempt {
                        backend: backend.name().to_string(),
                        failure: reason,
                    });
                }
            }
        }

        tracing::error!(error = %failure, "all playback backends failed");
        PlaybackOutcome::Failed(failure)
    }

    /// Load a WAV file and play it
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or decoded
    pub fn play_wav_file(&self, path: &Path, lead_silence: Duration) -> Result<PlaybackOutcome> {
        let clip = AudioClip::from_wav_file(path)?;
        Ok(self.play(&PlaybackRequest::new(clip).with_lead_silence(lead_silence)))
    }

    fn play_on(
        &self,
        backend: &dyn PlaybackBackend,
        clip: &AudioClip,
        timeout: Duration,
    ) -> std::result::Result<(), BackendFailure> {
        if !self.options.warmup.is_zero() && backend.cold_start() {
            let warmup = AudioClip::silence(self.options.warmup, clip.sample_rate());
            match backend.play(&warmup, play_timeout(warmup.duration())) {
                Err(unavailable @ BackendFailure::Unavailable(_)) => return Err(unavailable),
                Err(e) => tracing::debug!(backend = backend.name(), error = %e, "warm-up failed"),
                Ok(()) => {}
            }
        }

        let mut attempt = 0;
        loop {
            match backend.play(clip, timeout) {
                Err(BackendFailure::Failed(msg)) if attempt < self.options.retries => {
                    attempt += 1;
                    tracing::debug!(backend = backend.name(), attempt, error = %msg, "retrying playback");
                    std::thread::sleep(RETRY_DELAY);
                }
                result => return result,
            }
        }
    }

    fn ordered(&self, preference: &[String]) -> Vec<Arc<dyn PlaybackBackend>> {
        let mut ordered: Vec<Arc<dyn PlaybackBackend>> = preference
            .iter()
            .filter_map(|name| self.backends.iter().find(|b| b.name() == name))
            .cloned()
            .collect();

        for backend in &self.backends {
            if !ordered.iter().any(|b| b.name() == backend.name()) {
                ordered.push(Arc::clone(backend));
            }
        }
        ordered
    }
}

/// Construct a built-in backend by name
#[must_use]
pub fn backend_by_name(name: &str) -> Option<Arc<dyn PlaybackBackend>> {
    match name {
        "pw-play" => Some(Arc::new(CommandBackend::new("pw-play", &[]))),
        "aplay" => Some(Arc::new(CommandBackend::new("aplay", &["-q"]))),
        "paplay" => Some(Arc::new(CommandBackend::new("paplay", &[]))),
        "cpal" => Some(Arc::new(CpalBackend)),
        _ => None,
    }
}

/// Plays a temporary WAV file through an external player binary
pub struct CommandBackend {
    name: String,
    args: Vec<String>,
    binary: Option<PathBuf>,
}

impl CommandBackend {
    /// Create a backend for `program`, resolved on `PATH`
    #[must_use]
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            name: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            binary: which::which(program).ok(),
        }
    }
}

impl PlaybackBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn cold_start(&self) -> bool {
        true
    }

    fn play(&self, clip: &AudioClip, timeout: Duration) -> std::result::Result<(), BackendFailure> {
        let Some(binary) = &self.binary else {
            return Err(BackendFailure::Unavailable(format!("{} not found on PATH", self.name)));
        };

        let wav = clip
            .to_wav_bytes()
            .map_err(|e| BackendFailure::Failed(e.to_string()))?;
        let mut file = tempfile::Builder::new()
            .prefix("voicepi-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| BackendFailure::Failed(format!("temp file: {e}")))?;
        file.write_all(&wav)
            .and_then(|()| file.flush())
            .map_err(|e| BackendFailure::Failed(format!("temp file: {e}")))?;

        let mut child = Command::new(binary)
            .args(&self.args)
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendFailure::Unavailable(e.to_string()))?;

        // drained concurrently so a chatty player never fills the pipe
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BackendFailure::TimedOut);
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(BackendFailure::Failed(e.to_string())),
            }
        };

        let stderr = stderr
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        if status.success() {
            return Ok(());
        }

        let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        Err(BackendFailure::Failed(format!("{status}: {}", detail.trim())))
    }
}

/// Plays directly to the default cpal output device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl PlaybackBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn play(&self, clip: &AudioClip, timeout: Duration) -> std::result::Result<(), BackendFailure> {
        if clip.is_empty() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| BackendFailure::Unavailable("no output device available".to_string()))?;

        let config = device
            .default_output_config()
            .map_err(|e| BackendFailure::Unavailable(e.to_string()))?
            .config();
        let channels = usize::from(config.channels);

        let samples = clip
            .resample(config.sample_rate.0)
            .map_err(|e| BackendFailure::Failed(e.to_string()))?
            .to_f32();
        let total = samples.len();

        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let stream = {
            let position = Arc::clone(&position);
            let finished = Arc::clone(&finished);
            let failed = Arc::clone(&failed);
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut pos = position.load(Ordering::Relaxed);
                        for frame in data.chunks_mut(channels) {
                            let sample = samples.get(pos).copied().unwrap_or(0.0);
                            frame.fill(sample);
                            if pos < total {
                                pos += 1;
                            }
                        }
                        position.store(pos, Ordering::Relaxed);
                        if pos >= total {
                            finished.store(true, Ordering::Release);
                        }
                    },
                    move |err| {
                        tracing::error!(error = %err, "audio playback error");
                        failed.store(true, Ordering::Release);
                    },
                    None,
                )
                .map_err(|e| BackendFailure::Unavailable(e.to_string()))?
        };

        stream
            .play()
            .map_err(|e| BackendFailure::Unavailable(e.to_string()))?;

        let start = Instant::now();
        while !finished.load(Ordering::Acquire) {
            if failed.load(Ordering::Acquire) {
                return Err(BackendFailure::Failed("output stream error".to_string()));
            }
            if start.elapsed() > timeout {
                return Err(BackendFailure::TimedOut);
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));
        drop(stream);

        Ok(())
    }
}
