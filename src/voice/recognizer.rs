//! Offline speech recognition for keyword spotting

use std::path::{Path, PathBuf};

use super::clip::{AudioClip, SAMPLE_RATE};
use crate::{Error, Result};

/// Transcribes short clips with a locally loaded model
///
/// Loaded once; each call must be independent of the previous one.
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe a 16kHz mono clip
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transcription`] if recognition fails for this clip
    fn transcribe(&self, clip: &AudioClip) -> Result<String>;
}

/// Resolve a model path: a file is used as-is, a directory is searched
/// for the first `*.bin` model
///
/// # Errors
///
/// Returns [`Error::ModelMissing`] if no model can be found
pub fn resolve_model_path(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    if path.is_dir() {
        let mut models: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|e| Error::ModelMissing(format!("{}: {e}", path.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "bin"))
            .collect();
        models.sort();

        return models.into_iter().next().ok_or_else(|| {
            Error::ModelMissing(format!("no *.bin model in {}", path.display()))
        });
    }

    Err(Error::ModelMissing(format!(
        "model path not found: {}",
        path.display()
    )))
}

/// Load the offline recognizer from a model path
///
/// # Errors
///
/// Returns [`Error::ModelMissing`] if the model is missing or unreadable,
/// or if the crate was built without the `whisper` feature
pub fn load_recognizer(path: &Path) -> Result<Box<dyn SpeechRecognizer>> {
    let model = resolve_model_path(path)?;
    load_backend(&model)
}

#[cfg(feature = "whisper")]
fn load_backend(model: &Path) -> Result<Box<dyn SpeechRecognizer>> {
    Ok(Box::new(whisper::WhisperRecognizer::load(model)?))
}

#[cfg(not(feature = "whisper"))]
fn load_backend(model: &Path) -> Result<Box<dyn SpeechRecognizer>> {
    Err(Error::ModelMissing(format!(
        "found {} but voicepi was built without local recognition; rebuild with `--features whisper`",
        model.display()
    )))
}

/// Clip samples as f32, validating the rate the model expects
#[cfg_attr(not(feature = "whisper"), allow(dead_code))]
fn model_input(clip: &AudioClip) -> Result<Vec<f32>> {
    if clip.sample_rate() != SAMPLE_RATE {
        return Err(Error::Transcription(format!(
            "expected {SAMPLE_RATE}Hz audio, got {}Hz",
            clip.sample_rate()
        )));
    }
    Ok(clip.to_f32())
}

#[cfg(feature = "whisper")]
mod whisper {
    use std::path::Path;
    use std::sync::Mutex;

    use whisper_rs::{
        FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState,
    };

    use super::{SpeechRecognizer, model_input};
    use crate::voice::clip::AudioClip;
    use crate::{Error, Result};

    /// Minimum input whisper.cpp accepts without complaint (1s)
    const MIN_SAMPLES: usize = 16_000;

    /// whisper.cpp recognizer
    pub struct WhisperRecognizer {
        // Context must outlive the state created from it
        _ctx: WhisperContext,
        state: Mutex<WhisperState>,
    }

    impl WhisperRecognizer {
        pub fn load(model: &Path) -> Result<Self> {
            let path = model
                .to_str()
                .ok_or_else(|| Error::ModelMissing(format!("non-UTF-8 path: {}", model.display())))?;

            let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())
                .map_err(|e| Error::ModelMissing(format!("{}: {e:?}", model.display())))?;
            let state = ctx
                .create_state()
                .map_err(|e| Error::ModelMissing(format!("failed to create state: {e:?}")))?;

            tracing::info!(model = %model.display(), "keyword model loaded");

            Ok(Self {
                _ctx: ctx,
                state: Mutex::new(state),
            })
        }
    }

    impl SpeechRecognizer for WhisperRecognizer {
        fn transcribe(&self, clip: &AudioClip) -> Result<String> {
            let mut samples = model_input(clip)?;
            if samples.len() < MIN_SAMPLES {
                samples.resize(MIN_SAMPLES, 0.0);
            }

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_language(Some("en"));
            params.set_translate(false);
            params.set_no_timestamps(true);
            params.set_print_special(false);
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_print_timestamps(false);

            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state
                .full(params, &samples)
                .map_err(|e| Error::Transcription(format!("{e:?}")))?;

            let text = state
                .as_iter()
                .filter_map(|segment| segment.to_str().ok().map(str::trim).map(String::from))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ");

            Ok(text)
        }
    }
}
