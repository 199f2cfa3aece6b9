//! Daemon - the main companion service
//!
//! Wires the wake listener, conversation orchestrator and UI sink together
//! and runs them until Ctrl-C.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{self, Config};
use crate::conversation::{Collaborators, ConversationOrchestrator};
use crate::llm::GeminiClient;
use crate::persona;
use crate::services::{LanguageModel, SpeechSynthesizer, SpeechToText, Unconfigured};
use crate::ui::{ChannelUiSink, UiSink, log_ui_events};
use crate::voice::listener::WakeCallback;
use crate::voice::{
    CloudStt, CpalSource, KeywordMatcher, ListenerControl, LocalKeywordSpotter, MicListener,
    PlaybackSequencer, SpeechCapture, SttProvider, VoiceActivityRecorder, WakeEvent,
    build_synthesizer,
};
use crate::{Error, Result};

/// Wake events buffered between the listener thread and the session loop
const WAKE_QUEUE: usize = 4;

/// The `VoicePi` daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Create a new daemon instance
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the wake subsystem cannot start (missing keywords,
    /// missing model or no microphone thread)
    pub async fn run(self) -> Result<()> {
        let (sink, ui_rx) = ChannelUiSink::new();
        let ui: Arc<dyn UiSink> = Arc::new(sink);
        let ui_task = tokio::spawn(log_ui_events(ui_rx));

        let spotter = Arc::new(load_spotter(&self.config).await?);
        tracing::info!(keywords = spotter.keywords().len(), "keyword spotter ready");

        let capture: Arc<dyn SpeechCapture> =
            Arc::new(VoiceActivityRecorder::new(Arc::new(CpalSource::new())));

        let (wake_tx, wake_rx) = mpsc::channel::<WakeEvent>(WAKE_QUEUE);
        let on_wake: WakeCallback = Arc::new(move |event| {
            if let Err(e) = wake_tx.try_send(event) {
                tracing::warn!(error = %e, "wake event dropped");
            }
        });

        let listener = Arc::new(MicListener::new(
            Arc::clone(&capture),
            spotter,
            self.config.wake.capture.clone(),
            self.config.wake.timing,
            Arc::clone(&ui),
            on_wake,
        ));

        let parts = Collaborators {
            capture,
            stt: stt_or_stub(&self.config, ui.as_ref()),
            llm: llm_or_stub(&self.config, ui.as_ref()),
            tts: tts_or_stub(&self.config, ui.as_ref()),
            playback: Arc::new(build_playback(&self.config)),
            ui: Arc::clone(&ui),
            listener: Arc::clone(&listener) as Arc<dyn ListenerControl>,
        };
        let orchestrator = Arc::new(ConversationOrchestrator::new(
            parts,
            self.config.conversation.clone(),
            self.config.ack.clone(),
        ));

        listener.start()?;
        let sessions = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run(wake_rx).await })
        };

        tracing::info!("voicepi ready");
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");

        // Stop the listener first so a draining session settles to Stopped
        let stopping = Arc::clone(&listener);
        if tokio::task::spawn_blocking(move || stopping.stop()).await.is_err() {
            tracing::error!("listener stop task panicked");
        }
        orchestrator.request_stop();
        if let Err(e) = sessions.await {
            tracing::error!(error = %e, "conversation loop panicked");
        }

        ui.set_status("Exiting");
        drop(orchestrator);
        drop(listener);
        drop(ui);
        if let Err(e) = ui_task.await {
            tracing::debug!(error = %e, "ui log task ended abnormally");
        }

        tracing::info!("daemon stopped");
        Ok(())
    }
}

/// Load keywords and the offline recognizer
///
/// # Errors
///
/// Returns [`Error::Config`] for a missing keyword list and
/// [`Error::ModelMissing`] for a missing model
pub async fn load_spotter(config: &Config) -> Result<LocalKeywordSpotter> {
    let keywords = config::load_keywords(&config.wake.keywords_path)?;
    let matcher = KeywordMatcher::new(keywords, config.wake.max_edit_ratio);
    let model_path = config.wake.model_path.clone();

    tokio::task::spawn_blocking(move || LocalKeywordSpotter::load(&model_path, matcher))
        .await
        .map_err(|e| Error::ModelMissing(format!("model load task failed: {e}")))?
}

/// Build the configured STT client
///
/// # Errors
///
/// Returns [`Error::Config`] if the provider's API key is missing
pub fn build_stt(config: &Config) -> Result<Arc<dyn SpeechToText>> {
    let stt = &config.stt;
    let client = match stt.provider {
        SttProvider::ElevenLabs => CloudStt::new_elevenlabs(
            config.api_keys.elevenlabs.clone(),
            stt.model.clone(),
            stt.language.clone(),
        )?,
        SttProvider::OpenAi => CloudStt::new_openai(
            config.api_keys.openai.clone(),
            stt.model.clone(),
            stt.language.clone(),
        )?,
    };
    Ok(Arc::new(client))
}

/// Build the Gemini client with the persona prompt
///
/// # Errors
///
/// Returns [`Error::Config`] if `GEMINI_API_KEY` is missing
pub fn build_llm(config: &Config) -> Result<Arc<dyn LanguageModel>> {
    let prompt = persona::build_system_prompt(
        &config.persona.identity_path,
        &config.persona.soul_path,
    );
    let client = GeminiClient::new(config.api_keys.gemini.clone(), &config.llm.model, prompt.text)?;
    tracing::debug!(models = ?client.models(), "gemini model chain");
    Ok(Arc::new(client))
}

/// Build the playback chain from configured backend names
#[must_use]
pub fn build_playback(config: &Config) -> PlaybackSequencer {
    PlaybackSequencer::from_names(&config.playback.backends, config.playback.options.clone())
}

fn stt_or_stub(config: &Config, ui: &dyn UiSink) -> Arc<dyn SpeechToText> {
    build_stt(config).unwrap_or_else(|e| {
        tracing::error!(error = %e, "stt unavailable");
        ui.set_status(&format!("STT init error: {e}"));
        Arc::new(Unconfigured::new(e))
    })
}

fn llm_or_stub(config: &Config, ui: &dyn UiSink) -> Arc<dyn LanguageModel> {
    build_llm(config).unwrap_or_else(|e| {
        tracing::error!(error = %e, "llm unavailable");
        ui.set_status(&format!("LLM init error: {e}"));
        Arc::new(Unconfigured::new(e))
    })
}

fn tts_or_stub(config: &Config, ui: &dyn UiSink) -> Arc<dyn SpeechSynthesizer> {
    build_synthesizer(&config.tts, &config.api_keys).unwrap_or_else(|e| {
        tracing::error!(error = %e, "tts unavailable");
        ui.set_status(&format!("TTS init error: {e}"));
        Arc::new(Unconfigured::new(e))
    })
}
