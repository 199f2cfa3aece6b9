use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voicepi::daemon;
use voicepi::voice::vad::{FRAME_SAMPLES, FrameClassifier};
use voicepi::voice::{
    AudioClip, AudioSource, CaptureOutcome, CpalSource, PlaybackOutcome, PlaybackRequest,
    SAMPLE_RATE, SpeechCapture, VoiceActivityRecorder, build_synthesizer,
};
use voicepi::{Config, Daemon};

/// `VoicePi` - voice desktop companion
#[derive(Parser)]
#[command(name = "voicepi", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/voicepi/config.toml)
    #[arg(short, long, env = "VOICEPI_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input with a live level meter
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output through the playback chain
    TestSpeaker {
        /// WAV file to play instead of a test tone
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Run one wake-phase capture and keyword match
    TestWake,
    /// Synthesize and play text
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Print the resolved configuration with secrets redacted
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voicepi=info",
        1 => "info,voicepi=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker { file } => test_speaker(&config, file).await,
            Command::TestWake => test_wake(&config).await,
            Command::TestTts { text } => test_tts(&config, &text).await,
            Command::CheckConfig => {
                println!("{config:#?}");
                Ok(())
            }
        };
    }

    tracing::info!(
        tts = config.tts.provider.as_str(),
        keywords = %config.wake.keywords_path.display(),
        "starting voicepi"
    );
    tracing::debug!(?config, "loaded configuration");

    Daemon::new(config).run().await?;
    Ok(())
}

/// Live per-frame level and voicing meter
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let source = CpalSource::new();
        let mut stream = source.open(FRAME_SAMPLES)?;
        let mut classifier = FrameClassifier::new(2, 0.0);

        let deadline = Instant::now() + Duration::from_secs(duration);
        let mut frames = 0_u64;
        let mut voiced = 0_u64;
        let mut peak_rms = 0.0_f32;

        while Instant::now() < deadline {
            let Some(frame) = stream.next_frame(Duration::from_millis(100))? else {
                continue;
            };
            let rms = voicepi::voice::clip::rms_i16(&frame);
            let is_voiced = classifier.is_voiced(&frame);
            frames += 1;
            voiced += u64::from(is_voiced);
            peak_rms = peak_rms.max(rms);

            // ~3 meter lines per second
            if frames % 10 == 0 {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let meter_len = (rms / 100.0).min(50.0) as usize;
                let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
                println!(
                    "RMS: {rms:7.1} | {} | [{meter}]",
                    if is_voiced { "voice" } else { "     " }
                );
            }
        }

        println!("\n---");
        println!("Frames: {frames}, voiced: {voiced}, peak RMS: {peak_rms:.1}");
        println!("If RMS stayed near 0, check:");
        println!("  1. Is your mic plugged in?");
        println!("  2. Run: pactl info | grep 'Default Source'");
        println!("  3. Run: arecord -l (to list devices)");
        Ok(())
    })
    .await?
}

/// Play a 440Hz tone (or a WAV file) through the configured backends
async fn test_speaker(config: &Config, file: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing speaker output...");

    if let Some(path) = file {
        println!("Playing {}\n", path.display());
        let sequencer = daemon::build_playback(config);
        let lead = config.playback.options.lead_silence;
        let outcome =
            tokio::task::spawn_blocking(move || sequencer.play_wav_file(&path, lead)).await??;
        report_playback(&outcome);
        return Ok(());
    }

    println!("You should hear a 440Hz tone for 2 seconds\n");

    let frequency = 440.0_f32;
    let num_samples = SAMPLE_RATE as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();
    let tone = AudioClip::from_f32(&samples, SAMPLE_RATE);

    let outcome = play(config, tone).await?;
    report_playback(&outcome);
    Ok(())
}

/// One wake-phase capture, transcript and match
async fn test_wake(config: &Config) -> anyhow::Result<()> {
    let spotter = daemon::load_spotter(config).await?;
    println!(
        "Keywords: {}",
        spotter
            .keywords()
            .keywords()
            .iter()
            .map(|k| k.display.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Say a wake word...\n");

    let profile = config.wake.capture.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let recorder = VoiceActivityRecorder::new(std::sync::Arc::new(CpalSource::new()));
        recorder.capture(&profile, &AtomicBool::new(false))
    })
    .await??;

    let clip = match outcome {
        CaptureOutcome::Clip(clip) => clip,
        CaptureOutcome::TimedOut => {
            println!("No speech detected before the start timeout.");
            return Ok(());
        }
        CaptureOutcome::Cancelled => return Ok(()),
    };

    println!(
        "Captured {}ms (RMS {:.1})",
        clip.duration().as_millis(),
        clip.rms()
    );
    let text = spotter.transcribe(&clip)?;
    println!("Transcript: '{text}'");
    match spotter.find_match(&text) {
        Some(found) => println!("Matched '{}' (distance {})", found.keyword, found.distance),
        None => println!("No keyword match"),
    }
    Ok(())
}

/// Synthesize text and play it
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS ({}) with text: \"{text}\"\n", config.tts.provider.as_str());

    let tts = build_synthesizer(&config.tts, &config.api_keys)?;
    println!("Synthesizing speech...");
    let clip = tts.synthesize(text).await?;
    println!(
        "Got {}ms of audio at {} Hz",
        clip.duration().as_millis(),
        clip.sample_rate()
    );

    let outcome = play(config, clip).await?;
    report_playback(&outcome);
    Ok(())
}

async fn play(config: &Config, clip: AudioClip) -> anyhow::Result<PlaybackOutcome> {
    let sequencer = daemon::build_playback(config);
    println!("Backends: {}", sequencer.backend_names().join(", "));
    Ok(tokio::task::spawn_blocking(move || sequencer.play(&PlaybackRequest::new(clip))).await?)
}

fn report_playback(outcome: &PlaybackOutcome) {
    println!("\n---");
    match outcome {
        PlaybackOutcome::Completed { backend } => {
            println!("Played via {backend}. If you heard it, output is working!");
        }
        PlaybackOutcome::Failed(failure) => {
            println!("Playback failed: {failure}");
            println!("  1. Run: pactl info | grep 'Default Sink'");
            println!("  2. Run: which pw-play aplay paplay");
        }
    }
}
