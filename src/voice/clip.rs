//! Immutable PCM audio clips

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Amplitude (full scale) below which a sample counts as silence
pub const SILENCE_LEVEL: f32 = 0.006;

/// Mono 16-bit PCM audio
///
/// Captured clips are always [`SAMPLE_RATE`]; synthesized clips keep the
/// provider's native rate. Cloning is cheap, the samples are shared.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioClip {
    samples: Arc<[i16]>,
    sample_rate: u32,
}

impl std::fmt::Debug for AudioClip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioClip")
            .field("samples", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl AudioClip {
    /// Create a clip from 16-bit samples
    #[must_use]
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Create a clip from f32 samples in [-1.0, 1.0]
    #[must_use]
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        Self::new(samples.iter().copied().map(f32_to_i16).collect(), sample_rate)
    }

    /// A clip of digital silence
    #[must_use]
    pub fn silence(duration: Duration, sample_rate: u32) -> Self {
        Self::new(vec![0; samples_for(duration, sample_rate)], sample_rate)
    }

    /// Raw samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether the clip holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = self.samples.len() as f64 / f64::from(self.sample_rate);
        Duration::from_secs_f64(secs)
    }

    /// RMS energy on the int16 scale
    #[must_use]
    pub fn rms(&self) -> f32 {
        rms_i16(&self.samples)
    }

    /// Samples as f32 in [-1.0, 1.0]
    #[must_use]
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
    }

    /// Length of the leading run of near-silent samples
    #[must_use]
    pub fn leading_silence(&self) -> Duration {
        let threshold = SILENCE_LEVEL * 32768.0;
        let quiet = self
            .samples
            .iter()
            .take_while(|&&s| f32::from(s).abs() < threshold)
            .count();
        Self::new(vec![0; quiet], self.sample_rate).duration()
    }

    /// Pad with leading zeros until at least `min` of lead-in silence exists
    ///
    /// With `force`, `min` of silence is prepended regardless of the
    /// clip's existing lead-in.
    #[must_use]
    pub fn with_lead_silence(&self, min: Duration, force: bool) -> Self {
        let wanted = samples_for(min, self.sample_rate);
        let existing = if force {
            0
        } else {
            samples_for(self.leading_silence(), self.sample_rate)
        };

        let pad = wanted.saturating_sub(existing);
        if pad == 0 {
            return self.clone();
        }

        let mut samples = Vec::with_capacity(pad + self.samples.len());
        samples.resize(pad, 0);
        samples.extend_from_slice(&self.samples);
        Self::new(samples, self.sample_rate)
    }

    /// Encode as a 16-bit mono WAV file in memory
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for &sample in self.samples.iter() {
                writer.write_sample(sample)?;
            }
            writer.finalize()?;
        }

        Ok(cursor.into_inner())
    }

    /// Decode a WAV file held in memory, downmixing to mono
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a readable WAV file
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self> {
        let reader = hound::WavReader::new(Cursor::new(bytes))?;
        Self::from_wav_reader(reader)
    }

    /// Load a WAV file from disk, downmixing to mono
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or not a readable WAV file
    pub fn from_wav_file(path: &Path) -> Result<Self> {
        let reader = hound::WavReader::open(path)?;
        Self::from_wav_reader(reader)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_wav_reader<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<Self> {
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<i16> = match spec.sample_format {
            hound::SampleFormat::Int if spec.bits_per_sample <= 16 => {
                reader.into_samples::<i16>().collect::<std::result::Result<_, _>>()?
            }
            hound::SampleFormat::Int => {
                let shift = spec.bits_per_sample - 16;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| (v >> shift) as i16))
                    .collect::<std::result::Result<_, _>>()?
            }
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .map(|s| s.map(f32_to_i16))
                .collect::<std::result::Result<_, _>>()?,
        };

        Ok(Self::new(downmix(&interleaved, channels), spec.sample_rate))
    }

    /// Decode MP3 bytes (e.g. cloud TTS output), downmixing to mono
    ///
    /// # Errors
    ///
    /// Returns error if decoding fails
    pub fn from_mp3_bytes(mp3_data: &[u8]) -> Result<Self> {
        let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
        let mut samples = Vec::new();
        let mut sample_rate = 0;

        loop {
            match decoder.next_frame() {
                Ok(frame) => {
                    if sample_rate == 0 {
                        sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                    }
                    samples.extend(downmix(&frame.data, frame.channels.max(1)));
                }
                Err(minimp3::Error::Eof) => break,
                Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
            }
        }

        if sample_rate == 0 {
            return Err(Error::Playback("MP3 stream contained no frames".to_string()));
        }

        Ok(Self::new(samples, sample_rate))
    }

    /// Join clips end to end at the first clip's rate
    ///
    /// # Errors
    ///
    /// Returns error if a clip at another rate cannot be resampled
    pub fn concat(clips: &[Self]) -> Result<Self> {
        let Some(first) = clips.first() else {
            return Ok(Self::new(Vec::new(), SAMPLE_RATE));
        };
        let rate = first.sample_rate;

        let mut samples = Vec::with_capacity(clips.iter().map(|c| c.samples.len()).sum());
        for clip in clips {
            if clip.sample_rate == rate {
                samples.extend_from_slice(&clip.samples);
            } else {
                samples.extend_from_slice(&clip.resample(rate)?.samples);
            }
        }
        Ok(Self::new(samples, rate))
    }

    /// Resample to `target_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be constructed
    pub fn resample(&self, target_rate: u32) -> Result<Self> {
        const CHUNK: usize = 1024;

        if target_rate == self.sample_rate || self.samples.is_empty() {
            return Ok(Self::new(self.samples.to_vec(), target_rate));
        }

        let mut resampler = mono_resampler(self.sample_rate, target_rate, CHUNK)
            .map_err(|e| Error::Playback(format!("resampler setup failed: {e}")))?;

        let input = self.to_f32();
        let mut output = Vec::with_capacity(
            input.len() * target_rate as usize / self.sample_rate as usize + CHUNK,
        );

        for chunk in input.chunks(CHUNK) {
            let waves_out = if chunk.len() == CHUNK {
                resampler.process(&[chunk], None)
            } else {
                resampler.process_partial(Some(&[chunk]), None)
            }
            .map_err(|e| Error::Playback(format!("resampling failed: {e}")))?;
            output.extend(waves_out.into_iter().next().unwrap_or_default());
        }

        Ok(Self::from_f32(&output, target_rate))
    }
}

/// Single-channel sinc resampler taking `chunk` input frames per call
pub(crate) fn mono_resampler(
    from_rate: u32,
    to_rate: u32,
    chunk: usize,
) -> std::result::Result<SincFixedIn<f32>, rubato::ResamplerConstructionError> {
    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    SincFixedIn::new(f64::from(to_rate) / f64::from(from_rate), 1.0, params, chunk, 1)
}

/// RMS energy of 16-bit samples, on the int16 scale
#[must_use]
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let rms = (sum / samples.len() as f64).sqrt() as f32;
    rms
}

/// Convert one f32 sample in [-1.0, 1.0] to i16
#[must_use]
pub fn f32_to_i16(sample: f32) -> i16 {
    #[allow(clippy::cast_possible_truncation)]
    let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
    value
}

fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let n = (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize;
    n
}

fn downmix(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let mean = (sum / frame.len() as i32) as i16;
            mean
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_joins_at_first_rate() {
        let a = AudioClip::new(vec![1; 100], 22_050);
        let b = AudioClip::new(vec![2; 50], 22_050);
        let joined = AudioClip::concat(&[a, b]).unwrap();

        assert_eq!(joined.sample_rate(), 22_050);
        assert_eq!(joined.samples().len(), 150);
        assert_eq!(joined.samples()[100], 2);

        assert!(AudioClip::concat(&[]).unwrap().is_empty());
    }

    fn tone(amplitude: i16, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn duration_and_rms() {
        let clip = AudioClip::new(tone(1000, 16000), SAMPLE_RATE);
        assert_eq!(clip.duration(), Duration::from_secs(1));
        assert!((clip.rms() - 1000.0).abs() < 0.01);
        assert_eq!(AudioClip::new(Vec::new(), SAMPLE_RATE).rms(), 0.0);
    }

    #[test]
    fn wav_roundtrip_preserves_samples() {
        let clip = AudioClip::new(tone(1234, 480), SAMPLE_RATE);
        let bytes = clip.to_wav_bytes().unwrap();
        let decoded = AudioClip::from_wav_bytes(&bytes).unwrap();
        assert_eq!(decoded, clip);
    }

    #[test]
    fn lead_silence_pads_only_the_shortfall() {
        let mut samples = vec![0i16; 1600];
        samples.extend(tone(5000, 1600));
        let clip = AudioClip::new(samples, SAMPLE_RATE);
        assert_eq!(clip.leading_silence(), Duration::from_millis(100));

        let padded = clip.with_lead_silence(Duration::from_millis(300), false);
        assert_eq!(padded.leading_silence(), Duration::from_millis(300));
        assert_eq!(padded.samples().len(), 3200 + 3200);

        let unchanged = clip.with_lead_silence(Duration::from_millis(50), false);
        assert_eq!(unchanged, clip);

        let forced = clip.with_lead_silence(Duration::from_millis(50), true);
        assert_eq!(forced.samples().len(), 3200 + 800);
    }

    #[test]
    fn stereo_downmix_averages_channels() {
        assert_eq!(downmix(&[100, 300, -200, 200], 2), vec![200, 0]);
    }

    #[test]
    fn resample_changes_length_proportionally() {
        let clip = AudioClip::new(tone(3000, 16000), SAMPLE_RATE);
        let up = clip.resample(48000).unwrap();
        assert_eq!(up.sample_rate(), 48000);
        let ratio = up.samples().len() as f64 / clip.samples().len() as f64;
        assert!((ratio - 3.0).abs() < 0.1, "ratio was {ratio}");
    }
}
