//! Audio capture from microphone
//!
//! An [`AudioSource`] opens a scoped [`FrameStream`]; dropping the stream
//! releases the device.

use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use rubato::{Resampler, SincFixedIn};

use super::clip::{SAMPLE_RATE, f32_to_i16, mono_resampler};
use crate::{Error, Result};

/// A source of fixed-size mono 16kHz frames
pub trait AudioSource: Send + Sync {
    /// Acquire the device and start streaming `frame_samples`-sized frames
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the device cannot be opened
    fn open(&self, frame_samples: usize) -> Result<Box<dyn FrameStream>>;
}

/// An open capture stream
///
/// The device is held until the stream is dropped.
pub trait FrameStream {
    /// Wait up to `timeout` for the next frame
    ///
    /// Returns `Ok(None)` if no frame arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the stream has failed
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>>;
}

/// Captures from the default cpal input device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSource;

impl CpalSource {
    /// Create a source for the default input device
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AudioSource for CpalSource {
    fn open(&self, frame_samples: usize) -> Result<Box<dyn FrameStream>> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        };

        let configs: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| Error::Device(e.to_string()))?
            .filter(|c| supports_rate(c))
            .collect();

        // prefer a native 16kHz config, otherwise resample from the default
        let config = match configs.iter().find(|c| c.channels() == 1).or_else(|| configs.first()) {
            Some(range) => range.clone().with_sample_rate(SampleRate(SAMPLE_RATE)).config(),
            None => device
                .default_input_config()
                .map_err(|e| Error::Device(e.to_string()))?
                .config(),
        };
        let channels = usize::from(config.channels);
        let device_rate = config.sample_rate.0;

        let (tx, rx) = crossbeam_channel::unbounded();
        let (err_tx, err_rx) = crossbeam_channel::bounded(1);
        let mut framer = Framer::new(frame_samples, channels, tx).with_input_rate(device_rate)?;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| framer.push(data),
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    let _ = err_tx.try_send(err.to_string());
                },
                None,
            )
            .map_err(|e| Error::Device(e.to_string()))?;

        stream.play().map_err(|e| Error::Device(e.to_string()))?;

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            device_rate,
            channels,
            "audio capture started"
        );

        Ok(Box::new(CpalFrameStream {
            _stream: stream,
            frames: rx,
            errors: err_rx,
        }))
    }
}

struct CpalFrameStream {
    _stream: Stream,
    frames: Receiver<Vec<i16>>,
    errors: Receiver<String>,
}

impl FrameStream for CpalFrameStream {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>> {
        if let Ok(err) = self.errors.try_recv() {
            return Err(Error::Device(err));
        }

        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Device("capture stream closed".to_string()))
            }
        }
    }
}

impl Drop for CpalFrameStream {
    fn drop(&mut self) {
        tracing::debug!("audio capture stopped");
    }
}

/// Downmixes interleaved callback buffers and cuts them into frames
///
/// Input at any rate other than [`SAMPLE_RATE`] is resampled on the way.
struct Framer {
    frame_samples: usize,
    channels: usize,
    pending: Vec<i16>,
    converter: Option<RateConverter>,
    tx: Sender<Vec<i16>>,
}

/// Streaming resampler state carried across callbacks
struct RateConverter {
    resampler: SincFixedIn<f32>,
    input: Vec<f32>,
}

impl Framer {
    fn new(frame_samples: usize, channels: usize, tx: Sender<Vec<i16>>) -> Self {
        Self {
            frame_samples,
            channels: channels.max(1),
            pending: Vec::with_capacity(frame_samples * 2),
            converter: None,
            tx,
        }
    }

    /// Resample from `rate` when the device cannot run at 16kHz
    fn with_input_rate(mut self, rate: u32) -> Result<Self> {
        if rate == SAMPLE_RATE {
            self.converter = None;
            return Ok(self);
        }
        // 10ms of device audio per resampler call
        let chunk = (rate / 100).max(1) as usize;
        let resampler = mono_resampler(rate, SAMPLE_RATE, chunk)
            .map_err(|e| Error::Device(format!("cannot resample {rate}Hz input: {e}")))?;
        self.converter = Some(RateConverter {
            resampler,
            input: Vec::with_capacity(chunk * 2),
        });
        Ok(self)
    }

    fn push(&mut self, data: &[f32]) {
        #[allow(clippy::cast_precision_loss)]
        let scale = self.channels as f32;
        let mono = data
            .chunks(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / scale);

        match &mut self.converter {
            Some(converter) => {
                converter.input.extend(mono);
                converter.drain_into(&mut self.pending);
            }
            None => self.pending.extend(mono.map(f32_to_i16)),
        }

        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let frame = std::mem::replace(&mut self.pending, rest);
            if self.tx.send(frame).is_err() {
                self.pending.clear();
                return;
            }
        }
    }
}

impl RateConverter {
    fn drain_into(&mut self, out: &mut Vec<i16>) {
        loop {
            let needed = self.resampler.input_frames_next();
            if self.input.len() < needed {
                return;
            }
            match self.resampler.process(&[&self.input[..needed]], None) {
                Ok(waves) => {
                    if let Some(wave) = waves.first() {
                        out.extend(wave.iter().copied().map(f32_to_i16));
                    }
                }
                Err(e) => tracing::warn!(error = %e, "capture resampling failed"),
            }
            self.input.drain(..needed);
        }
    }
}
