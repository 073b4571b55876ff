//! Microphone stream using CPAL.
//!
//! The cpal callback downmixes to mono and forwards chunks over an unbounded channel.
//! The session is the single consumer: every drain feeds both the analyser window
//! (for the VAD level) and the pending PCM buffer (for the capture controller).

use crate::analyser::{LevelSampler, SampleWindow, SpectrumAnalyser};
use crate::config::AnalyserConfig;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SizedSample, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{info, warn};

/// Source of mono PCM captured since the last drain.
pub trait PcmSource {
    fn drain_pcm(&mut self) -> VoiceResult<Vec<f32>>;
    fn sample_rate(&self) -> u32;
}

/// The live AudioStream owned by one session: level sampling plus raw PCM.
pub trait AudioInput: LevelSampler + PcmSource {
    /// Stop the stream and free the device. Idempotent.
    fn release(&mut self);
    fn is_released(&self) -> bool;
}

/// Cap on buffered PCM nobody drained (60s at 48kHz).
const MAX_PENDING_SAMPLES: usize = 48_000 * 60;

/// Default microphone as an `AudioInput`.
pub struct MicrophoneInput {
    stream: Option<Stream>,
    chunk_rx: mpsc::UnboundedReceiver<Vec<f32>>,
    closed: Arc<AtomicBool>,
    window: SampleWindow,
    analyser: SpectrumAnalyser,
    pending: Vec<f32>,
    sample_rate: u32,
}

impl MicrophoneInput {
    /// Open the default input device at its default config and start streaming.
    ///
    /// Fails when no device exists or access is refused; the session then stays Idle.
    pub fn open(analyser: &AnalyserConfig) -> VoiceResult<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

        info!(
            "🎤 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let supported = device.default_input_config()?;
        let sample_format = supported.sample_format();
        let stream_config: StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let stream = match sample_format {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &stream_config, chunk_tx, Arc::clone(&closed))?
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &stream_config, chunk_tx, Arc::clone(&closed))?
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, &stream_config, chunk_tx, Arc::clone(&closed))?
            }
            other => {
                return Err(VoiceError::AudioDevice(format!(
                    "Unsupported input sample format: {:?}",
                    other
                )))
            }
        };
        stream.play()?;

        info!(
            "✅ Microphone streaming ({}Hz, {} channels)",
            sample_rate, stream_config.channels
        );

        Ok(Self {
            stream: Some(stream),
            chunk_rx,
            closed,
            window: SampleWindow::new(analyser.fft_size),
            analyser: SpectrumAnalyser::new(analyser.clone()),
            pending: Vec::new(),
            sample_rate,
        })
    }

    /// Move everything the callback produced into the window and pending buffer.
    fn pump(&mut self) -> VoiceResult<()> {
        if self.stream.is_none() || self.closed.load(Ordering::Relaxed) {
            return Err(VoiceError::StreamClosed);
        }
        loop {
            match self.chunk_rx.try_recv() {
                Ok(chunk) => {
                    self.window.push_slice(&chunk);
                    self.pending.extend_from_slice(&chunk);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(VoiceError::StreamClosed),
            }
        }
        if self.pending.len() > MAX_PENDING_SAMPLES {
            let excess = self.pending.len() - MAX_PENDING_SAMPLES;
            self.pending.drain(..excess);
        }
        Ok(())
    }

    /// Names of the input devices on the default host. Unnamed devices are skipped.
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        Ok(cpal::default_host()
            .input_devices()?
            .filter_map(|device| device.name().ok())
            .collect())
    }
}

impl LevelSampler for MicrophoneInput {
    fn sample_level(&mut self) -> VoiceResult<f32> {
        self.pump()?;
        Ok(self.analyser.level(&self.window))
    }
}

impl PcmSource for MicrophoneInput {
    fn drain_pcm(&mut self) -> VoiceResult<Vec<f32>> {
        self.pump()?;
        Ok(std::mem::take(&mut self.pending))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioInput for MicrophoneInput {
    fn release(&mut self) {
        if self.stream.take().is_some() {
            self.chunk_rx.close();
            self.pending.clear();
            self.window.clear();
            self.analyser.reset();
            info!("⏹️ Microphone released");
        }
    }

    fn is_released(&self) -> bool {
        self.stream.is_none()
    }
}

impl Drop for MicrophoneInput {
    fn drop(&mut self) {
        self.release();
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    chunk_tx: mpsc::UnboundedSender<Vec<f32>>,
    closed: Arc<AtomicBool>,
) -> VoiceResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| {
                    frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                })
                .collect();
            // Receiver gone means the session released the stream.
            let _ = chunk_tx.send(mono);
        },
        move |err| {
            warn!("Audio stream error: {}", err);
            closed.store(true, Ordering::Relaxed);
        },
        None,
    )?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires audio hardware
    fn lists_named_input_devices() {
        let names = MicrophoneInput::list_input_devices().expect("enumerate input devices");
        assert!(names.iter().all(|n| !n.is_empty()));
    }
}
