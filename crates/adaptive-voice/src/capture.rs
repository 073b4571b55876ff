//! Audio capture controller: start/stop of discrete speech segments.
//!
//! While recording, PCM is drained from the shared stream once per slice interval so
//! even a very short utterance yields at least one chunk. Sealing concatenates the
//! chunks and encodes a 16-bit mono WAV ready for upload.

use crate::audio::PcmSource;
use crate::error::{VoiceError, VoiceResult};
use std::io::Cursor;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Declared encoding of a sealed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// RIFF/WAV, 16-bit signed PCM, mono.
    Wav16,
}

impl AudioEncoding {
    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioEncoding::Wav16 => "audio/wav",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            AudioEncoding::Wav16 => "recording.wav",
        }
    }
}

/// One sealed utterance, ready for the response service.
#[derive(Debug, Clone)]
pub struct SealedSegment {
    pub audio: Vec<u8>,
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub sample_count: usize,
    pub chunk_count: usize,
    /// Onset to the drop that ended speech.
    pub speech_duration: Duration,
}

impl SealedSegment {
    /// Length of the captured audio (includes the silence-confirmation tail).
    pub fn audio_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.sample_count as u64 * 1_000_000_000 / u64::from(self.sample_rate))
    }
}

#[derive(Debug)]
struct ActiveSegment {
    started_at: Instant,
    chunks: Vec<Vec<f32>>,
}

/// Owns the start/stop lifecycle of speech segments.
#[derive(Debug, Default)]
pub struct CaptureController {
    active: Option<ActiveSegment>,
}

impl CaptureController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Chunks buffered so far for the active segment.
    pub fn chunk_count(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.chunks.len())
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.active.as_ref().map(|a| a.started_at)
    }

    /// Open a new segment. Audio buffered before the onset is discarded.
    pub fn begin<S: PcmSource + ?Sized>(&mut self, input: &mut S, now: Instant) -> VoiceResult<()> {
        if self.active.is_some() {
            return Err(VoiceError::CaptureBusy);
        }
        let stale = input.drain_pcm()?;
        trace!(stale = stale.len(), "dropping pre-onset audio");
        self.active = Some(ActiveSegment {
            started_at: now,
            chunks: Vec::new(),
        });
        debug!("⏺️ Recording started");
        Ok(())
    }

    /// Slice-interval hook: buffer a chunk while recording, discard otherwise.
    pub fn slice<S: PcmSource + ?Sized>(&mut self, input: &mut S) -> VoiceResult<()> {
        let pcm = input.drain_pcm()?;
        if let Some(active) = self.active.as_mut() {
            if !pcm.is_empty() {
                active.chunks.push(pcm);
            }
        }
        Ok(())
    }

    /// Stop buffering and seal the segment. `NoAudio` if nothing was captured.
    pub fn end<S: PcmSource + ?Sized>(
        &mut self,
        input: &mut S,
        speech_duration: Duration,
    ) -> VoiceResult<SealedSegment> {
        let mut active = self.active.take().ok_or(VoiceError::NoAudio)?;

        // Flush the tail; a closed stream still lets us seal what we have.
        match input.drain_pcm() {
            Ok(tail) if !tail.is_empty() => active.chunks.push(tail),
            Ok(_) => {}
            Err(e) => debug!("no tail chunk: {}", e),
        }

        let chunk_count = active.chunks.len();
        let samples: Vec<f32> = active.chunks.concat();
        if samples.is_empty() {
            debug!("segment produced no audio, dropping");
            return Err(VoiceError::NoAudio);
        }

        let sample_rate = input.sample_rate();
        let audio = encode_wav(&samples, sample_rate)?;
        debug!(
            chunks = chunk_count,
            samples = samples.len(),
            bytes = audio.len(),
            "⏹️ Segment sealed"
        );

        Ok(SealedSegment {
            audio,
            encoding: AudioEncoding::Wav16,
            sample_rate,
            sample_count: samples.len(),
            chunk_count,
            speech_duration,
        })
    }

    /// Drop the active segment without sealing. Returns whether one was active.
    pub fn abort(&mut self) -> bool {
        let was_active = self.active.take().is_some();
        if was_active {
            debug!("Recording aborted");
        }
        was_active
    }
}

/// Encode mono f32 PCM to 16-bit WAV bytes.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut bytes = Vec::with_capacity(44 + samples.len() * 2);
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)?;
        for &s in samples {
            let clamped = s.clamp(-1.0, 1.0);
            writer.write_sample((clamped * i16::MAX as f32).round() as i16)?;
        }
        writer.finalize()?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out one queued buffer per drain.
    struct QueuedPcm {
        queue: VecDeque<Vec<f32>>,
        drains: usize,
    }

    impl QueuedPcm {
        fn new(bufs: Vec<Vec<f32>>) -> Self {
            Self {
                queue: bufs.into(),
                drains: 0,
            }
        }
    }

    impl PcmSource for QueuedPcm {
        fn drain_pcm(&mut self) -> VoiceResult<Vec<f32>> {
            self.drains += 1;
            Ok(self.queue.pop_front().unwrap_or_default())
        }

        fn sample_rate(&self) -> u32 {
            16_000
        }
    }

    #[test]
    fn begin_discards_stale_audio_and_rejects_second_begin() {
        let mut input = QueuedPcm::new(vec![vec![0.9; 100], vec![0.1; 10]]);
        let mut capture = CaptureController::new();
        capture.begin(&mut input, Instant::now()).unwrap();
        assert!(capture.is_recording());
        assert!(matches!(
            capture.begin(&mut input, Instant::now()),
            Err(VoiceError::CaptureBusy)
        ));

        capture.slice(&mut input).unwrap();
        let seg = capture.end(&mut input, Duration::from_millis(5)).unwrap();
        assert_eq!(seg.sample_count, 10, "stale 100 samples must not be in the segment");
        assert_eq!(seg.chunk_count, 1);
        assert!(!capture.is_recording());
    }

    #[test]
    fn short_utterance_still_yields_tail_chunk() {
        let mut input = QueuedPcm::new(vec![vec![], vec![0.2; 1600]]);
        let mut capture = CaptureController::new();
        capture.begin(&mut input, Instant::now()).unwrap();
        let seg = capture.end(&mut input, Duration::from_millis(100)).unwrap();
        assert_eq!(seg.chunk_count, 1);
        assert_eq!(seg.audio_duration(), Duration::from_millis(100));
    }

    #[test]
    fn zero_chunks_is_no_audio() {
        let mut input = QueuedPcm::new(vec![]);
        let mut capture = CaptureController::new();
        capture.begin(&mut input, Instant::now()).unwrap();
        capture.slice(&mut input).unwrap();
        assert!(matches!(
            capture.end(&mut input, Duration::ZERO),
            Err(VoiceError::NoAudio)
        ));
        assert!(!capture.is_recording());
    }

    #[test]
    fn end_without_segment_is_no_audio() {
        let mut input = QueuedPcm::new(vec![vec![0.5; 10]]);
        let mut capture = CaptureController::new();
        assert!(matches!(
            capture.end(&mut input, Duration::ZERO),
            Err(VoiceError::NoAudio)
        ));
    }

    #[test]
    fn idle_slices_discard_audio() {
        let mut input = QueuedPcm::new(vec![vec![0.5; 10], vec![0.5; 10]]);
        let mut capture = CaptureController::new();
        capture.slice(&mut input).unwrap();
        assert_eq!(input.drains, 1);
        assert_eq!(capture.chunk_count(), 0);
    }

    #[test]
    fn abort_drops_segment() {
        let mut input = QueuedPcm::new(vec![vec![], vec![0.5; 10]]);
        let mut capture = CaptureController::new();
        capture.begin(&mut input, Instant::now()).unwrap();
        capture.slice(&mut input).unwrap();
        assert!(capture.abort());
        assert!(!capture.abort());
        assert!(!capture.is_recording());
    }

    #[test]
    fn wav_is_decodable() {
        let samples: Vec<f32> = (0..160).map(|i| (i as f32 / 160.0) - 0.5).collect();
        let bytes = encode_wav(&samples, 16_000).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 160);
    }
}
