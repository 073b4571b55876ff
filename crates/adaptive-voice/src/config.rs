//! Session configuration.
//!
//! The VAD thresholds are empirically tuned against browser-style analyser levels
//! (0–255 byte-frequency scale). They are exposed here so they can be re-tuned per
//! microphone without code edits.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | ADAPTIVE__VAD__ONSET_LEVEL | 35 | Level above which speech starts. |
//! | ADAPTIVE__VAD__DROP_DELTA | 20 | Drop from the utterance peak that suspects silence. |
//! | ADAPTIVE__VAD__SILENCE_CONFIRM_MS | 1500 | Delay before suspected silence ends the segment. |
//! | ADAPTIVE__VAD__MIN_UTTERANCE_MS | 300 | Shorter utterances are discarded as noise. |
//! | ADAPTIVE__TICK_MS | 16 | Monitor tick (~60 Hz). |
//! | ADAPTIVE__RESPONSE_TIMEOUT_MS | 30000 | Ceiling for one transcription + response round-trip. |
//! | ADAPTIVE__BACKEND__BASE_URL | http://localhost:8001 | Voice backend. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Voice activity thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadThresholds {
    /// Average level above which input counts as speech onset.
    pub onset_level: f32,
    /// Drop from the current utterance's peak that suspects silence.
    pub drop_delta: f32,
    /// How long suspected silence must hold before the segment ends.
    pub silence_confirm_ms: u64,
    /// Utterances shorter than this at the first drop are discarded.
    pub min_utterance_ms: u64,
}

impl Default for VadThresholds {
    fn default() -> Self {
        Self {
            onset_level: 35.0,
            drop_delta: 20.0,
            silence_confirm_ms: 1500,
            min_utterance_ms: 300,
        }
    }
}

impl VadThresholds {
    pub fn silence_confirm(&self) -> Duration {
        Duration::from_millis(self.silence_confirm_ms)
    }

    pub fn min_utterance(&self) -> Duration {
        Duration::from_millis(self.min_utterance_ms)
    }
}

/// Spectrum analyser settings (mirrors a browser analyser node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyserConfig {
    /// FFT size in samples; power of two.
    pub fft_size: usize,
    /// Time smoothing between ticks, 0.0 (none) up to but excluding 1.0.
    pub smoothing: f32,
    /// dB mapped to level 0.
    pub min_db: f32,
    /// dB mapped to level 255.
    pub max_db: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            smoothing: 0.8,
            min_db: -100.0,
            max_db: -30.0,
        }
    }
}

/// Capture controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Chunk slice interval while recording.
    pub slice_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { slice_ms: 100 }
    }
}

impl CaptureConfig {
    pub fn slice_interval(&self) -> Duration {
        Duration::from_millis(self.slice_ms)
    }
}

/// Payload for the backend's `initialize` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    pub stt_provider: String,
    pub tts_provider: String,
    pub ai_model: String,
    pub sample_rate: u32,
    pub chunk_duration: f32,
    pub voice_id: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            stt_provider: "whisper".to_string(),
            tts_provider: "pyttsx3".to_string(),
            ai_model: "local".to_string(),
            sample_rate: 16000,
            chunk_duration: 1.0,
            voice_id: "alloy".to_string(),
        }
    }
}

/// Where the voice backend lives and how to initialize it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default)]
    pub settings: BackendSettings,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            settings: BackendSettings::default(),
        }
    }
}

/// Full configuration of one voice session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub vad: VadThresholds,
    #[serde(default)]
    pub analyser: AnalyserConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Monitor tick interval.
    pub tick_ms: u64,
    /// Ceiling for the transcription + response call.
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            vad: VadThresholds::default(),
            analyser: AnalyserConfig::default(),
            capture: CaptureConfig::default(),
            tick_ms: 16,
            response_timeout_ms: 30_000,
            backend: BackendConfig::default(),
        }
    }
}

impl VoiceConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Load config from file and environment. Precedence: env `ADAPTIVE__*` >
    /// file at `ADAPTIVE_VOICE_CONFIG` (default `config/voice`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("ADAPTIVE_VOICE_CONFIG").unwrap_or_else(|_| "config/voice".to_string());
        let defaults = VoiceConfig::default();
        let builder = config::Config::builder()
            .set_default("vad.onset_level", defaults.vad.onset_level as f64)?
            .set_default("vad.drop_delta", defaults.vad.drop_delta as f64)?
            .set_default("vad.silence_confirm_ms", defaults.vad.silence_confirm_ms as i64)?
            .set_default("vad.min_utterance_ms", defaults.vad.min_utterance_ms as i64)?
            .set_default("analyser.fft_size", defaults.analyser.fft_size as i64)?
            .set_default("analyser.smoothing", defaults.analyser.smoothing as f64)?
            .set_default("analyser.min_db", defaults.analyser.min_db as f64)?
            .set_default("analyser.max_db", defaults.analyser.max_db as f64)?
            .set_default("capture.slice_ms", defaults.capture.slice_ms as i64)?
            .set_default("tick_ms", defaults.tick_ms as i64)?
            .set_default("response_timeout_ms", defaults.response_timeout_ms as i64)?
            .set_default("backend.base_url", defaults.backend.base_url.clone())?
            .set_default("backend.settings.stt_provider", defaults.backend.settings.stt_provider.clone())?
            .set_default("backend.settings.tts_provider", defaults.backend.settings.tts_provider.clone())?
            .set_default("backend.settings.ai_model", defaults.backend.settings.ai_model.clone())?
            .set_default("backend.settings.sample_rate", defaults.backend.settings.sample_rate as i64)?
            .set_default("backend.settings.chunk_duration", defaults.backend.settings.chunk_duration as f64)?
            .set_default("backend.settings.voice_id", defaults.backend.settings.voice_id.clone())?;

        let path = Path::new(&config_path);
        let with_ext = path.with_extension("toml");
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else if with_ext.exists() {
            builder.add_source(config::File::from(with_ext.as_path()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("ADAPTIVE").separator("__"))
            .build()?;

        let config: VoiceConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the monitor cannot work with.
    pub fn validate(&self) -> VoiceResult<()> {
        if !(self.vad.onset_level.is_finite() && self.vad.onset_level > 0.0) {
            return Err(VoiceError::Config(format!(
                "vad.onset_level must be positive, got {}",
                self.vad.onset_level
            )));
        }
        if !(self.vad.drop_delta.is_finite() && self.vad.drop_delta > 0.0) {
            return Err(VoiceError::Config(format!(
                "vad.drop_delta must be positive, got {}",
                self.vad.drop_delta
            )));
        }
        if self.vad.silence_confirm_ms == 0 {
            return Err(VoiceError::Config("vad.silence_confirm_ms must be > 0".to_string()));
        }
        if self.tick_ms == 0 || self.capture.slice_ms == 0 || self.response_timeout_ms == 0 {
            return Err(VoiceError::Config(
                "tick_ms, capture.slice_ms and response_timeout_ms must be > 0".to_string(),
            ));
        }
        let fft = self.analyser.fft_size;
        if !fft.is_power_of_two() || !(32..=32768).contains(&fft) {
            return Err(VoiceError::Config(format!(
                "analyser.fft_size must be a power of two in 32..=32768, got {}",
                fft
            )));
        }
        if !(0.0..1.0).contains(&self.analyser.smoothing) {
            return Err(VoiceError::Config(format!(
                "analyser.smoothing must be in [0, 1), got {}",
                self.analyser.smoothing
            )));
        }
        if self.analyser.min_db >= self.analyser.max_db {
            return Err(VoiceError::Config(format!(
                "analyser.min_db ({}) must be below analyser.max_db ({})",
                self.analyser.min_db, self.analyser.max_db
            )));
        }
        Ok(())
    }
}
