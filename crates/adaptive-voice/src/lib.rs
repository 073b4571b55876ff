//! # Adaptive Voice - continuous voice sessions with local turn-taking
//!
//! Decides from a live microphone stream when the user starts and stops speaking,
//! records one segment per utterance, hands it to a response service and plays the
//! reply, without ever listening to its own voice.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       VoiceSession (one task)                     │
//! │  ┌──────────────┐  level  ┌──────────────┐ signals ┌───────────┐ │
//! │  │ AudioInput   │───────→ │  VAD Monitor │───────→ │   Turn    │ │
//! │  │ (cpal + FFT) │         │ (peak / drop)│         │ Sequencer │ │
//! │  └──────────────┘         └──────────────┘         └───────────┘ │
//! │         │ pcm                                            │       │
//! │  ┌──────────────┐  segment  ┌──────────────┐  reply ┌──────────┐ │
//! │  │   Capture    │─────────→ │   Response   │──────→ │ Playback │ │
//! │  │  Controller  │           │   Service    │        │ (rodio)  │ │
//! │  └──────────────┘           └──────────────┘        └──────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod analyser;
pub mod audio;
pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod monitor;
pub mod playback;
pub mod sequencer;
pub mod session;

pub use analyser::{LevelSampler, SampleWindow, SpectrumAnalyser};
pub use audio::{AudioInput, MicrophoneInput, PcmSource};
pub use backend::{HttpVoiceBackend, ResponseService, SessionControl, VoiceReply};
pub use capture::{AudioEncoding, CaptureController, SealedSegment};
pub use config::{AnalyserConfig, BackendConfig, BackendSettings, CaptureConfig, VadThresholds, VoiceConfig};
pub use error::{VoiceError, VoiceResult};
pub use monitor::{MonitorDecision, Utterance, VoiceActivityMonitor};
pub use playback::{PlaybackEvent, PlaybackMonitor, PlaybackReporter, PlaybackSink, RodioPlayback};
pub use sequencer::{SessionState, Transition, TurnSequencer, TurnSignal};
pub use session::{ControlAction, SessionEvent, SessionHandle, UserNotice, VoiceSession};
