//! Voice activity monitor: decides from per-tick levels when speech starts and ends.
//!
//! Silence is detected as a *relative* drop from the loudest level of the current
//! utterance, not as an absolute floor, so the same thresholds work for loud and quiet
//! rooms. A drop arms a single pending silence timer; if the level recovers before it
//! fires the timer is cancelled, otherwise the utterance ends.

use crate::config::VadThresholds;
use crate::sequencer::SessionState;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Loudest level seen since the current utterance started.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeakTracker {
    peak: Option<f32>,
}

impl PeakTracker {
    pub fn start(&mut self, level: f32) {
        self.peak = Some(level);
    }

    /// Fold in a level and return the drop from the running peak.
    pub fn observe(&mut self, level: f32) -> f32 {
        let peak = self.peak.map_or(level, |p| p.max(level));
        self.peak = Some(peak);
        peak - level
    }

    pub fn peak(&self) -> Option<f32> {
        self.peak
    }

    pub fn reset(&mut self) {
        self.peak = None;
    }
}

/// At most one outstanding "confirm silence" deadline per utterance.
#[derive(Debug, Clone, Copy)]
pub struct PendingSilenceTimer {
    pub deadline: Instant,
    /// When the level first dropped; the utterance is measured up to here.
    pub dropped_at: Instant,
}

/// What one tick decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorDecision {
    /// State is not Listening/UserSpeaking; the level was sampled but ignored.
    Gated,
    /// Listening, level below onset.
    Quiet,
    /// Speech started; begin recording.
    Onset,
    /// Speaking, no silence suspected.
    Speaking,
    /// A drop armed the silence timer.
    SilenceSuspected { deadline: Instant },
    /// The level recovered; the pending timer was cancelled.
    VoiceResumed,
    /// Dropped before the minimum duration; discard the capture.
    Blip { duration: Duration },
}

/// A finished utterance, produced when the silence timer fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Utterance {
    pub started_at: Instant,
    /// From onset to the drop that armed the confirming timer.
    pub speech_duration: Duration,
    pub peak_level: f32,
}

/// The per-tick VAD decision logic.
#[derive(Debug)]
pub struct VoiceActivityMonitor {
    thresholds: VadThresholds,
    peak: PeakTracker,
    started_at: Option<Instant>,
    timer: Option<PendingSilenceTimer>,
}

impl VoiceActivityMonitor {
    pub fn new(thresholds: VadThresholds) -> Self {
        Self {
            thresholds,
            peak: PeakTracker::default(),
            started_at: None,
            timer: None,
        }
    }

    pub fn thresholds(&self) -> &VadThresholds {
        &self.thresholds
    }

    /// Deadline of the pending silence timer, if armed.
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.timer.map(|t| t.deadline)
    }

    pub fn has_pending_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn peak_level(&self) -> Option<f32> {
        self.peak.peak()
    }

    pub fn utterance_started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Classify one level sample. `state` is read, never written.
    pub fn observe(&mut self, level: f32, now: Instant, state: SessionState) -> MonitorDecision {
        if !state.monitoring_enabled() {
            return MonitorDecision::Gated;
        }
        if !level.is_finite() {
            trace!("ignoring non-finite level");
            return if state.onset_enabled() {
                MonitorDecision::Quiet
            } else {
                MonitorDecision::Speaking
            };
        }

        if !state.onset_enabled() {
            return self.observe_speaking(level, now);
        }
        if level > self.thresholds.onset_level {
            self.timer = None;
            self.started_at = Some(now);
            self.peak.start(level);
            debug!(level, "speech onset");
            MonitorDecision::Onset
        } else {
            MonitorDecision::Quiet
        }
    }

    fn observe_speaking(&mut self, level: f32, now: Instant) -> MonitorDecision {
        // Speaking without a recorded onset means the state moved underneath us.
        let started_at = match self.started_at {
            Some(t) => t,
            None => {
                self.started_at = Some(now);
                self.peak.start(level);
                return MonitorDecision::Speaking;
            }
        };

        let drop = self.peak.observe(level);
        if drop > self.thresholds.drop_delta {
            let elapsed = now.saturating_duration_since(started_at);
            if elapsed < self.thresholds.min_utterance() {
                debug!(?elapsed, "utterance too short, discarding");
                self.reset();
                return MonitorDecision::Blip { duration: elapsed };
            }
            if self.timer.is_none() {
                let deadline = now + self.thresholds.silence_confirm();
                self.timer = Some(PendingSilenceTimer {
                    deadline,
                    dropped_at: now,
                });
                trace!(drop, "silence suspected");
                return MonitorDecision::SilenceSuspected { deadline };
            }
            MonitorDecision::Speaking
        } else if self.timer.take().is_some() {
            trace!(drop, "voice resumed");
            MonitorDecision::VoiceResumed
        } else {
            MonitorDecision::Speaking
        }
    }

    /// Consume the pending timer if it is due. Fires at most once per arming.
    pub fn confirm_silence(&mut self, now: Instant) -> Option<Utterance> {
        let timer = self.timer?;
        if now < timer.deadline {
            return None;
        }
        let started_at = self.started_at?;
        let utterance = Utterance {
            started_at,
            speech_duration: timer.dropped_at.saturating_duration_since(started_at),
            peak_level: self.peak.peak().unwrap_or(0.0),
        };
        self.reset();
        Some(utterance)
    }

    /// Cancel the pending timer and clear the peak and timestamps.
    pub fn reset(&mut self) {
        self.timer = None;
        self.started_at = None;
        self.peak.reset();
    }
}
