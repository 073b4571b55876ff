//! Turn sequencing for the continuous voice session.
//!
//! Serializes the listening / speaking / response / playback phases:
//!
//! ```text
//! Idle → Listening → UserSpeaking → Recording → AwaitingResponse → PlayingResponse
//!            ↑            │ (blip)       │ (no audio)   │ (no audio / error / timeout)
//!            └────────────┴──────────────┴──────────────┴──────────── Listening
//! ```
//!
//! `EndSession` returns to `Idle` from any state. The sequencer is the only writer of
//! `SessionState`; everything else reads it for guard checks.

use crate::error::{VoiceError, VoiceResult};
use std::fmt;
use tracing::{debug, info};

/// Phase of one voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Listening,
    UserSpeaking,
    Recording,
    AwaitingResponse,
    PlayingResponse,
}

impl SessionState {
    /// Onset detection is only live while listening.
    pub fn onset_enabled(self) -> bool {
        self == SessionState::Listening
    }

    /// The monitor may advance capture logic only while listening or speaking.
    pub fn monitoring_enabled(self) -> bool {
        matches!(self, SessionState::Listening | SessionState::UserSpeaking)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::UserSpeaking => "user_speaking",
            SessionState::Recording => "recording",
            SessionState::AwaitingResponse => "awaiting_response",
            SessionState::PlayingResponse => "playing_response",
        };
        f.write_str(s)
    }
}

/// Inputs that drive the sequencer. One per row of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSignal {
    /// Microphone opened (permission granted).
    StartSession,
    /// Level crossed the onset threshold.
    SpeechOnset,
    /// Silence arrived before the minimum utterance duration.
    UtteranceDiscarded,
    /// Pending silence timer fired for a long-enough utterance.
    SilenceConfirmed,
    /// Segment sealed and handed to the response service.
    SegmentSent,
    /// Sealing produced nothing.
    CaptureFailed,
    /// Response arrived; `with_audio` decides whether playback follows.
    ResponseReceived { with_audio: bool },
    /// Response call failed or timed out.
    ResponseFailed,
    /// Playback emitted its terminal event (ended or error).
    PlaybackFinished,
    /// Explicit session end, or the stream went away.
    EndSession,
}

impl fmt::Display for TurnSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnSignal::StartSession => f.write_str("start_session"),
            TurnSignal::SpeechOnset => f.write_str("speech_onset"),
            TurnSignal::UtteranceDiscarded => f.write_str("utterance_discarded"),
            TurnSignal::SilenceConfirmed => f.write_str("silence_confirmed"),
            TurnSignal::SegmentSent => f.write_str("segment_sent"),
            TurnSignal::CaptureFailed => f.write_str("capture_failed"),
            TurnSignal::ResponseReceived { with_audio } => {
                write!(f, "response_received(with_audio={})", with_audio)
            }
            TurnSignal::ResponseFailed => f.write_str("response_failed"),
            TurnSignal::PlaybackFinished => f.write_str("playback_finished"),
            TurnSignal::EndSession => f.write_str("end_session"),
        }
    }
}

/// Accepted state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub signal: TurnSignal,
}

/// The state machine gating listening, recording, response and playback.
#[derive(Debug)]
pub struct TurnSequencer {
    state: SessionState,
}

impl Default for TurnSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnSequencer {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply a signal. Rejects signals whose guard does not hold in the current state.
    pub fn apply(&mut self, signal: TurnSignal) -> VoiceResult<Transition> {
        use SessionState::*;

        let from = self.state;
        let to = match (from, signal) {
            (_, TurnSignal::EndSession) => Idle,
            (Idle, TurnSignal::StartSession) => Listening,
            (Listening, TurnSignal::SpeechOnset) => UserSpeaking,
            (UserSpeaking, TurnSignal::UtteranceDiscarded) => Listening,
            (UserSpeaking, TurnSignal::SilenceConfirmed) => Recording,
            (Recording, TurnSignal::SegmentSent) => AwaitingResponse,
            (Recording, TurnSignal::CaptureFailed) => Listening,
            (AwaitingResponse, TurnSignal::ResponseReceived { with_audio: true }) => PlayingResponse,
            (AwaitingResponse, TurnSignal::ResponseReceived { with_audio: false }) => Listening,
            (AwaitingResponse, TurnSignal::ResponseFailed) => Listening,
            (PlayingResponse, TurnSignal::PlaybackFinished) => Listening,
            _ => return Err(VoiceError::InvalidTransition { from, signal }),
        };

        self.state = to;
        match to {
            Idle | UserSpeaking => info!("🔁 {} → {} ({})", from, to, signal),
            _ => debug!("{} → {} ({})", from, to, signal),
        }

        Ok(Transition { from, to, signal })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(state: SessionState) -> TurnSequencer {
        TurnSequencer { state }
    }

    #[test]
    fn full_turn_loops_back_to_listening() {
        let mut seq = TurnSequencer::new();
        let steps = [
            (TurnSignal::StartSession, SessionState::Listening),
            (TurnSignal::SpeechOnset, SessionState::UserSpeaking),
            (TurnSignal::SilenceConfirmed, SessionState::Recording),
            (TurnSignal::SegmentSent, SessionState::AwaitingResponse),
            (
                TurnSignal::ResponseReceived { with_audio: true },
                SessionState::PlayingResponse,
            ),
            (TurnSignal::PlaybackFinished, SessionState::Listening),
        ];
        for (signal, expected) in steps {
            let t = seq.apply(signal).unwrap();
            assert_eq!(t.to, expected);
            assert_eq!(seq.state(), expected);
        }
    }

    #[test]
    fn failures_return_to_listening() {
        let mut seq = at(SessionState::UserSpeaking);
        assert_eq!(seq.apply(TurnSignal::UtteranceDiscarded).unwrap().to, SessionState::Listening);

        let mut seq = at(SessionState::Recording);
        assert_eq!(seq.apply(TurnSignal::CaptureFailed).unwrap().to, SessionState::Listening);

        let mut seq = at(SessionState::AwaitingResponse);
        assert_eq!(seq.apply(TurnSignal::ResponseFailed).unwrap().to, SessionState::Listening);

        let mut seq = at(SessionState::AwaitingResponse);
        let t = seq.apply(TurnSignal::ResponseReceived { with_audio: false }).unwrap();
        assert_eq!(t.to, SessionState::Listening);
    }

    #[test]
    fn onset_rejected_outside_listening() {
        for state in [
            SessionState::Idle,
            SessionState::UserSpeaking,
            SessionState::Recording,
            SessionState::AwaitingResponse,
            SessionState::PlayingResponse,
        ] {
            let mut seq = at(state);
            let err = seq.apply(TurnSignal::SpeechOnset).unwrap_err();
            assert!(matches!(err, VoiceError::InvalidTransition { .. }));
            assert_eq!(seq.state(), state, "rejected signal must not move the state");
        }
    }

    #[test]
    fn end_session_from_every_state() {
        for state in [
            SessionState::Idle,
            SessionState::Listening,
            SessionState::UserSpeaking,
            SessionState::Recording,
            SessionState::AwaitingResponse,
            SessionState::PlayingResponse,
        ] {
            let mut seq = at(state);
            assert_eq!(seq.apply(TurnSignal::EndSession).unwrap().to, SessionState::Idle);
        }
    }

    #[test]
    fn gating_helpers() {
        assert!(SessionState::Listening.onset_enabled());
        assert!(!SessionState::UserSpeaking.onset_enabled());
        assert!(SessionState::UserSpeaking.monitoring_enabled());
        for gated in [
            SessionState::Idle,
            SessionState::Recording,
            SessionState::AwaitingResponse,
            SessionState::PlayingResponse,
        ] {
            assert!(!gated.monitoring_enabled(), "{}", gated);
            assert!(!gated.onset_enabled(), "{}", gated);
        }
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut seq = TurnSequencer::new();
        seq.apply(TurnSignal::StartSession).unwrap();
        assert!(seq.apply(TurnSignal::StartSession).is_err());
    }
}
