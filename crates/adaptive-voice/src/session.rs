//! The continuous voice session: one cooperative task driving the whole turn loop.
//!
//! `run()` multiplexes, with `tokio::select!`, the VAD tick, the capture slice
//! interval, the pending silence deadline, the in-flight response call, the playback
//! monitor and external commands. Every branch runs to completion before the next
//! one is polled, so the sequencer, monitor and capture controller are plain owned
//! values with no locking.
//!
//! The session owns its `AudioInput`. Nothing else reads or mutates it.

use crate::audio::AudioInput;
use crate::backend::{ResponseService, SessionControl, VoiceReply};
use crate::capture::CaptureController;
use crate::config::{BackendSettings, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::monitor::{MonitorDecision, VoiceActivityMonitor};
use crate::playback::{PlaybackEvent, PlaybackMonitor, PlaybackSink};
use crate::sequencer::{SessionState, TurnSequencer, TurnSignal};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::{pending, Future};
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::error::Elapsed;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// User-visible problems. None of them end the session.
#[derive(Debug, Clone, PartialEq)]
pub enum UserNotice {
    NoAudioCaptured,
    ResponseTimeout(Duration),
    ResponseFailed(String),
    PlaybackFailed(String),
    MicrophoneUnavailable(String),
    ControlFailed { action: ControlAction, reason: String },
    /// The backend could not transcribe and answered with a canned reply.
    FallbackTranscription,
}

impl fmt::Display for UserNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserNotice::NoAudioCaptured => write!(f, "No audio captured, please try again"),
            UserNotice::ResponseTimeout(after) => {
                write!(f, "Request timed out after {}s", after.as_secs())
            }
            UserNotice::ResponseFailed(e) => write!(f, "Voice processing failed: {}", e),
            UserNotice::PlaybackFailed(e) => write!(f, "Could not play the reply: {}", e),
            UserNotice::MicrophoneUnavailable(e) => {
                write!(f, "Could not access microphone: {}", e)
            }
            UserNotice::ControlFailed { action, reason } => {
                write!(f, "{} failed: {}", action, reason)
            }
            UserNotice::FallbackTranscription => {
                write!(f, "Speech was not recognized clearly, try speaking louder")
            }
        }
    }
}

/// Administrative call kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Initialize,
    ClearConversation,
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAction::Initialize => write!(f, "Initialize"),
            ControlAction::ClearConversation => write!(f, "Clear conversation"),
        }
    }
}

/// Everything observable about a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    SpeechStarted {
        level: f32,
        at: DateTime<Utc>,
    },
    UtteranceDiscarded {
        duration: Duration,
    },
    SegmentSealed {
        speech_duration: Duration,
        audio_duration: Duration,
        bytes: usize,
        at: DateTime<Utc>,
    },
    Reply {
        transcription: String,
        reply_text: String,
        is_fallback: bool,
    },
    Notice(UserNotice),
    ControlResult {
        action: ControlAction,
        success: bool,
    },
    Ended,
}

#[derive(Debug)]
enum SessionCommand {
    End,
    Initialize(BackendSettings),
    ClearConversation,
}

/// Cloneable remote for a session running elsewhere.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Ask the running session to end. Safe to call in any state and more than once;
    /// requests made while Idle are dropped by the next `start`.
    pub fn end(&self) -> VoiceResult<()> {
        self.send(SessionCommand::End)
    }

    pub fn initialize(&self, settings: BackendSettings) -> VoiceResult<()> {
        self.send(SessionCommand::Initialize(settings))
    }

    pub fn clear_conversation(&self) -> VoiceResult<()> {
        self.send(SessionCommand::ClearConversation)
    }

    fn send(&self, cmd: SessionCommand) -> VoiceResult<()> {
        self.tx
            .send(cmd)
            .map_err(|e| VoiceError::ChannelSend(format!("session is gone: {:?}", e.0)))
    }
}

type ResponseFuture = Pin<Box<dyn Future<Output = Result<VoiceResult<VoiceReply>, Elapsed>> + Send>>;

/// One continuous voice session.
pub struct VoiceSession {
    config: VoiceConfig,
    sequencer: TurnSequencer,
    monitor: VoiceActivityMonitor,
    capture: CaptureController,
    input: Option<Box<dyn AudioInput>>,
    responder: Arc<dyn ResponseService>,
    control: Option<Arc<dyn SessionControl>>,
    player: Box<dyn PlaybackSink>,
    in_flight: Option<ResponseFuture>,
    playback: Option<PlaybackMonitor>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
}

impl VoiceSession {
    pub fn new(
        config: VoiceConfig,
        responder: Arc<dyn ResponseService>,
        player: Box<dyn PlaybackSink>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = Self {
            monitor: VoiceActivityMonitor::new(config.vad.clone()),
            config,
            sequencer: TurnSequencer::new(),
            capture: CaptureController::new(),
            input: None,
            responder,
            control: None,
            player,
            in_flight: None,
            playback: None,
            events,
            cmd_tx,
            cmd_rx,
        };
        (session, events_rx)
    }

    /// Attach the administrative API used by `initialize` / `clear_conversation`.
    pub fn with_control(mut self, control: Arc<dyn SessionControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.sequencer.state()
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    pub fn has_pending_timer(&self) -> bool {
        self.monitor.has_pending_timer()
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn is_awaiting_response(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Open the microphone and enter Listening.
    ///
    /// The config is validated first. When `open` fails the session stays Idle and a
    /// `MicrophoneUnavailable` notice is published; the caller may retry.
    pub fn start<I, F>(&mut self, open: F) -> VoiceResult<()>
    where
        I: AudioInput + 'static,
        F: FnOnce() -> VoiceResult<I>,
    {
        let from = self.sequencer.state();
        if from != SessionState::Idle {
            return Err(VoiceError::InvalidTransition {
                from,
                signal: TurnSignal::StartSession,
            });
        }
        if let Err(e) = self.config.validate() {
            warn!("Refusing to start: {}", e);
            return Err(e);
        }
        self.drop_stale_end_requests();

        match open() {
            Ok(input) => {
                self.input = Some(Box::new(input));
                self.monitor.reset();
                self.transition(TurnSignal::StartSession)?;
                info!("🎙️ Voice session started");
                Ok(())
            }
            Err(e) => {
                warn!("Could not access microphone: {}", e);
                self.notify(UserNotice::MicrophoneUnavailable(e.to_string()));
                Err(e)
            }
        }
    }

    /// `End` requests queued while Idle belong to a session that is already over.
    fn drop_stale_end_requests(&mut self) {
        let mut kept = Vec::new();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                SessionCommand::End => debug!("dropping end request left over from an idle session"),
                other => kept.push(other),
            }
        }
        for cmd in kept {
            let _ = self.cmd_tx.send(cmd);
        }
    }

    /// Drive the session until it ends. Returns immediately if it was never started.
    pub async fn run(&mut self) {
        if self.sequencer.state() == SessionState::Idle {
            warn!("run() called on an idle session");
            return;
        }

        let mut tick = interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut slice = interval(self.config.capture.slice_interval());
        slice.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.monitor.silence_deadline();

            let flow = tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => self.on_command(cmd),
                event = next_playback_event(&mut self.playback) => {
                    self.on_playback_event(event);
                    ControlFlow::Continue(())
                }
                result = next_response(&mut self.in_flight) => {
                    self.on_response(result);
                    ControlFlow::Continue(())
                }
                _ = sleep_until_deadline(deadline) => {
                    self.on_silence_deadline(Instant::now());
                    ControlFlow::Continue(())
                }
                _ = tick.tick() => self.on_tick(Instant::now()),
                _ = slice.tick() => self.on_slice(),
            };

            if flow.is_break() {
                self.end_session();
                break;
            }
        }
    }

    fn on_command(&mut self, cmd: Option<SessionCommand>) -> ControlFlow<()> {
        match cmd {
            // The session holds a sender itself, so `None` cannot happen while running.
            Some(SessionCommand::End) | None => {
                info!("Session end requested");
                return ControlFlow::Break(());
            }
            Some(SessionCommand::Initialize(settings)) => {
                self.spawn_control(ControlAction::Initialize, Some(settings))
            }
            Some(SessionCommand::ClearConversation) => {
                self.spawn_control(ControlAction::ClearConversation, None)
            }
        }
        ControlFlow::Continue(())
    }

    fn on_tick(&mut self, now: Instant) -> ControlFlow<()> {
        let Some(input) = self.input.as_mut() else {
            return ControlFlow::Break(());
        };
        let level = match input.sample_level() {
            Ok(level) => level,
            Err(VoiceError::StreamClosed) => {
                info!("Audio stream closed, ending session");
                return ControlFlow::Break(());
            }
            Err(e) => {
                debug!("skipping tick: {}", e);
                return ControlFlow::Continue(());
            }
        };

        match self.monitor.observe(level, now, self.sequencer.state()) {
            MonitorDecision::Onset => self.on_onset(level, now),
            MonitorDecision::Blip { duration } => {
                self.on_blip(duration);
                ControlFlow::Continue(())
            }
            MonitorDecision::SilenceSuspected { deadline } => {
                trace!(in_ms = deadline.saturating_duration_since(now).as_millis() as u64, "silence timer armed");
                ControlFlow::Continue(())
            }
            MonitorDecision::Gated
            | MonitorDecision::Quiet
            | MonitorDecision::Speaking
            | MonitorDecision::VoiceResumed => ControlFlow::Continue(()),
        }
    }

    fn on_onset(&mut self, level: f32, now: Instant) -> ControlFlow<()> {
        if self.transition(TurnSignal::SpeechOnset).is_err() {
            self.monitor.reset();
            return ControlFlow::Continue(());
        }

        let begun = match self.input.as_mut() {
            Some(input) => self.capture.begin(&mut **input, now),
            None => Err(VoiceError::StreamClosed),
        };
        match begun {
            Ok(()) => {
                self.emit(SessionEvent::SpeechStarted {
                    level,
                    at: Utc::now(),
                });
                ControlFlow::Continue(())
            }
            Err(VoiceError::StreamClosed) => ControlFlow::Break(()),
            Err(e) => {
                warn!("Could not start recording: {}", e);
                self.monitor.reset();
                let _ = self.transition(TurnSignal::UtteranceDiscarded);
                ControlFlow::Continue(())
            }
        }
    }

    fn on_blip(&mut self, duration: Duration) {
        self.capture.abort();
        if self.transition(TurnSignal::UtteranceDiscarded).is_ok() {
            self.emit(SessionEvent::UtteranceDiscarded { duration });
        }
    }

    fn on_slice(&mut self) -> ControlFlow<()> {
        let Some(input) = self.input.as_mut() else {
            return ControlFlow::Continue(());
        };
        match self.capture.slice(&mut **input) {
            Ok(()) => ControlFlow::Continue(()),
            Err(VoiceError::StreamClosed) => {
                info!("Audio stream closed, ending session");
                ControlFlow::Break(())
            }
            Err(e) => {
                debug!("skipping slice: {}", e);
                ControlFlow::Continue(())
            }
        }
    }

    fn on_silence_deadline(&mut self, now: Instant) {
        let Some(utterance) = self.monitor.confirm_silence(now) else {
            return;
        };
        if self.transition(TurnSignal::SilenceConfirmed).is_err() {
            self.capture.abort();
            return;
        }

        let sealed = match self.input.as_mut() {
            Some(input) => self.capture.end(&mut **input, utterance.speech_duration),
            None => Err(VoiceError::NoAudio),
        };
        let segment = match sealed {
            Ok(segment) => segment,
            Err(e) => {
                warn!("No audio captured: {}", e);
                self.notify(UserNotice::NoAudioCaptured);
                let _ = self.transition(TurnSignal::CaptureFailed);
                return;
            }
        };

        info!(
            speech_ms = utterance.speech_duration.as_millis() as u64,
            peak = utterance.peak_level,
            "📤 Sending segment"
        );
        self.emit(SessionEvent::SegmentSealed {
            speech_duration: segment.speech_duration,
            audio_duration: segment.audio_duration(),
            bytes: segment.audio.len(),
            at: Utc::now(),
        });
        if self.transition(TurnSignal::SegmentSent).is_err() {
            return;
        }

        let responder = Arc::clone(&self.responder);
        let ceiling = self.config.response_timeout();
        self.in_flight = Some(Box::pin(tokio::time::timeout(ceiling, async move {
            responder.respond(segment).await
        })));
    }

    fn on_response(&mut self, result: Result<VoiceResult<VoiceReply>, Elapsed>) {
        self.in_flight = None;
        // Whatever happened during the wait, the next utterance starts clean.
        self.monitor.reset();

        let reply = match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!("Voice processing failed: {}", e);
                self.notify(UserNotice::ResponseFailed(e.to_string()));
                let _ = self.transition(TurnSignal::ResponseFailed);
                return;
            }
            Err(_) => {
                let after = self.config.response_timeout();
                warn!("⏱️ {}", VoiceError::Timeout(after));
                self.notify(UserNotice::ResponseTimeout(after));
                let _ = self.transition(TurnSignal::ResponseFailed);
                return;
            }
        };

        info!("💬 \"{}\" → \"{}\"", reply.transcription, reply.reply_text);
        self.emit(SessionEvent::Reply {
            transcription: reply.transcription.clone(),
            reply_text: reply.reply_text.clone(),
            is_fallback: reply.is_fallback,
        });
        if reply.is_fallback {
            self.notify(UserNotice::FallbackTranscription);
        }

        let with_audio = match reply.reply_audio {
            Some(audio) if !audio.is_empty() => match self.player.start(audio) {
                Ok(monitor) => {
                    self.playback = Some(monitor);
                    true
                }
                Err(e) => {
                    warn!("Playback failed: {}", e);
                    self.notify(UserNotice::PlaybackFailed(e.to_string()));
                    false
                }
            },
            _ => false,
        };
        let _ = self.transition(TurnSignal::ResponseReceived { with_audio });
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) {
        self.playback = None;
        self.monitor.reset();
        if let PlaybackEvent::Error(e) = event {
            self.notify(UserNotice::PlaybackFailed(e));
        }
        let _ = self.transition(TurnSignal::PlaybackFinished);
    }

    /// Tear everything down regardless of the current phase.
    fn end_session(&mut self) {
        self.monitor.reset();
        if self.capture.abort() {
            debug!("discarded unfinished recording");
        }
        if self.in_flight.take().is_some() {
            debug!("dropped in-flight response");
        }
        self.playback = None;
        self.player.stop();
        if let Some(mut input) = self.input.take() {
            input.release();
        }

        let _ = self.transition(TurnSignal::EndSession);
        info!("👋 Voice session ended");
        self.emit(SessionEvent::Ended);
    }

    fn spawn_control(&self, action: ControlAction, settings: Option<BackendSettings>) {
        let Some(control) = self.control.clone() else {
            self.notify(UserNotice::ControlFailed {
                action,
                reason: "no session control configured".to_string(),
            });
            return;
        };
        let events = self.events.clone();
        let settings = settings.unwrap_or_else(|| self.config.backend.settings.clone());

        tokio::spawn(async move {
            let outcome = match action {
                ControlAction::Initialize => control.initialize(&settings).await,
                ControlAction::ClearConversation => control.clear().await,
            };
            let event = match outcome {
                Ok(success) => {
                    info!("{} → {}", action, if success { "ok" } else { "rejected" });
                    SessionEvent::ControlResult { action, success }
                }
                Err(e) => {
                    warn!("{} failed: {}", action, e);
                    SessionEvent::Notice(UserNotice::ControlFailed {
                        action,
                        reason: e.to_string(),
                    })
                }
            };
            let _ = events.send(event);
        });
    }

    fn transition(&mut self, signal: TurnSignal) -> VoiceResult<()> {
        match self.sequencer.apply(signal) {
            Ok(t) => {
                self.emit(SessionEvent::StateChanged {
                    from: t.from,
                    to: t.to,
                });
                Ok(())
            }
            Err(e) => {
                warn!("{}", e);
                Err(e)
            }
        }
    }

    fn notify(&self, notice: UserNotice) {
        self.emit(SessionEvent::Notice(notice));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("no event subscriber");
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if self.sequencer.state() != SessionState::Idle {
            self.end_session();
        }
    }
}

async fn next_response(slot: &mut Option<ResponseFuture>) -> Result<VoiceResult<VoiceReply>, Elapsed> {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_playback_event(slot: &mut Option<PlaybackMonitor>) -> PlaybackEvent {
    match slot.as_mut() {
        Some(monitor) => monitor.terminal_event().await,
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
