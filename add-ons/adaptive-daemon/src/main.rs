//! Adaptive voice daemon
//!
//! Opens the default microphone, initializes the voice backend and keeps a continuous
//! voice session running until CTRL-C. Transcriptions, replies and notices are
//! printed as they arrive.

use adaptive_voice::{
    HttpVoiceBackend, MicrophoneInput, RodioPlayback, SessionEvent, SessionState, VoiceConfig,
    VoiceSession,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[adaptive-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::env::args().any(|a| a == "--list-devices") {
        match MicrophoneInput::list_input_devices() {
            Ok(names) => names.iter().for_each(|n| println!("{}", n)),
            Err(e) => eprintln!("[adaptive-daemon] cannot list devices: {}", e),
        }
        return;
    }

    let config = match VoiceConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[adaptive-daemon] invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let backend = match HttpVoiceBackend::new(config.backend.base_url.clone(), config.response_timeout()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            eprintln!("[adaptive-daemon] cannot build backend client: {}", e);
            std::process::exit(2);
        }
    };

    tracing::info!(
        backend = %backend.base_url,
        onset = config.vad.onset_level,
        drop = config.vad.drop_delta,
        silence_ms = config.vad.silence_confirm_ms,
        "Adaptive voice daemon started"
    );

    let analyser = config.analyser.clone();
    let settings = config.backend.settings.clone();
    let (session, events) = VoiceSession::new(config, backend.clone(), Box::new(RodioPlayback::new()));
    let mut session = session.with_control(backend);

    tokio::spawn(print_events(events));

    if let Err(e) = session.start(|| MicrophoneInput::open(&analyser)) {
        tracing::error!(error = %e, "voice session could not start");
        std::process::exit(1);
    }

    let handle = session.handle();
    if let Err(e) = handle.initialize(settings) {
        tracing::warn!(error = %e, "initialize not sent");
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("CTRL-C received; ending voice session");
            let _ = handle.end();
        }
    });

    // The microphone stream is not Send on every platform, so the session stays on this task.
    session.run().await;
    tracing::info!("Adaptive voice daemon stopped");
}

async fn print_events(mut events: UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged { to: SessionState::Listening, .. } => println!("🎧 Listening..."),
            SessionEvent::StateChanged { to: SessionState::AwaitingResponse, .. } => {
                println!("⏳ Processing...")
            }
            SessionEvent::StateChanged { .. } => {}
            SessionEvent::SpeechStarted { .. } => println!("🗣️  Speaking..."),
            SessionEvent::UtteranceDiscarded { .. } | SessionEvent::SegmentSealed { .. } => {}
            SessionEvent::Reply { transcription, reply_text, is_fallback } => {
                let mark = if is_fallback { " (fallback)" } else { "" };
                println!("You: {}{}", transcription, mark);
                println!("AI:  {}", reply_text);
            }
            SessionEvent::Notice(notice) => println!("⚠️  {}", notice),
            SessionEvent::ControlResult { action, success } => {
                println!("{}: {}", action, if success { "ok" } else { "rejected" })
            }
            SessionEvent::Ended => {
                println!("Session ended");
                break;
            }
        }
    }
}
