//! Reply playback and its terminal event.
//!
//! A `PlaybackSink` starts playing a decodable blob and hands back a `PlaybackMonitor`
//! that resolves to exactly one `PlaybackEvent`. The rodio sink plays on its own
//! thread because the output stream is not `Send` on every platform.

use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Terminal playback event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Ended,
    Error(String),
}

/// Sending half handed to the player; consuming it guarantees one event.
#[derive(Debug)]
pub struct PlaybackReporter {
    tx: oneshot::Sender<PlaybackEvent>,
}

impl PlaybackReporter {
    pub fn finish(self, event: PlaybackEvent) {
        // The session may have ended and dropped the monitor already.
        let _ = self.tx.send(event);
    }
}

/// Subscription to one playback's terminal event.
#[derive(Debug)]
pub struct PlaybackMonitor {
    rx: oneshot::Receiver<PlaybackEvent>,
}

impl PlaybackMonitor {
    pub fn channel() -> (PlaybackReporter, PlaybackMonitor) {
        let (tx, rx) = oneshot::channel();
        (PlaybackReporter { tx }, PlaybackMonitor { rx })
    }

    /// Wait for the terminal event. A player that vanishes counts as an error.
    pub async fn terminal_event(&mut self) -> PlaybackEvent {
        match (&mut self.rx).await {
            Ok(event) => event,
            Err(_) => PlaybackEvent::Error("playback sink dropped".to_string()),
        }
    }
}

/// Anything that can play a reply blob.
pub trait PlaybackSink {
    /// Start playing `audio`. Any previous playback is stopped first.
    fn start(&mut self, audio: Vec<u8>) -> VoiceResult<PlaybackMonitor>;
    /// Halt playback immediately. No-op when idle.
    fn stop(&mut self);
}

/// Playback on the default output device via rodio.
#[derive(Debug, Default)]
pub struct RodioPlayback {
    current: Option<Arc<AtomicBool>>,
}

impl RodioPlayback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlaybackSink for RodioPlayback {
    fn start(&mut self, audio: Vec<u8>) -> VoiceResult<PlaybackMonitor> {
        self.stop();
        if audio.is_empty() {
            return Err(VoiceError::Playback("empty reply audio".to_string()));
        }
        let source = rodio::Decoder::new(Cursor::new(audio))
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;

        let stop = Arc::new(AtomicBool::new(false));
        let (reporter, monitor) = PlaybackMonitor::channel();

        let stop_flag = Arc::clone(&stop);
        thread::Builder::new()
            .name("adaptive-playback".to_string())
            .spawn(move || {
                let event = match OutputStream::try_default() {
                    Ok((_stream, handle)) => match Sink::try_new(&handle) {
                        Ok(sink) => {
                            sink.append(source.convert_samples::<f32>());
                            while !sink.empty() {
                                if stop_flag.load(Ordering::Relaxed) {
                                    sink.stop();
                                    debug!("playback stopped early");
                                    break;
                                }
                                thread::sleep(Duration::from_millis(20));
                            }
                            PlaybackEvent::Ended
                        }
                        Err(e) => PlaybackEvent::Error(e.to_string()),
                    },
                    Err(e) => PlaybackEvent::Error(e.to_string()),
                };
                if let PlaybackEvent::Error(ref e) = event {
                    warn!("Playback failed: {}", e);
                }
                reporter.finish(event);
            })?;

        info!("🔊 Playing reply");
        self.current = Some(stop);
        Ok(monitor)
    }

    fn stop(&mut self) {
        if let Some(flag) = self.current.take() {
            flag.store(true, Ordering::Relaxed);
            info!("⏹️ Playback stopped");
        }
    }
}

impl Drop for RodioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}
