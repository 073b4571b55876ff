//! External collaborators of the voice session.
//!
//! `ResponseService` turns one sealed segment into transcription + reply (+ optional
//! synthesized audio). `SessionControl` covers the administrative initialize/clear
//! calls. `HttpVoiceBackend` implements both against the voice backend's HTTP API.

use crate::capture::SealedSegment;
use crate::config::BackendSettings;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Reply to one utterance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceReply {
    pub transcription: String,
    pub reply_text: String,
    pub reply_audio: Option<Vec<u8>>,
    /// The backend could not transcribe and substituted a canned answer.
    pub is_fallback: bool,
    pub agent_type: Option<String>,
}

impl VoiceReply {
    /// True when there is something to play.
    pub fn has_audio(&self) -> bool {
        self.reply_audio.as_ref().map_or(false, |a| !a.is_empty())
    }
}

/// Transcription + response round-trip for one sealed segment.
#[async_trait]
pub trait ResponseService: Send + Sync {
    async fn respond(&self, segment: SealedSegment) -> VoiceResult<VoiceReply>;
}

/// Administrative calls; outcomes never touch the turn state machine.
#[async_trait]
pub trait SessionControl: Send + Sync {
    async fn initialize(&self, settings: &BackendSettings) -> VoiceResult<bool>;
    async fn clear(&self) -> VoiceResult<bool>;
}

#[derive(Debug, Deserialize)]
struct AiResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    agent_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DebugInfo {
    #[serde(default)]
    is_fallback: bool,
}

#[derive(Debug, Deserialize)]
struct ProcessAudioResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    transcription: Option<String>,
    #[serde(default)]
    ai_response: Option<AiResponse>,
    /// Base64-encoded synthesized reply.
    #[serde(default)]
    audio_response: Option<String>,
    #[serde(default)]
    debug_info: Option<DebugInfo>,
    #[serde(default)]
    error: Option<String>,
}

impl ProcessAudioResponse {
    fn into_reply(self) -> VoiceResult<VoiceReply> {
        if self.status.as_deref() == Some("error") {
            return Err(VoiceError::Backend(
                self.error
                    .unwrap_or_else(|| "voice processing failed".to_string()),
            ));
        }
        let ai = self.ai_response.ok_or_else(|| {
            VoiceError::Backend("response is missing ai_response".to_string())
        })?;
        let reply_audio = match self.audio_response.as_deref().map(str::trim) {
            Some(b64) if !b64.is_empty() => {
                Some(base64::engine::general_purpose::STANDARD.decode(b64)?)
            }
            _ => None,
        };
        Ok(VoiceReply {
            transcription: self.transcription.unwrap_or_default(),
            reply_text: ai.text,
            reply_audio,
            is_fallback: self.debug_info.unwrap_or_default().is_fallback,
            agent_type: ai.agent_type,
        })
    }
}

#[derive(Debug, Deserialize)]
struct InitializeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the voice backend.
#[derive(Debug, Clone)]
pub struct HttpVoiceBackend {
    /// Base URL without trailing slash (e.g. http://localhost:8001).
    pub base_url: String,
    client: reqwest::Client,
}

impl HttpVoiceBackend {
    /// Create a client. `timeout` bounds each HTTP exchange; the session adds its own ceiling.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> VoiceResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn error_body(res: reqwest::Response) -> VoiceError {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        VoiceError::Backend(format!("voice API error {}: {}", status, body))
    }
}

#[async_trait]
impl ResponseService for HttpVoiceBackend {
    async fn respond(&self, segment: SealedSegment) -> VoiceResult<VoiceReply> {
        let part = reqwest::multipart::Part::bytes(segment.audio)
            .file_name(segment.encoding.file_name())
            .mime_str(segment.encoding.mime_type())?;
        let form = reqwest::multipart::Form::new().part("audio_file", part);

        debug!(
            speech_ms = segment.speech_duration.as_millis() as u64,
            "uploading segment"
        );
        let res = self
            .client
            .post(self.url("voice/process-audio"))
            .multipart(form)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Self::error_body(res).await);
        }
        let body: ProcessAudioResponse = res.json().await?;
        let reply = body.into_reply()?;
        if reply.is_fallback {
            warn!("backend returned a fallback transcription");
        }
        Ok(reply)
    }
}

#[async_trait]
impl SessionControl for HttpVoiceBackend {
    async fn initialize(&self, settings: &BackendSettings) -> VoiceResult<bool> {
        let res = self
            .client
            .post(self.url("voice/initialize"))
            .json(settings)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Self::error_body(res).await);
        }
        let body: InitializeResponse = res.json().await?;
        if let Some(e) = body.error.as_deref() {
            warn!("initialize rejected: {}", e);
        }
        Ok(body.success)
    }

    async fn clear(&self) -> VoiceResult<bool> {
        let res = self
            .client
            .post(self.url("voice/clear-conversation"))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Self::error_body(res).await);
        }
        let body: StatusResponse = res.json().await?;
        if body.status != "success" {
            if let Some(m) = body.message.as_deref() {
                warn!("clear rejected: {}", m);
            }
        }
        Ok(body.status == "success")
    }
}
