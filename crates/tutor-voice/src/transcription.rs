//! **Transcription boundary**: submit a finished recording, receive text.
//!
//! Implement `Transcriber` for any speech-to-text service. Failures surface as
//! `VoiceError::TranscriptionFailed` and are never retried automatically.

use crate::config::EndpointConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Speech-to-text service.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one recording. `format_tag` is a mime type such as `audio/wav`.
    async fn transcribe(&self, audio: &[u8], format_tag: &str) -> VoiceResult<String>;
}

/// Fixed-response transcriber for offline wiring. Counts calls.
#[derive(Debug, Default)]
pub struct FixedTranscriber {
    response: String,
    calls: AtomicUsize,
}

impl FixedTranscriber {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, audio: &[u8], format_tag: &str) -> VoiceResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!(bytes = audio.len(), format = format_tag, "fixed transcription");
        Ok(self.response.clone())
    }
}

/// File extension the upstream API expects for a mime tag (parameters ignored).
pub fn extension_for(format_tag: &str) -> &'static str {
    let base = format_tag.split(';').next().unwrap_or("").trim();
    match base {
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/flac" => "flac",
        _ => "bin",
    }
}

/// OpenAI-compatible `/audio/transcriptions` client.
#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// Model: whisper-1, gpt-4o-transcribe, etc.
    pub model: String,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    pub fn from_config(endpoint: &EndpointConfig) -> VoiceResult<Self> {
        let api_key = endpoint
            .api_key
            .clone()
            .ok_or_else(|| VoiceError::Config("transcription requires stt.api_key or OPENAI_API_KEY".to_string()))?;
        Self::new(endpoint.base_url.clone(), api_key, endpoint.model.clone())
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &[u8], format_tag: &str) -> VoiceResult<String> {
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(format!("audio.{}", extension_for(format_tag)))
            .mime_str(format_tag)
            .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::TranscriptionFailed(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        info!(chars = text.len(), "📝 Transcription received");
        Ok(text)
    }
}
