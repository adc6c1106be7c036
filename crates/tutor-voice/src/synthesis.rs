//! **Speech synthesis boundary**: text in, audio out.
//!
//! Two paths: `synthesize` returns one complete encoded payload (retried once
//! on transient failure by [`synthesize_with_retry`]); `stream` returns raw
//! s16le PCM chunks at a declared rate, consumed exactly once and never retried.

use crate::config::{EndpointConfig, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tracing::{info, warn};

/// Server-reported total synthesis time, informational only.
pub const SYNTHESIS_TIME_HEADER: &str = "x-synthesis-time-ms";
/// Server-reported time to first chunk, informational only.
pub const FIRST_CHUNK_HEADER: &str = "x-time-to-first-chunk-ms";

/// One complete synthesized utterance.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub format_tag: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisTiming {
    pub total_ms: Option<u64>,
    pub first_chunk_ms: Option<u64>,
}

pub type PcmChunkStream = BoxStream<'static, VoiceResult<Vec<u8>>>;

/// Streaming response: ordered raw PCM byte chunks, arbitrarily split.
pub struct PcmStream {
    pub sample_rate: u32,
    pub channels: u16,
    pub timing: SynthesisTiming,
    pub chunks: PcmChunkStream,
}

impl std::fmt::Debug for PcmStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmStream")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

/// Text-to-speech service.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into one encoded payload (WAV/MP3).
    async fn synthesize(&self, text: &str, voice_id: &str) -> VoiceResult<SynthesizedAudio>;

    /// Open a streaming synthesis whose body is raw s16le PCM.
    async fn stream(&self, text: &str, voice_id: &str) -> VoiceResult<PcmStream>;
}

/// Non-streaming synthesis with a single retry after `backoff` for transient failures.
pub async fn synthesize_with_retry(
    synthesizer: &dyn SpeechSynthesizer,
    text: &str,
    voice_id: &str,
    backoff: Duration,
) -> VoiceResult<SynthesizedAudio> {
    match synthesizer.synthesize(text, voice_id).await {
        Err(e) if e.is_transient() => {
            warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Synthesis failed; retrying once");
            tokio::time::sleep(backoff).await;
            synthesizer.synthesize(text, voice_id).await
        }
        other => other,
    }
}

fn header_ms(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|ms| ms.max(0.0).round() as u64)
}

fn status_error(status: reqwest::StatusCode, body: String) -> VoiceError {
    let message = format!("TTS API error {}: {}", status, body);
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        VoiceError::transient_synthesis(message)
    } else {
        VoiceError::synthesis(message)
    }
}

/// OpenAI-compatible `/audio/speech` client.
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// TTS model: tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    /// Declared rate of the `pcm` response format.
    pub stream_sample_rate: u32,
    pub stream_channels: u16,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        // No overall timeout: a streaming body may legitimately outlive any fixed bound.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VoiceError::synthesis(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            stream_sample_rate: 24000,
            stream_channels: 1,
            client,
        })
    }

    pub fn from_config(config: &VoiceConfig) -> VoiceResult<Self> {
        let EndpointConfig {
            base_url,
            model,
            api_key,
        } = &config.tts;
        let api_key = api_key
            .clone()
            .ok_or_else(|| VoiceError::Config("synthesis requires tts.api_key or OPENAI_API_KEY".to_string()))?;
        let mut synth = Self::new(base_url.clone(), api_key, model.clone())?;
        synth.stream_sample_rate = config.stream_sample_rate;
        synth.stream_channels = config.stream_channels;
        Ok(synth)
    }

    async fn post(&self, text: &str, voice_id: &str, format: &str) -> VoiceResult<reqwest::Response> {
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice_id,
            "response_format": format,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::transient_synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        Ok(res)
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str) -> VoiceResult<SynthesizedAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::synthesis("nothing to synthesize"));
        }
        let res = self.post(text, voice_id, "mp3").await?;
        let format_tag = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::transient_synthesis(e.to_string()))?;
        Ok(SynthesizedAudio {
            bytes: bytes.to_vec(),
            format_tag,
        })
    }

    async fn stream(&self, text: &str, voice_id: &str) -> VoiceResult<PcmStream> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::synthesis("nothing to synthesize"));
        }
        let res = self.post(text, voice_id, "pcm").await?;
        let timing = SynthesisTiming {
            total_ms: header_ms(res.headers(), SYNTHESIS_TIME_HEADER),
            first_chunk_ms: header_ms(res.headers(), FIRST_CHUNK_HEADER),
        };
        info!(
            total_ms = ?timing.total_ms,
            first_chunk_ms = ?timing.first_chunk_ms,
            "🔊 Streaming synthesis opened"
        );
        let chunks = res
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| VoiceError::synthesis(format!("stream read failed: {}", e)))
            })
            .boxed();
        Ok(PcmStream {
            sample_rate: self.stream_sample_rate,
            channels: self.stream_channels,
            timing,
            chunks,
        })
    }
}
