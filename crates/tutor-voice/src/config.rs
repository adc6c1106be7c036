//! Voice engine configuration.
//!
//! Precedence: env (`TUTOR_VOICE_*`, nested keys with `__`) > TOML file
//! (`TUTOR_VOICE_CONFIG` path, default `config/voice`) > built-in defaults.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | stream_sample_rate | 24000 | Declared rate of the streaming PCM body. |
//! | stream_channels | 1 | Declared channel count of the streaming PCM body. |
//! | latency_buffer_ms | 80 | Forward offset applied when the playback clock falls behind. |
//! | capture_sample_rate | 16000 | Microphone rate. |
//! | capture_chunk_ms | 100 | Size of each captured chunk. |
//! | min_recording_bytes | 6400 | Below this the recording is rejected locally. |
//! | max_recording_secs | 30 | Advisory auto-stop timer (logs only). |
//! | synthesis_retry_backoff_ms | 500 | Wait before the single synthesis retry. |
//! | voice_id | alloy | Voice requested from the synthesis service. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_stream_sample_rate() -> u32 {
    24000
}

fn default_stream_channels() -> u16 {
    1
}

fn default_latency_buffer_ms() -> u64 {
    80
}

fn default_capture_sample_rate() -> u32 {
    16000
}

fn default_capture_chunk_ms() -> u64 {
    100
}

fn default_min_recording_bytes() -> usize {
    // 200ms of 16 kHz mono s16le
    6400
}

fn default_max_recording_secs() -> u64 {
    30
}

fn default_synthesis_retry_backoff_ms() -> u64 {
    500
}

fn default_voice_id() -> String {
    "alloy".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_stt() -> EndpointConfig {
    EndpointConfig {
        base_url: default_base_url(),
        model: "whisper-1".to_string(),
        api_key: None,
    }
}

fn default_tts() -> EndpointConfig {
    EndpointConfig {
        base_url: default_base_url(),
        model: "tts-1".to_string(),
        api_key: None,
    }
}

/// An OpenAI-compatible HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub model: String,
    /// Bearer key. Falls back to `OPENAI_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default = "default_stream_sample_rate")]
    pub stream_sample_rate: u32,
    #[serde(default = "default_stream_channels")]
    pub stream_channels: u16,
    #[serde(default = "default_latency_buffer_ms")]
    pub latency_buffer_ms: u64,
    #[serde(default = "default_capture_sample_rate")]
    pub capture_sample_rate: u32,
    #[serde(default = "default_capture_chunk_ms")]
    pub capture_chunk_ms: u64,
    #[serde(default = "default_min_recording_bytes")]
    pub min_recording_bytes: usize,
    #[serde(default = "default_max_recording_secs")]
    pub max_recording_secs: u64,
    #[serde(default = "default_synthesis_retry_backoff_ms")]
    pub synthesis_retry_backoff_ms: u64,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_stt")]
    pub stt: EndpointConfig,
    #[serde(default = "default_tts")]
    pub tts: EndpointConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            stream_sample_rate: default_stream_sample_rate(),
            stream_channels: default_stream_channels(),
            latency_buffer_ms: default_latency_buffer_ms(),
            capture_sample_rate: default_capture_sample_rate(),
            capture_chunk_ms: default_capture_chunk_ms(),
            min_recording_bytes: default_min_recording_bytes(),
            max_recording_secs: default_max_recording_secs(),
            synthesis_retry_backoff_ms: default_synthesis_retry_backoff_ms(),
            voice_id: default_voice_id(),
            stt: default_stt(),
            tts: default_tts(),
        }
    }
}

impl VoiceConfig {
    /// Load from file and environment, then apply the `OPENAI_API_KEY` fallback.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("TUTOR_VOICE_CONFIG").unwrap_or_else(|_| "config/voice".to_string());
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &str) -> VoiceResult<Self> {
        let builder = config::Config::builder();

        // `config::File` resolves the extension itself; accept both "config/voice" and "config/voice.toml".
        let path = Path::new(config_path);
        let with_ext = path.with_extension("toml");
        let builder = if path.exists() || with_ext.exists() {
            builder.add_source(config::File::with_name(config_path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("TUTOR_VOICE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: VoiceConfig = built.try_deserialize()?;
        let fallback = env_opt_string("OPENAI_API_KEY");
        if cfg.stt.api_key.is_none() {
            cfg.stt.api_key = fallback.clone();
        }
        if cfg.tts.api_key.is_none() {
            cfg.tts.api_key = fallback;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.stream_sample_rate == 0 || self.capture_sample_rate == 0 {
            return Err(VoiceError::Config("sample rates must be non-zero".to_string()));
        }
        if !(1..=2).contains(&self.stream_channels) {
            return Err(VoiceError::Config(format!(
                "stream_channels must be 1 or 2, got {}",
                self.stream_channels
            )));
        }
        if self.capture_chunk_ms == 0 {
            return Err(VoiceError::Config("capture_chunk_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn latency_buffer(&self) -> Duration {
        Duration::from_millis(self.latency_buffer_ms)
    }

    pub fn max_recording(&self) -> Duration {
        Duration::from_secs(self.max_recording_secs)
    }

    pub fn synthesis_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.synthesis_retry_backoff_ms)
    }

    /// Samples per captured chunk at the capture rate.
    pub fn capture_chunk_samples(&self) -> usize {
        (self.capture_sample_rate as u64 * self.capture_chunk_ms / 1000).max(1) as usize
    }
}

fn env_opt_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
