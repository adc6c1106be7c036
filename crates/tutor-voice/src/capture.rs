//! Utterance capture: microphone acquisition, chunked recording, minimum-size
//! validation and hand-off to the transcription boundary.
//!
//! States: `Idle -> Acquiring -> Recording -> Stopping -> Idle`. The device is
//! released on every exit path (stop, cancel, drop) and always before the
//! payload is forwarded for transcription.

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::sink::lock;
use crate::transcription::Transcriber;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Encoding of captured chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Raw s16le PCM; the payload is wrapped in a WAV header.
    Pcm16 { sample_rate: u32, channels: u16 },
    /// Already-encoded container (e.g. `audio/webm`); chunks are concatenated.
    Encoded { mime: String },
}

impl CaptureFormat {
    pub fn format_tag(&self) -> String {
        match self {
            CaptureFormat::Pcm16 { .. } => "audio/wav".to_string(),
            CaptureFormat::Encoded { mime } => mime.clone(),
        }
    }
}

/// One timestamped piece of a recording.
#[derive(Debug, Clone)]
pub struct CaptureChunk {
    pub bytes: Vec<u8>,
    pub captured_at: Instant,
}

impl CaptureChunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            captured_at: Instant::now(),
        }
    }
}

/// An opened microphone. Releasing stops capture and frees the device.
pub trait CaptureDevice: Send {
    fn release(self: Box<Self>);
}

/// Result of a successful acquisition.
pub struct AcquiredDevice {
    pub device: Box<dyn CaptureDevice>,
    pub chunks: mpsc::UnboundedReceiver<CaptureChunk>,
    pub format: CaptureFormat,
}

/// Source of microphone devices. `acquire` is the permission-prompt suspension point.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    async fn acquire(&self) -> VoiceResult<AcquiredDevice>;
}

/// An in-progress or completed recording.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub chunks: Vec<CaptureChunk>,
    pub duration_seconds: u64,
    pub format: CaptureFormat,
}

impl Utterance {
    pub fn new(format: CaptureFormat) -> Self {
        Self {
            chunks: Vec::new(),
            duration_seconds: 0,
            format,
        }
    }

    /// Captured bytes, excluding any container header.
    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(|c| c.bytes.len()).sum()
    }

    /// Concatenated chunks, wrapped in WAV for PCM captures.
    pub fn payload(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.byte_len());
        for chunk in &self.chunks {
            data.extend_from_slice(&chunk.bytes);
        }
        match self.format {
            CaptureFormat::Pcm16 {
                sample_rate,
                channels,
            } => pcm16_to_wav(&data, sample_rate, channels),
            CaptureFormat::Encoded { .. } => data,
        }
    }
}

/// Wrap s16le PCM in a 44-byte RIFF/WAV header.
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let block_align = channels * 2;
    let byte_rate = sample_rate * block_align as u32;

    let mut buf = Vec::with_capacity(44 + pcm.len());
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend_from_slice(pcm);
    buf
}

/// What `stop_recording` resolves with.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    /// The payload that was transcribed, for callers that persist the utterance.
    pub audio: Vec<u8>,
    pub format_tag: String,
    pub duration_seconds: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Acquiring,
    Recording,
    Stopping,
}

struct ActiveRecording {
    device: Box<dyn CaptureDevice>,
    utterance: Arc<Mutex<Utterance>>,
    stop_collector: oneshot::Sender<()>,
    collector: JoinHandle<()>,
    ticker: JoinHandle<()>,
    safety_timer: JoinHandle<()>,
}

impl ActiveRecording {
    /// Release the device, then wait for already-delivered chunks to be appended.
    async fn finish(self) -> Utterance {
        self.ticker.abort();
        self.safety_timer.abort();
        self.device.release();
        let _ = self.stop_collector.send(());
        if let Err(e) = self.collector.await {
            debug!(error = %e, "chunk collector ended abnormally");
        }
        let mut utterance = lock(&self.utterance);
        Utterance {
            chunks: std::mem::take(&mut utterance.chunks),
            duration_seconds: utterance.duration_seconds,
            format: utterance.format.clone(),
        }
    }

    fn discard(self) {
        self.ticker.abort();
        self.safety_timer.abort();
        self.collector.abort();
        self.device.release();
    }
}

struct CaptureInner {
    state: CaptureState,
    attempt: u64,
    active: Option<ActiveRecording>,
}

/// Owns the microphone for the duration of one recording.
pub struct CaptureSession {
    microphone: Arc<dyn MicrophoneSource>,
    transcriber: Arc<dyn Transcriber>,
    min_recording_bytes: usize,
    max_recording: Duration,
    inner: Arc<Mutex<CaptureInner>>,
    duration_seconds: Arc<AtomicU64>,
}

/// Resets `Stopping` to `Idle` however `stop_recording` exits.
struct StoppingGuard {
    inner: Arc<Mutex<CaptureInner>>,
    attempt: u64,
}

impl Drop for StoppingGuard {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        if inner.attempt == self.attempt && inner.state == CaptureState::Stopping {
            inner.state = CaptureState::Idle;
        }
    }
}

impl CaptureSession {
    pub fn new(
        microphone: Arc<dyn MicrophoneSource>,
        transcriber: Arc<dyn Transcriber>,
        config: &VoiceConfig,
    ) -> Self {
        Self {
            microphone,
            transcriber,
            min_recording_bytes: config.min_recording_bytes,
            max_recording: config.max_recording(),
            inner: Arc::new(Mutex::new(CaptureInner {
                state: CaptureState::Idle,
                attempt: 0,
                active: None,
            })),
            duration_seconds: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> CaptureState {
        lock(&self.inner).state
    }

    pub fn is_recording(&self) -> bool {
        self.state() == CaptureState::Recording
    }

    /// Whole seconds recorded so far (ticks once per second while recording).
    pub fn duration_seconds(&self) -> u64 {
        self.duration_seconds.load(Ordering::SeqCst)
    }

    /// Acquire the microphone and begin appending chunks.
    ///
    /// Fails with `Aborted` if the recording was cancelled while the device was
    /// being acquired; the device is released immediately in that case.
    pub async fn start_recording(&self) -> VoiceResult<()> {
        let attempt = {
            let mut inner = lock(&self.inner);
            if inner.state != CaptureState::Idle {
                return Err(VoiceError::InvalidState(format!(
                    "cannot start recording while {:?}",
                    inner.state
                )));
            }
            inner.state = CaptureState::Acquiring;
            inner.attempt += 1;
            inner.attempt
        };

        info!("🎤 Requesting microphone");
        let acquired = match self.microphone.acquire().await {
            Ok(acquired) => acquired,
            Err(e) => {
                let mut inner = lock(&self.inner);
                if inner.attempt == attempt && inner.state == CaptureState::Acquiring {
                    inner.state = CaptureState::Idle;
                }
                warn!(error = %e, "Microphone acquisition failed");
                return Err(e);
            }
        };

        let mut inner = lock(&self.inner);
        if inner.attempt != attempt || inner.state != CaptureState::Acquiring {
            drop(inner);
            acquired.device.release();
            debug!("Recording cancelled during acquisition; device released");
            return Err(VoiceError::Aborted);
        }

        self.duration_seconds.store(0, Ordering::SeqCst);
        let utterance = Arc::new(Mutex::new(Utterance::new(acquired.format)));
        let (stop_tx, stop_rx) = oneshot::channel();
        let collector = tokio::spawn(collect_chunks(
            acquired.chunks,
            stop_rx,
            Arc::clone(&utterance),
        ));
        let ticker = tokio::spawn(tick_duration(
            Arc::clone(&self.duration_seconds),
            Arc::clone(&utterance),
        ));
        let safety_timer = tokio::spawn(advisory_limit(self.max_recording));

        inner.active = Some(ActiveRecording {
            device: acquired.device,
            utterance,
            stop_collector: stop_tx,
            collector,
            ticker,
            safety_timer,
        });
        inner.state = CaptureState::Recording;
        info!("🎙️ Recording started");
        Ok(())
    }

    /// Stop capture, validate the payload and transcribe it.
    pub async fn stop_recording(&self) -> VoiceResult<Transcript> {
        let (active, guard) = {
            let mut inner = lock(&self.inner);
            match inner.state {
                CaptureState::Recording => {}
                CaptureState::Acquiring => {
                    // The pending start sees this and releases the device on arrival.
                    inner.state = CaptureState::Idle;
                    info!("⏹️ Stop requested before the microphone was ready");
                    return Err(VoiceError::EmptyRecording);
                }
                _ => return Err(VoiceError::InvalidState("not recording".to_string())),
            }
            inner.state = CaptureState::Stopping;
            let guard = StoppingGuard {
                inner: Arc::clone(&self.inner),
                attempt: inner.attempt,
            };
            (inner.active.take(), guard)
        };
        let active = active.ok_or_else(|| VoiceError::InvalidState("no active recording".to_string()))?;

        let utterance = active.finish().await;
        info!(
            chunks = utterance.chunks.len(),
            bytes = utterance.byte_len(),
            seconds = utterance.duration_seconds,
            "⏹️ Recording stopped; microphone released"
        );

        let result = self.transcribe(utterance).await;
        drop(guard);
        result
    }

    /// Release the device and discard everything captured. Always legal.
    pub fn cancel_recording(&self) {
        let active = {
            let mut inner = lock(&self.inner);
            match inner.state {
                CaptureState::Idle => return,
                CaptureState::Acquiring | CaptureState::Recording | CaptureState::Stopping => {
                    inner.state = CaptureState::Idle;
                }
            }
            inner.active.take()
        };
        if let Some(active) = active {
            active.discard();
            info!("🗑️ Recording cancelled; microphone released");
        }
        self.duration_seconds.store(0, Ordering::SeqCst);
    }

    async fn transcribe(&self, utterance: Utterance) -> VoiceResult<Transcript> {
        if utterance.chunks.is_empty() {
            warn!("No audio chunks captured");
            return Err(VoiceError::EmptyRecording);
        }
        let bytes = utterance.byte_len();
        if bytes < self.min_recording_bytes {
            warn!(bytes, min_bytes = self.min_recording_bytes, "Recording too short; not sending");
            return Err(VoiceError::RecordingTooShort {
                bytes,
                min_bytes: self.min_recording_bytes,
            });
        }

        let payload = utterance.payload();
        let format_tag = utterance.format.format_tag();
        info!(bytes = payload.len(), format = %format_tag, "📤 Sending recording for transcription");
        let text = self.transcriber.transcribe(&payload, &format_tag).await?;

        Ok(Transcript {
            text,
            audio: payload,
            format_tag,
            duration_seconds: utterance.duration_seconds,
            recorded_at: Utc::now(),
        })
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.cancel_recording();
    }
}

async fn collect_chunks(
    mut chunks: mpsc::UnboundedReceiver<CaptureChunk>,
    mut stop: oneshot::Receiver<()>,
    utterance: Arc<Mutex<Utterance>>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => lock(&utterance).chunks.push(chunk),
                None => return,
            },
        }
    }
    // Device is released; keep only what was already delivered.
    while let Ok(chunk) = chunks.try_recv() {
        lock(&utterance).chunks.push(chunk);
    }
}

async fn tick_duration(seconds: Arc<AtomicU64>, utterance: Arc<Mutex<Utterance>>) {
    let period = Duration::from_secs(1);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        let s = seconds.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&utterance).duration_seconds = s;
        debug!(seconds = s, "🎤 Recording");
    }
}

/// Logs when a recording runs past the limit. Does not stop it; stopping is the caller's decision.
async fn advisory_limit(limit: Duration) {
    tokio::time::sleep(limit).await;
    warn!(
        limit_secs = limit.as_secs(),
        "⏱️ Recording exceeded the safety limit; still recording until stopped"
    );
}

/// Default input device via cpal, delivering s16le PCM chunks.
#[derive(Debug, Clone)]
pub struct CpalMicrophone {
    sample_rate: u32,
    chunk_samples: usize,
}

impl CpalMicrophone {
    pub fn new(sample_rate: u32, chunk_samples: usize) -> Self {
        Self {
            sample_rate,
            chunk_samples: chunk_samples.max(1),
        }
    }

    pub fn from_config(config: &VoiceConfig) -> Self {
        Self::new(config.capture_sample_rate, config.capture_chunk_samples())
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

fn open_input_stream(
    sample_rate: u32,
    chunk_samples: usize,
    chunk_tx: mpsc::UnboundedSender<CaptureChunk>,
) -> VoiceResult<Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceAccessDenied("No input device available".to_string()))?;

    info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: Vec<u8> = Vec::with_capacity(chunk_samples * 2);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                let value = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
                pending.extend_from_slice(&value.to_le_bytes());

                if pending.len() >= chunk_samples * 2 {
                    let bytes = std::mem::replace(&mut pending, Vec::with_capacity(chunk_samples * 2));
                    if chunk_tx.send(CaptureChunk::new(bytes)).is_err() {
                        // Receiver gone: the recording was stopped.
                        return;
                    }
                }
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

struct CpalDevice {
    release: std_mpsc::Sender<()>,
}

impl CaptureDevice for CpalDevice {
    fn release(self: Box<Self>) {
        let _ = self.release.send(());
    }
}

#[async_trait]
impl MicrophoneSource for CpalMicrophone {
    /// `cpal::Stream` is not `Send`; it is built and held on a dedicated thread
    /// until the device is released.
    async fn acquire(&self) -> VoiceResult<AcquiredDevice> {
        let sample_rate = self.sample_rate;
        let chunk_samples = self.chunk_samples;
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<()>>();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("tutor-voice-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(sample_rate, chunk_samples, chunk_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                let _ = release_rx.recv();
                drop(stream);
                info!("🎤 Microphone released");
            })?;

        ready_rx
            .await
            .map_err(|_| VoiceError::AudioDevice("capture thread exited".to_string()))??;

        Ok(AcquiredDevice {
            device: Box::new(CpalDevice {
                release: release_tx,
            }),
            chunks: chunk_rx,
            format: CaptureFormat::Pcm16 {
                sample_rate,
                channels: 1,
            },
        })
    }
}
