//! The audio output resource.
//!
//! An [`AudioSink`] renders sample buffers at absolute instants on its own clock.
//! It is long-lived: created lazily once through a [`SinkSlot`], resumed if
//! suspended, reused by every playback session, and closed only on teardown.
//! Barge-in stops individual sources; it never closes the sink.

mod rodio_sink;
mod virtual_sink;

pub use rodio_sink::RodioSink;
pub use virtual_sink::{SourceKind, VirtualSink, VirtualSource};

use crate::error::{VoiceError, VoiceResult};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Identifier of one scheduled source on a sink.
pub type SourceId = u64;

/// Decoded, normalized samples at a declared rate (interleaved when `channels > 1`).
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SampleBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback length in seconds at the declared rate.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// A complete encoded payload (WAV/MP3) for the non-streaming path.
#[derive(Debug, Clone)]
pub struct EncodedClip {
    pub bytes: Vec<u8>,
    pub format_tag: String,
}

/// Handle for a clip started with [`AudioSink::play_clip`].
///
/// `finished` resolves when the clip plays to the end. It is dropped without
/// firing when the clip is stopped.
#[derive(Debug)]
pub struct ClipPlayback {
    pub id: SourceId,
    pub finished: oneshot::Receiver<()>,
}

/// Output device abstraction. All instants are seconds on the sink's clock.
pub trait AudioSink: Send + Sync {
    /// Current instant on the sink's clock.
    fn now(&self) -> f64;

    fn is_suspended(&self) -> bool;

    fn resume_if_suspended(&self) -> VoiceResult<()>;

    /// Schedule `buffer` to begin at `at`. Instants in the past start immediately.
    fn start_buffer(&self, buffer: SampleBuffer, at: f64) -> VoiceResult<SourceId>;

    /// Stop a source whether or not it has started. Fails for unknown or
    /// already-finished sources; callers tearing down playback ignore that.
    fn stop_source(&self, id: SourceId) -> VoiceResult<()>;

    /// Decode and play a complete clip as soon as possible.
    fn play_clip(&self, clip: EncodedClip) -> VoiceResult<ClipPlayback>;

    /// Release the device. Only called on teardown.
    fn close(&self);
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type SinkFactory = Box<dyn Fn() -> VoiceResult<Arc<dyn AudioSink>> + Send + Sync>;

/// Lazily created, reused sink with an explicit lifecycle.
pub struct SinkSlot {
    factory: SinkFactory,
    sink: Mutex<Option<Arc<dyn AudioSink>>>,
    created: AtomicUsize,
}

static DEFAULT_OUTPUT: Lazy<SinkSlot> = Lazy::new(|| {
    SinkSlot::new(|| Ok(Arc::new(RodioSink::new()?) as Arc<dyn AudioSink>))
});

impl SinkSlot {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> VoiceResult<Arc<dyn AudioSink>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            sink: Mutex::new(None),
            created: AtomicUsize::new(0),
        }
    }

    /// Process-wide slot for the default output device.
    pub fn default_output() -> &'static SinkSlot {
        &DEFAULT_OUTPUT
    }

    /// Return the live sink, creating it on first use.
    pub fn acquire_or_reuse(&self) -> VoiceResult<Arc<dyn AudioSink>> {
        let mut slot = lock(&self.sink);
        if let Some(sink) = slot.as_ref() {
            return Ok(Arc::clone(sink));
        }
        let sink = (self.factory)()?;
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        info!(created = n, "🔊 Audio sink acquired");
        *slot = Some(Arc::clone(&sink));
        Ok(sink)
    }

    /// The live sink, if one has been acquired.
    pub fn current(&self) -> Option<Arc<dyn AudioSink>> {
        lock(&self.sink).as_ref().map(Arc::clone)
    }

    pub fn resume_if_suspended(&self) -> VoiceResult<()> {
        match self.current() {
            Some(sink) if sink.is_suspended() => {
                debug!("Resuming suspended audio sink");
                sink.resume_if_suspended()
            }
            _ => Ok(()),
        }
    }

    pub fn close_on_teardown(&self) {
        if let Some(sink) = lock(&self.sink).take() {
            sink.close();
            info!("🔇 Audio sink closed");
        }
    }

    /// How many times the factory has produced a sink.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SinkSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSlot")
            .field("acquired", &lock(&self.sink).is_some())
            .field("created", &self.created_count())
            .finish()
    }
}

pub(crate) fn playback_error(msg: impl Into<String>) -> VoiceError {
    VoiceError::PlaybackFailed(msg.into())
}
