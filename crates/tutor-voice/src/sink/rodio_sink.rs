//! Device-backed sink on rodio.
//!
//! One `rodio::Sink` plays everything back to back. Absolute start instants are
//! honored by padding with silence up to the requested start. Every appended
//! source is gated by a per-source flag so a single buffer can be stopped
//! without stopping the shared sink.

use super::{lock, playback_error, AudioSink, ClipPlayback, EncodedClip, SampleBuffer, SourceId};
use crate::error::{VoiceError, VoiceResult};
use rodio::buffer::SamplesBuffer;
use rodio::source::Zero;
use rodio::{OutputStream, Sample, Sink, Source};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Gate {
    stopped: AtomicBool,
    finished: AtomicBool,
}

/// Source wrapper that ends early once its gate is stopped.
struct GatedSource<S> {
    inner: S,
    gate: Arc<Gate>,
    marks_finish: bool,
    done: Option<oneshot::Sender<()>>,
}

impl<S> GatedSource<S> {
    fn new(inner: S, gate: Arc<Gate>, marks_finish: bool, done: Option<oneshot::Sender<()>>) -> Self {
        Self {
            inner,
            gate,
            marks_finish,
            done,
        }
    }
}

impl<S> Iterator for GatedSource<S>
where
    S: Source,
    S::Item: Sample,
{
    type Item = S::Item;

    fn next(&mut self) -> Option<S::Item> {
        if self.gate.stopped.load(Ordering::Acquire) {
            // A stopped clip drops its sender without firing.
            self.done = None;
            return None;
        }
        match self.inner.next() {
            Some(sample) => Some(sample),
            None => {
                if self.marks_finish {
                    self.gate.finished.store(true, Ordering::Release);
                }
                if let Some(tx) = self.done.take() {
                    let _ = tx.send(());
                }
                None
            }
        }
    }
}

impl<S> Source for GatedSource<S>
where
    S: Source,
    S::Item: Sample,
{
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Sink-clock instant at which the last appended source ends.
    queue_end: f64,
    next_id: SourceId,
    gates: HashMap<SourceId, Arc<Gate>>,
}

impl QueueState {
    /// Whether any appended source can still produce sound.
    fn has_live_sources(&self) -> bool {
        self.gates.values().any(|g| {
            !g.stopped.load(Ordering::Acquire) && !g.finished.load(Ordering::Acquire)
        })
    }

    /// Snap the queue tail back to `now` once nothing audible remains queued.
    fn settle(&mut self, now: f64, sink_empty: bool) {
        if sink_empty || self.queue_end < now || !self.has_live_sources() {
            self.queue_end = now;
        }
    }
}

/// Playback on the default output device.
pub struct RodioSink {
    sink: Arc<Sink>,
    origin: Instant,
    state: Mutex<QueueState>,
    shutdown: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl RodioSink {
    /// Open the default output device.
    ///
    /// `OutputStream` is not `Send`, so it is opened and held on a dedicated
    /// thread until [`AudioSink::close`] or drop.
    pub fn new() -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback");

        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<Arc<Sink>>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("tutor-voice-output".to_string())
            .spawn(move || {
                let (stream, stream_handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(playback_error(e.to_string())));
                        return;
                    }
                };
                let sink = match Sink::try_new(&stream_handle) {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        let _ = ready_tx.send(Err(playback_error(e.to_string())));
                        return;
                    }
                };
                if ready_tx.send(Ok(sink)).is_err() {
                    return;
                }
                // Blocks until close() or the sink is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Output stream released");
            })?;

        let sink = ready_rx
            .recv()
            .map_err(|e| VoiceError::PlaybackFailed(format!("output thread exited: {}", e)))??;

        info!("✅ Audio playback initialized");

        Ok(Self {
            sink,
            origin: Instant::now(),
            state: Mutex::new(QueueState::default()),
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    fn register(&self, state: &mut QueueState) -> (SourceId, Arc<Gate>) {
        state.next_id += 1;
        let gate = Arc::new(Gate::default());
        state.gates.insert(state.next_id, Arc::clone(&gate));
        state
            .gates
            .retain(|_, g| !g.finished.load(Ordering::Acquire));
        (state.next_id, gate)
    }

}

impl AudioSink for RodioSink {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn is_suspended(&self) -> bool {
        self.sink.is_paused()
    }

    fn resume_if_suspended(&self) -> VoiceResult<()> {
        if self.sink.is_paused() {
            self.sink.play();
            info!("▶️ Audio sink resumed");
        }
        Ok(())
    }

    fn start_buffer(&self, buffer: SampleBuffer, at: f64) -> VoiceResult<SourceId> {
        if lock(&self.shutdown).is_none() {
            return Err(playback_error("sink closed"));
        }
        let now = self.now();
        let mut state = lock(&self.state);
        state.settle(now, self.sink.empty());
        let (id, gate) = self.register(&mut state);

        let gap = at - state.queue_end;
        if gap > 0.0 {
            let silence = Zero::<f32>::new(buffer.channels, buffer.sample_rate)
                .take_duration(Duration::from_secs_f64(gap));
            self.sink
                .append(GatedSource::new(silence, Arc::clone(&gate), false, None));
        } else if gap < -1e-3 {
            debug!(source = id, overlap = -gap, "Requested start overlaps queued audio; appending");
        }

        let duration = buffer.duration_secs();
        let source = SamplesBuffer::new(buffer.channels, buffer.sample_rate, buffer.samples);
        self.sink.append(GatedSource::new(source, gate, true, None));
        state.queue_end = state.queue_end.max(at) + duration;
        Ok(id)
    }

    fn stop_source(&self, id: SourceId) -> VoiceResult<()> {
        let mut state = lock(&self.state);
        let gate = state
            .gates
            .remove(&id)
            .ok_or_else(|| playback_error(format!("unknown source {}", id)))?;
        if gate.finished.load(Ordering::Acquire) {
            return Err(playback_error(format!("source {} already finished", id)));
        }
        gate.stopped.store(true, Ordering::Release);
        Ok(())
    }

    fn play_clip(&self, clip: EncodedClip) -> VoiceResult<ClipPlayback> {
        if clip.bytes.is_empty() {
            return Err(playback_error("empty clip"));
        }
        let decoder = rodio::Decoder::new(Cursor::new(clip.bytes))
            .map_err(|e| playback_error(format!("Decode failed ({}): {}", clip.format_tag, e)))?;
        let length = decoder.total_duration();

        let now = self.now();
        let mut state = lock(&self.state);
        state.settle(now, self.sink.empty());
        let (id, gate) = self.register(&mut state);
        let (tx, rx) = oneshot::channel();
        self.sink.append(GatedSource::new(
            decoder.convert_samples::<f32>(),
            gate,
            true,
            Some(tx),
        ));
        state.queue_end += length.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        Ok(ClipPlayback { id, finished: rx })
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        for gate in state.gates.values() {
            gate.stopped.store(true, Ordering::Release);
        }
        state.gates.clear();
        self.sink.stop();
        if let Some(tx) = lock(&self.shutdown).take() {
            if tx.send(()).is_err() {
                warn!("Output thread already gone");
            }
        }
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        if let Some(tx) = lock(&self.shutdown).take() {
            let _ = tx.send(());
        }
    }
}
