//! Barge-in: the single cancellation path for playback.
//!
//! `BargeInController` owns everything a playback session touches: the
//! scheduler (clock, residual byte, buffer list), the cancellation token of the
//! in-flight network read, and the non-streaming clip. It is the only writer of
//! that state. `interrupt()` is synchronous: it cancels the read (the read loop
//! notices on its next poll), stops every scheduled source and resets the
//! scheduler. The sink itself stays open for the next session.

use crate::error::{VoiceError, VoiceResult};
use crate::scheduler::{PlaybackScheduler, ScheduledBuffer};
use crate::sink::{lock, AudioSink, ClipPlayback, EncodedClip, SourceId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Ownership ticket for one playback session.
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    pub id: u64,
    pub token: CancellationToken,
}

impl PlaybackSession {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct PlaybackState {
    scheduler: PlaybackScheduler,
    sink: Option<Arc<dyn AudioSink>>,
    cancel: Option<CancellationToken>,
    clip: Option<SourceId>,
    session: u64,
}

impl PlaybackState {
    fn owns(&self, session: &PlaybackSession) -> bool {
        self.session == session.id && !session.is_cancelled()
    }
}

#[derive(Clone)]
pub struct BargeInController {
    playback: Arc<Mutex<PlaybackState>>,
}

impl BargeInController {
    pub fn new(latency_buffer: Duration) -> Self {
        Self {
            playback: Arc::new(Mutex::new(PlaybackState {
                scheduler: PlaybackScheduler::new(latency_buffer),
                sink: None,
                cancel: None,
                clip: None,
                session: 0,
            })),
        }
    }

    /// Stop all playback now. Idempotent; returns whether anything was active.
    pub fn interrupt(&self) -> bool {
        let mut state = lock(&self.playback);
        let mut interrupted = false;

        if let Some(token) = state.cancel.take() {
            token.cancel();
            interrupted = true;
        }

        let buffers = state.scheduler.take_buffers();
        let clip = state.clip.take();
        if let Some(sink) = state.sink.as_ref() {
            for buffer in &buffers {
                if let Err(e) = sink.stop_source(buffer.source) {
                    debug!(source = buffer.source, error = %e, "stop ignored");
                }
            }
            if let Some(id) = clip {
                if let Err(e) = sink.stop_source(id) {
                    debug!(source = id, error = %e, "clip stop ignored");
                }
                interrupted = true;
            }
        }
        state.scheduler.reset();

        if interrupted {
            info!(
                session = state.session,
                buffers = buffers.len(),
                "⚡ Barge-in: playback interrupted"
            );
        }
        interrupted
    }

    /// Interrupt whatever is playing and open a new session on `sink`.
    pub fn start_session(&self, sink: Arc<dyn AudioSink>, requested_at: Instant) -> PlaybackSession {
        self.interrupt();
        let mut state = lock(&self.playback);
        state.session += 1;
        let token = CancellationToken::new();
        state.scheduler.begin_session(sink.now(), requested_at);
        state.sink = Some(sink);
        state.cancel = Some(token.clone());
        debug!(session = state.session, "Playback session started");
        PlaybackSession {
            id: state.session,
            token,
        }
    }

    /// Decode and schedule one network chunk for `session`.
    ///
    /// Fails with `Aborted` once the session has been interrupted or superseded.
    pub fn push_pcm(
        &self,
        session: &PlaybackSession,
        chunk: &[u8],
        sample_rate: u32,
        channels: u16,
    ) -> VoiceResult<Option<ScheduledBuffer>> {
        let mut state = lock(&self.playback);
        if !state.owns(session) {
            return Err(VoiceError::Aborted);
        }
        let sink = state.sink.clone().ok_or(VoiceError::Aborted)?;
        state
            .scheduler
            .push_pcm(sink.as_ref(), chunk, sample_rate, channels)
    }

    /// Start the non-streaming clip for `session`.
    pub fn play_clip(&self, session: &PlaybackSession, clip: EncodedClip) -> VoiceResult<ClipPlayback> {
        let mut state = lock(&self.playback);
        if !state.owns(session) {
            return Err(VoiceError::Aborted);
        }
        let sink = state.sink.clone().ok_or(VoiceError::Aborted)?;
        let playback = sink.play_clip(clip)?;
        state.clip = Some(playback.id);
        Ok(playback)
    }

    /// Seconds of scheduled audio still to sound, or `None` if the session is gone.
    pub fn remaining(&self, session: &PlaybackSession) -> Option<f64> {
        let mut state = lock(&self.playback);
        if !state.owns(session) {
            return None;
        }
        let now = state.sink.as_ref()?.now();
        state.scheduler.prune_finished(now);
        Some(state.scheduler.remaining(now))
    }

    pub fn time_to_first_audio(&self, session: &PlaybackSession) -> Option<Duration> {
        let state = lock(&self.playback);
        if !state.owns(session) {
            return None;
        }
        state.scheduler.time_to_first_audio()
    }

    /// Release ownership after natural completion. Returns false if the session was already gone.
    pub fn finish_session(&self, session: &PlaybackSession) -> bool {
        let mut state = lock(&self.playback);
        if !state.owns(session) {
            return false;
        }
        state.cancel = None;
        state.clip = None;
        state.scheduler.reset();
        debug!(session = session.id, "Playback session finished");
        true
    }

    /// Whether a session currently owns playback.
    pub fn is_active(&self) -> bool {
        lock(&self.playback).cancel.is_some()
    }

    /// Buffers tracked for the current session.
    pub fn scheduled_buffers(&self) -> Vec<ScheduledBuffer> {
        lock(&self.playback).scheduler.buffers().to_vec()
    }
}

impl Default for BargeInController {
    fn default() -> Self {
        Self::new(Duration::from_millis(80))
    }
}
