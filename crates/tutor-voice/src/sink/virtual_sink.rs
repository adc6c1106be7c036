//! Headless sink. Renders nothing; records every scheduled source so playback
//! timing can be inspected. The clock follows tokio time (so it advances under
//! paused test time) or is advanced by hand.

use super::{lock, playback_error, AudioSink, ClipPlayback, EncodedClip, SampleBuffer, SourceId};
use crate::error::VoiceResult;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Buffer,
    Clip,
}

/// One source as seen by the virtual device.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualSource {
    pub id: SourceId,
    pub kind: SourceKind,
    pub start: f64,
    pub duration: f64,
    pub frames: usize,
    pub stopped_at: Option<f64>,
}

impl VirtualSource {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Whether this source would still produce sound at or after `t`.
    pub fn sounding_at(&self, t: f64) -> bool {
        match self.stopped_at {
            Some(stopped) => stopped > t && self.end() > t,
            None => self.end() > t,
        }
    }
}

enum Clock {
    Tokio(tokio::time::Instant),
    Manual(Mutex<f64>),
}

#[derive(Default)]
struct VirtualState {
    next_id: SourceId,
    sources: Vec<VirtualSource>,
    clip_done: HashMap<SourceId, oneshot::Sender<()>>,
    suspended: bool,
    closed: bool,
    resumes: usize,
}

pub struct VirtualSink {
    clock: Clock,
    state: Arc<Mutex<VirtualState>>,
    clip_duration: Duration,
}

impl VirtualSink {
    /// Clock driven by `tokio::time`. Must be created inside a runtime.
    pub fn new() -> Self {
        Self::with_clock(Clock::Tokio(tokio::time::Instant::now()))
    }

    /// Clock that only moves on [`VirtualSink::advance`].
    pub fn manual() -> Self {
        Self::with_clock(Clock::Manual(Mutex::new(0.0)))
    }

    fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(VirtualState::default())),
            clip_duration: Duration::from_secs(1),
        }
    }

    /// Playback length reported for every clip (encoded payloads are not decoded).
    pub fn with_clip_duration(mut self, duration: Duration) -> Self {
        self.clip_duration = duration;
        self
    }

    /// Move a manual clock forward and complete clips that have ended. No-op on a tokio clock.
    pub fn advance(&self, secs: f64) {
        let Clock::Manual(t) = &self.clock else {
            return;
        };
        let now = {
            let mut t = lock(t);
            *t += secs;
            *t
        };
        let mut state = lock(&self.state);
        let due: Vec<SourceId> = state
            .sources
            .iter()
            .filter(|s| s.kind == SourceKind::Clip && s.stopped_at.is_none() && s.end() <= now)
            .map(|s| s.id)
            .collect();
        for id in due {
            if let Some(tx) = state.clip_done.remove(&id) {
                let _ = tx.send(());
            }
        }
    }

    pub fn suspend(&self) {
        lock(&self.state).suspended = true;
    }

    pub fn resume_count(&self) -> usize {
        lock(&self.state).resumes
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn sources(&self) -> Vec<VirtualSource> {
        lock(&self.state).sources.clone()
    }

    /// Scheduled sample buffers, in scheduling order.
    pub fn buffers(&self) -> Vec<VirtualSource> {
        self.sources()
            .into_iter()
            .filter(|s| s.kind == SourceKind::Buffer)
            .collect()
    }

    /// Sources that are playing now or will play later.
    pub fn active_sources(&self) -> usize {
        let now = self.now();
        lock(&self.state)
            .sources
            .iter()
            .filter(|s| s.sounding_at(now))
            .count()
    }

    fn push(&self, kind: SourceKind, start: f64, duration: f64, frames: usize) -> VoiceResult<SourceId> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(playback_error("sink closed"));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.sources.push(VirtualSource {
            id,
            kind,
            start,
            duration,
            frames,
            stopped_at: None,
        });
        Ok(id)
    }
}

impl Default for VirtualSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for VirtualSink {
    fn now(&self) -> f64 {
        match &self.clock {
            Clock::Tokio(origin) => origin.elapsed().as_secs_f64(),
            Clock::Manual(t) => *lock(t),
        }
    }

    fn is_suspended(&self) -> bool {
        lock(&self.state).suspended
    }

    fn resume_if_suspended(&self) -> VoiceResult<()> {
        let mut state = lock(&self.state);
        if state.suspended {
            state.suspended = false;
            state.resumes += 1;
        }
        Ok(())
    }

    fn start_buffer(&self, buffer: SampleBuffer, at: f64) -> VoiceResult<SourceId> {
        let start = at.max(self.now());
        let id = self.push(SourceKind::Buffer, start, buffer.duration_secs(), buffer.frames())?;
        debug!(source = id, start, frames = buffer.frames(), "virtual buffer scheduled");
        Ok(id)
    }

    fn stop_source(&self, id: SourceId) -> VoiceResult<()> {
        let now = self.now();
        let mut state = lock(&self.state);
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| playback_error(format!("unknown source {}", id)))?;
        if source.stopped_at.is_some() {
            return Ok(());
        }
        if source.end() <= now {
            return Err(playback_error(format!("source {} already finished", id)));
        }
        source.stopped_at = Some(now);
        state.clip_done.remove(&id);
        Ok(())
    }

    fn play_clip(&self, clip: EncodedClip) -> VoiceResult<ClipPlayback> {
        if clip.bytes.is_empty() {
            return Err(playback_error("empty clip"));
        }
        let duration = self.clip_duration;
        let id = self.push(SourceKind::Clip, self.now(), duration.as_secs_f64(), 0)?;
        let (tx, rx) = oneshot::channel();
        lock(&self.state).clip_done.insert(id, tx);

        if let Clock::Tokio(_) = self.clock {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if let Some(tx) = lock(&state).clip_done.remove(&id) {
                    let _ = tx.send(());
                }
            });
        }
        Ok(ClipPlayback { id, finished: rx })
    }

    fn close(&self) {
        let now = self.now();
        let mut state = lock(&self.state);
        state.closed = true;
        state.clip_done.clear();
        for source in state.sources.iter_mut() {
            if source.stopped_at.is_none() && source.end() > now {
                source.stopped_at = Some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let sink = VirtualSink::manual();
        assert_eq!(sink.now(), 0.0);
        sink.advance(0.5);
        assert!((sink.now() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn stopping_a_finished_source_fails() {
        let sink = VirtualSink::manual();
        let id = sink
            .start_buffer(SampleBuffer::new(vec![0.0; 100], 1000, 1), 0.0)
            .unwrap();
        sink.advance(0.2);
        assert!(sink.stop_source(id).is_err());
        assert_eq!(sink.active_sources(), 0);
    }

    #[test]
    fn stopping_a_pending_source_silences_it() {
        let sink = VirtualSink::manual();
        let id = sink
            .start_buffer(SampleBuffer::new(vec![0.0; 100], 1000, 1), 1.0)
            .unwrap();
        assert_eq!(sink.active_sources(), 1);
        sink.stop_source(id).unwrap();
        assert_eq!(sink.active_sources(), 0);
        // idempotent
        sink.stop_source(id).unwrap();
    }

    #[test]
    fn manual_clip_completes_on_advance() {
        let sink = VirtualSink::manual().with_clip_duration(Duration::from_millis(300));
        let mut clip = sink
            .play_clip(EncodedClip {
                bytes: vec![1, 2, 3],
                format_tag: "audio/mpeg".into(),
            })
            .unwrap();
        assert!(clip.finished.try_recv().is_err());
        sink.advance(0.3);
        assert!(clip.finished.try_recv().is_ok());
    }
}
