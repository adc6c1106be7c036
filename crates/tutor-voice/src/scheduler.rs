//! Gapless scheduling of decoded PCM on the shared sink.
//!
//! The scheduler tracks the playback clock: the sink-clock instant at which the
//! next buffer may begin. Each buffer starts exactly where the previous one ends.
//! Only when the clock has fallen behind the sink (the network was slower than
//! real time) is the start pushed to `now + latency_buffer`; the offset is never
//! accumulated per chunk.

use crate::decoder::SampleDecoder;
use crate::error::VoiceResult;
use crate::sink::{AudioSink, SampleBuffer, SourceId};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// A buffer handed to the sink, with its assigned slot on the sink clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub source: SourceId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    latency_buffer: f64,
    clock: f64,
    decoder: SampleDecoder,
    /// Interleaved samples short of a full frame, carried to the next chunk.
    partial_frame: Vec<f32>,
    buffers: Vec<ScheduledBuffer>,
    requested_at: Option<Instant>,
    time_to_first_audio: Option<Duration>,
}

impl PlaybackScheduler {
    pub fn new(latency_buffer: Duration) -> Self {
        Self {
            latency_buffer: latency_buffer.as_secs_f64(),
            clock: 0.0,
            decoder: SampleDecoder::new(),
            partial_frame: Vec::new(),
            buffers: Vec::new(),
            requested_at: None,
            time_to_first_audio: None,
        }
    }

    /// Start a playback session: clear state and set the clock to `now + latency_buffer`.
    pub fn begin_session(&mut self, sink_now: f64, requested_at: Instant) {
        self.reset();
        self.clock = sink_now + self.latency_buffer;
        self.requested_at = Some(requested_at);
    }

    /// Decode one network chunk and schedule whatever complete frames it yields.
    pub fn push_pcm(
        &mut self,
        sink: &dyn AudioSink,
        chunk: &[u8],
        source_rate: u32,
        channels: u16,
    ) -> VoiceResult<Option<ScheduledBuffer>> {
        let mut samples = std::mem::take(&mut self.partial_frame);
        samples.extend(self.decoder.decode(chunk));

        let channels = channels.max(1) as usize;
        let whole = samples.len() - samples.len() % channels;
        self.partial_frame = samples.split_off(whole);

        self.schedule(sink, samples, source_rate, channels as u16)
    }

    /// Schedule decoded samples back to back with the previous buffer.
    ///
    /// Returns `None` for an empty sample slice (nothing to play).
    pub fn schedule(
        &mut self,
        sink: &dyn AudioSink,
        samples: Vec<f32>,
        source_rate: u32,
        channels: u16,
    ) -> VoiceResult<Option<ScheduledBuffer>> {
        if samples.is_empty() {
            return Ok(None);
        }
        let buffer = SampleBuffer::new(samples, source_rate, channels);
        let duration = buffer.duration_secs();

        let now = sink.now();
        let start = if self.clock < now {
            debug!(behind = now - self.clock, "Playback clock fell behind; re-seeding with latency buffer");
            now + self.latency_buffer
        } else {
            self.clock
        };

        let source = sink.start_buffer(buffer, start)?;
        let scheduled = ScheduledBuffer {
            source,
            start,
            duration,
        };
        self.clock = scheduled.end();
        self.buffers.push(scheduled);

        if self.time_to_first_audio.is_none() {
            if let Some(requested_at) = self.requested_at {
                let elapsed = requested_at.elapsed();
                self.time_to_first_audio = Some(elapsed);
                info!(ms = elapsed.as_millis() as u64, "⚡ Time to first audio");
            }
        }

        Ok(Some(scheduled))
    }

    /// Next available start instant on the sink clock.
    pub fn playback_clock(&self) -> f64 {
        self.clock
    }

    /// Seconds of scheduled audio still to sound after `sink_now`.
    pub fn remaining(&self, sink_now: f64) -> f64 {
        if self.buffers.is_empty() {
            return 0.0;
        }
        (self.clock - sink_now).max(0.0)
    }

    pub fn buffers(&self) -> &[ScheduledBuffer] {
        &self.buffers
    }

    /// Forget buffers that finished playing before `sink_now`.
    pub fn prune_finished(&mut self, sink_now: f64) {
        self.buffers.retain(|b| b.end() > sink_now);
    }

    /// Hand over every tracked buffer (for stopping) and clear the list.
    pub fn take_buffers(&mut self) -> Vec<ScheduledBuffer> {
        std::mem::take(&mut self.buffers)
    }

    pub fn time_to_first_audio(&self) -> Option<Duration> {
        self.time_to_first_audio
    }

    pub fn residual(&self) -> Option<u8> {
        self.decoder.residual()
    }

    /// Clear clock, residual byte, partial frame, buffer list and first-audio metric.
    pub fn reset(&mut self) {
        self.clock = 0.0;
        self.decoder.reset();
        self.partial_frame.clear();
        self.buffers.clear();
        self.requested_at = None;
        self.time_to_first_audio = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::VirtualSink;

    const RATE: u32 = 1000;

    fn scheduler() -> PlaybackScheduler {
        PlaybackScheduler::new(Duration::from_millis(80))
    }

    #[test]
    fn first_buffer_starts_after_latency_buffer() {
        let sink = VirtualSink::manual();
        let mut s = scheduler();
        s.begin_session(sink.now(), Instant::now());
        let b = s.schedule(&sink, vec![0.0; 100], RATE, 1).unwrap().unwrap();
        assert!((b.start - 0.08).abs() < 1e-9);
        assert!((b.duration - 0.1).abs() < 1e-9);
        assert!((s.playback_clock() - 0.18).abs() < 1e-9);
        assert!(s.time_to_first_audio().is_some());
    }

    #[test]
    fn empty_samples_schedule_nothing() {
        let sink = VirtualSink::manual();
        let mut s = scheduler();
        s.begin_session(sink.now(), Instant::now());
        assert!(s.schedule(&sink, Vec::new(), RATE, 1).unwrap().is_none());
        assert!(sink.sources().is_empty());
        assert!(s.time_to_first_audio().is_none());
    }

    #[test]
    fn gapless_under_jitter() {
        let sink = VirtualSink::manual();
        let mut s = scheduler();
        s.begin_session(sink.now(), Instant::now());

        // (chunk samples, arrival delay before the chunk in seconds)
        let script: [(usize, f64); 10] = [
            (50, 0.0),
            (120, 0.01),
            (30, 0.02),
            (200, 0.3), // stall: clock falls behind
            (64, 0.0),
            (1, 0.05),
            (90, 0.1),
            (90, 0.9), // stall again
            (10, 0.0),
            (500, 0.01),
        ];

        let mut prev: Option<ScheduledBuffer> = None;
        for (len, delay) in script {
            sink.advance(delay);
            let now = sink.now();
            let b = s.schedule(&sink, vec![0.1; len], RATE, 1).unwrap().unwrap();
            if let Some(p) = prev {
                assert!(b.start >= p.end() - 1e-12, "overlap at {:?}", b);
                if p.end() >= now {
                    assert!((b.start - p.end()).abs() < 1e-12, "gap at {:?}", b);
                } else {
                    assert!((b.start - (now + 0.08)).abs() < 1e-12);
                }
            }
            prev = Some(b);
        }
        assert_eq!(s.buffers().len(), 10);
    }

    #[test]
    fn latency_is_not_cumulative() {
        let sink = VirtualSink::manual();
        let mut s = scheduler();
        s.begin_session(sink.now(), Instant::now());
        for _ in 0..20 {
            s.schedule(&sink, vec![0.0; 10], RATE, 1).unwrap();
        }
        // 20 * 10ms of audio after the single 80ms offset
        assert!((s.playback_clock() - 0.28).abs() < 1e-9);
    }

    #[test]
    fn push_pcm_carries_split_samples() {
        let sink = VirtualSink::manual();
        let mut s = scheduler();
        s.begin_session(sink.now(), Instant::now());
        let bytes: Vec<u8> = [100i16, -100, 200].iter().flat_map(|v| v.to_le_bytes()).collect();
        let first = s.push_pcm(&sink, &bytes[..3], RATE, 1).unwrap().unwrap();
        assert_eq!(s.residual(), Some(bytes[2]));
        let second = s.push_pcm(&sink, &bytes[3..], RATE, 1).unwrap().unwrap();
        assert_eq!(sink.buffers()[0].frames + sink.buffers()[1].frames, 3);
        assert!((second.start - first.end()).abs() < 1e-12);
        assert!(s.residual().is_none());
    }

    #[test]
    fn push_pcm_holds_partial_stereo_frame() {
        let sink = VirtualSink::manual();
        let mut s = scheduler();
        s.begin_session(sink.now(), Instant::now());
        let bytes: Vec<u8> = [1i16, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        s.push_pcm(&sink, &bytes, RATE, 2).unwrap();
        assert_eq!(sink.buffers()[0].frames, 1);
        let more: Vec<u8> = 4i16.to_le_bytes().to_vec();
        s.push_pcm(&sink, &more, RATE, 2).unwrap();
        assert_eq!(sink.buffers()[1].frames, 1);
    }

    #[test]
    fn reset_clears_everything() {
        let sink = VirtualSink::manual();
        let mut s = scheduler();
        s.begin_session(sink.now(), Instant::now());
        s.push_pcm(&sink, &[1, 2, 3], RATE, 1).unwrap();
        s.reset();
        assert!(s.buffers().is_empty());
        assert!(s.residual().is_none());
        assert_eq!(s.playback_clock(), 0.0);
        assert!(s.time_to_first_audio().is_none());
        assert_eq!(s.remaining(0.0), 0.0);
    }

    #[test]
    fn remaining_counts_down() {
        let sink = VirtualSink::manual();
        let mut s = scheduler();
        s.begin_session(sink.now(), Instant::now());
        s.schedule(&sink, vec![0.0; 200], RATE, 1).unwrap();
        assert!((s.remaining(sink.now()) - 0.28).abs() < 1e-9);
        sink.advance(0.1);
        s.prune_finished(sink.now());
        assert_eq!(s.buffers().len(), 1);
        assert!((s.remaining(sink.now()) - 0.18).abs() < 1e-9);
    }
}
