//! Turn-taking state machine over capture and playback.
//!
//! ```text
//! Idle ──speak/speak_stream──▶ Speaking ──(audio finished)──▶ Idle
//! Idle ──start_recording─────▶ Listening ──stop_recording──▶ Processing ──▶ Idle
//! any  ──interrupt───────────▶ Idle
//! ```
//!
//! Every operation takes a generation number when it starts. When it settles
//! it only writes controller state if the generation is unchanged, so a
//! superseded or interrupted operation can never move the machine.

use crate::barge_in::{BargeInController, PlaybackSession};
use crate::capture::{CaptureSession, MicrophoneSource, Transcript};
use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::sink::{lock, AudioSink, EncodedClip, SinkSlot};
use crate::synthesis::{synthesize_with_retry, SpeechSynthesizer};
use crate::transcription::Transcriber;
use futures::StreamExt;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionState {
    Idle,
    Speaking,
    Listening,
    Processing,
}

/// How a speak call ended. Barge-in is an outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Interrupted,
}

/// Snapshot for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceStatus {
    pub state: InteractionState,
    pub is_recording: bool,
    pub is_speaking: bool,
    pub is_transcribing: bool,
    pub recording_duration_seconds: u64,
    pub time_to_first_audio_ms: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug)]
struct ControllerState {
    state: InteractionState,
    generation: u64,
    error: Option<String>,
    time_to_first_audio_ms: Option<f64>,
}

pub struct VoiceInteractionController {
    config: VoiceConfig,
    sink_slot: Arc<SinkSlot>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    capture: CaptureSession,
    barge_in: BargeInController,
    shared: Mutex<ControllerState>,
}

impl VoiceInteractionController {
    pub fn new(
        config: VoiceConfig,
        sink_slot: Arc<SinkSlot>,
        microphone: Arc<dyn MicrophoneSource>,
        transcriber: Arc<dyn Transcriber>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        let capture = CaptureSession::new(microphone, transcriber, &config);
        let barge_in = BargeInController::new(config.latency_buffer());
        Self {
            config,
            sink_slot,
            synthesizer,
            capture,
            barge_in,
            shared: Mutex::new(ControllerState {
                state: InteractionState::Idle,
                generation: 0,
                error: None,
                time_to_first_audio_ms: None,
            }),
        }
    }

    pub fn state(&self) -> InteractionState {
        lock(&self.shared).state
    }

    pub fn status(&self) -> VoiceStatus {
        let shared = lock(&self.shared);
        VoiceStatus {
            state: shared.state,
            // False while the microphone is still being acquired.
            is_recording: shared.state == InteractionState::Listening
                && self.capture.is_recording(),
            is_speaking: shared.state == InteractionState::Speaking,
            is_transcribing: shared.state == InteractionState::Processing,
            recording_duration_seconds: self.capture.duration_seconds(),
            time_to_first_audio_ms: shared.time_to_first_audio_ms,
            error: shared.error.clone(),
        }
    }

    pub fn barge_in(&self) -> &BargeInController {
        &self.barge_in
    }

    /// Stop everything and return to `Idle`. Synchronous and idempotent.
    pub fn interrupt(&self) {
        let playback = self.barge_in.interrupt();
        self.capture.cancel_recording();
        let mut shared = lock(&self.shared);
        shared.generation += 1;
        if shared.state != InteractionState::Idle || playback {
            info!(from = ?shared.state, "⏹️ Interrupted");
        }
        shared.state = InteractionState::Idle;
    }

    /// Acquire the microphone and enter `Listening`. Barges in on any playback first.
    pub async fn start_recording(&self) -> VoiceResult<()> {
        let generation = {
            let mut shared = lock(&self.shared);
            match shared.state {
                InteractionState::Idle => {}
                InteractionState::Speaking => {
                    self.barge_in.interrupt();
                    debug!("Barge-in: recording requested while speaking");
                }
                other => {
                    return Err(VoiceError::InvalidState(format!(
                        "cannot start recording while {:?}",
                        other
                    )))
                }
            }
            shared.generation += 1;
            shared.state = InteractionState::Listening;
            shared.error = None;
            shared.generation
        };

        match self.capture.start_recording().await {
            Ok(()) => {
                if lock(&self.shared).generation != generation {
                    self.capture.cancel_recording();
                    debug!("Recording superseded during acquisition; microphone released");
                    return Err(VoiceError::Aborted);
                }
                Ok(())
            }
            Err(e) => {
                self.fail(generation, &e);
                Err(e)
            }
        }
    }

    /// Stop recording and transcribe. `Listening -> Processing -> Idle`.
    pub async fn stop_recording(&self) -> VoiceResult<Transcript> {
        let generation = {
            let mut shared = lock(&self.shared);
            if shared.state != InteractionState::Listening {
                return Err(VoiceError::InvalidState(format!(
                    "cannot stop recording while {:?}",
                    shared.state
                )));
            }
            shared.generation += 1;
            shared.state = InteractionState::Processing;
            shared.generation
        };

        let result = self.capture.stop_recording().await;

        {
            let mut shared = lock(&self.shared);
            if shared.generation != generation {
                debug!("Transcription settled after interrupt; discarding");
                return Err(VoiceError::Aborted);
            }
            if result.is_ok() {
                shared.state = InteractionState::Idle;
            }
        }
        match result {
            Ok(transcript) => {
                info!(text = %transcript.text, "📝 Transcript ready");
                Ok(transcript)
            }
            Err(e) => {
                self.fail(generation, &e);
                Err(e)
            }
        }
    }

    /// Discard the current recording without transcribing it.
    pub fn cancel_recording(&self) {
        self.capture.cancel_recording();
        let mut shared = lock(&self.shared);
        if matches!(
            shared.state,
            InteractionState::Listening | InteractionState::Processing
        ) {
            shared.generation += 1;
            shared.state = InteractionState::Idle;
        }
    }

    /// Synthesize `text` as one clip and play it to the end.
    pub async fn speak(&self, text: &str) -> VoiceResult<PlaybackOutcome> {
        let (generation, session) = self.begin_playback()?;
        let guard = PlaybackGuard::new(self, generation, &session);
        let outcome = self.play_clip_session(generation, &session, text).await;
        guard.disarm();
        outcome
    }

    async fn play_clip_session(
        &self,
        generation: u64,
        session: &PlaybackSession,
        text: &str,
    ) -> VoiceResult<PlaybackOutcome> {
        let synthesized = tokio::select! {
            biased;
            _ = session.token.cancelled() => return Ok(PlaybackOutcome::Interrupted),
            result = synthesize_with_retry(
                self.synthesizer.as_ref(),
                text,
                &self.config.voice_id,
                self.config.synthesis_retry_backoff(),
            ) => result,
        };
        let audio = match synthesized {
            Ok(audio) => audio,
            Err(e) => return self.playback_failed(generation, session, e),
        };

        let clip = EncodedClip {
            bytes: audio.bytes,
            format_tag: audio.format_tag,
        };
        let playback = match self.barge_in.play_clip(session, clip) {
            Ok(playback) => playback,
            Err(e) => return self.playback_failed(generation, session, e),
        };
        info!(source = playback.id, "🔊 Playing synthesized clip");

        let finished = tokio::select! {
            biased;
            _ = session.token.cancelled() => false,
            done = playback.finished => done.is_ok(),
        };
        if !finished {
            return Ok(PlaybackOutcome::Interrupted);
        }
        Ok(self.finish_playback(generation, session))
    }

    /// Stream synthesized PCM into the scheduler, then wait for buffered audio to drain.
    pub async fn speak_stream(&self, text: &str) -> VoiceResult<PlaybackOutcome> {
        let (generation, session) = self.begin_playback()?;
        let guard = PlaybackGuard::new(self, generation, &session);
        let outcome = self.stream_session(generation, &session, text).await;
        guard.disarm();
        outcome
    }

    async fn stream_session(
        &self,
        generation: u64,
        session: &PlaybackSession,
        text: &str,
    ) -> VoiceResult<PlaybackOutcome> {
        let opened = tokio::select! {
            biased;
            _ = session.token.cancelled() => return Ok(PlaybackOutcome::Interrupted),
            result = self.synthesizer.stream(text, &self.config.voice_id) => result,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.playback_failed(generation, session, e),
        };
        debug!(
            rate = stream.sample_rate,
            channels = stream.channels,
            server_total_ms = ?stream.timing.total_ms,
            server_first_chunk_ms = ?stream.timing.first_chunk_ms,
            "Synthesis stream opened"
        );

        let mut chunks = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = session.token.cancelled() => return Ok(PlaybackOutcome::Interrupted),
                next = stream.chunks.next() => next,
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return self.playback_failed(generation, session, e),
                None => break,
            };
            chunks += 1;
            match self
                .barge_in
                .push_pcm(session, &chunk, stream.sample_rate, stream.channels)
            {
                Ok(Some(_)) => self.record_first_audio(generation, session),
                Ok(None) => {}
                Err(e) if e.is_aborted() => return Ok(PlaybackOutcome::Interrupted),
                Err(e) => return self.playback_failed(generation, session, e),
            }
        }
        drop(stream);
        debug!(chunks, "Synthesis stream complete; draining scheduled audio");

        // Audio is still sounding after the network stream ends.
        loop {
            let Some(remaining) = self.barge_in.remaining(session) else {
                return Ok(PlaybackOutcome::Interrupted);
            };
            if remaining <= 0.0 {
                break;
            }
            let wait = Duration::from_secs_f64(remaining).max(Duration::from_millis(1));
            tokio::select! {
                biased;
                _ = session.token.cancelled() => return Ok(PlaybackOutcome::Interrupted),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        Ok(self.finish_playback(generation, session))
    }

    /// Cancel any recording, stop playback and close the sink.
    pub fn shutdown(&self) {
        self.interrupt();
        self.sink_slot.close_on_teardown();
        info!("🔇 Voice engine shut down");
    }

    /// Enter `Speaking` and open a playback session, interrupting any previous one.
    fn begin_playback(&self) -> VoiceResult<(u64, PlaybackSession)> {
        let requested_at = Instant::now();
        let generation = {
            let mut shared = lock(&self.shared);
            if shared.state == InteractionState::Listening {
                return Err(VoiceError::InvalidState(
                    "cannot speak while recording".to_string(),
                ));
            }
            shared.generation += 1;
            shared.state = InteractionState::Speaking;
            shared.error = None;
            shared.time_to_first_audio_ms = None;
            shared.generation
        };
        self.barge_in.interrupt();

        let sink = match self.acquire_sink() {
            Ok(sink) => sink,
            Err(e) => {
                self.fail(generation, &e);
                return Err(e);
            }
        };
        let session = self.barge_in.start_session(sink, requested_at);
        Ok((generation, session))
    }

    fn acquire_sink(&self) -> VoiceResult<Arc<dyn AudioSink>> {
        let sink = self.sink_slot.acquire_or_reuse()?;
        self.sink_slot.resume_if_suspended()?;
        Ok(sink)
    }

    fn record_first_audio(&self, generation: u64, session: &PlaybackSession) {
        let Some(ttfa) = self.barge_in.time_to_first_audio(session) else {
            return;
        };
        let mut shared = lock(&self.shared);
        if shared.generation == generation && shared.time_to_first_audio_ms.is_none() {
            shared.time_to_first_audio_ms = Some(ttfa.as_secs_f64() * 1000.0);
        }
    }

    fn finish_playback(&self, generation: u64, session: &PlaybackSession) -> PlaybackOutcome {
        if !self.barge_in.finish_session(session) {
            return PlaybackOutcome::Interrupted;
        }
        let mut shared = lock(&self.shared);
        if shared.generation == generation {
            shared.state = InteractionState::Idle;
        }
        info!("✅ Playback finished");
        PlaybackOutcome::Completed
    }

    /// Tear down a failed session. `Aborted` becomes an outcome.
    fn playback_failed(
        &self,
        generation: u64,
        session: &PlaybackSession,
        err: VoiceError,
    ) -> VoiceResult<PlaybackOutcome> {
        if err.is_aborted() || session.is_cancelled() {
            return Ok(PlaybackOutcome::Interrupted);
        }
        // Not cancelled, so this session still owns playback.
        self.barge_in.interrupt();
        self.fail(generation, &err);
        Err(err)
    }

    /// Back to `Idle` with the user-facing message set and metrics cleared.
    fn fail(&self, generation: u64, err: &VoiceError) {
        let mut shared = lock(&self.shared);
        if shared.generation != generation {
            return;
        }
        shared.state = InteractionState::Idle;
        shared.time_to_first_audio_ms = None;
        match err.user_message() {
            Some(message) => {
                error!(error = %err, "Voice operation failed");
                shared.error = Some(message);
            }
            None => debug!("Operation aborted"),
        }
    }
}

/// Tears down a playback session whose future is dropped before it settles.
struct PlaybackGuard<'a> {
    controller: &'a VoiceInteractionController,
    generation: u64,
    session: PlaybackSession,
    armed: bool,
}

impl<'a> PlaybackGuard<'a> {
    fn new(
        controller: &'a VoiceInteractionController,
        generation: u64,
        session: &PlaybackSession,
    ) -> Self {
        Self {
            controller,
            generation,
            session: session.clone(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PlaybackGuard<'_> {
    fn drop(&mut self) {
        // A cancelled session was already torn down by whoever superseded it.
        if !self.armed || self.session.is_cancelled() {
            return;
        }
        self.controller.barge_in.interrupt();
        let mut shared = lock(&self.controller.shared);
        if shared.generation == self.generation {
            shared.generation += 1;
            shared.state = InteractionState::Idle;
        }
        debug!(session = self.session.id, "Playback dropped before settling; stopped");
    }
}

impl Drop for VoiceInteractionController {
    fn drop(&mut self) {
        if self.barge_in.interrupt() {
            warn!("Controller dropped during playback");
        }
    }
}
