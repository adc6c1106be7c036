//! End-to-end tests for the voice interaction engine.
//!
//! Everything runs on paused tokio time against a `VirtualSink`, a scripted
//! microphone and a scripted synthesis stream. Hardware tests are `#[ignore]`d.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tutor_voice::{
    AcquiredDevice, AudioSink, CaptureChunk, CaptureDevice, CaptureFormat, FixedTranscriber,
    InteractionState, MicrophoneSource, PcmStream, PlaybackOutcome, SinkSlot, SpeechSynthesizer,
    SynthesisTiming, SynthesizedAudio, Transcriber, VirtualSink, VoiceConfig, VoiceError,
    VoiceInteractionController, VoiceResult,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Microphone whose chunks are pushed by the test.
#[derive(Default)]
struct ScriptedMicrophone {
    deny: bool,
    /// Time to grant access, like a permission prompt.
    acquire_delay: Duration,
    sender: Mutex<Option<mpsc::UnboundedSender<CaptureChunk>>>,
    released: Arc<AtomicUsize>,
}

impl ScriptedMicrophone {
    fn denied() -> Self {
        Self {
            deny: true,
            ..Default::default()
        }
    }

    fn slow(acquire_delay: Duration) -> Self {
        Self {
            acquire_delay,
            ..Default::default()
        }
    }

    fn feed(&self, bytes: Vec<u8>) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(CaptureChunk::new(bytes));
        }
    }

    fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct ScriptedDevice {
    released: Arc<AtomicUsize>,
}

impl CaptureDevice for ScriptedDevice {
    fn release(self: Box<Self>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MicrophoneSource for ScriptedMicrophone {
    async fn acquire(&self) -> VoiceResult<AcquiredDevice> {
        if !self.acquire_delay.is_zero() {
            tokio::time::sleep(self.acquire_delay).await;
        }
        if self.deny {
            return Err(VoiceError::DeviceAccessDenied("permission refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        Ok(AcquiredDevice {
            device: Box::new(ScriptedDevice {
                released: Arc::clone(&self.released),
            }),
            chunks: rx,
            format: CaptureFormat::Pcm16 {
                sample_rate: 16000,
                channels: 1,
            },
        })
    }
}

/// Records whether the microphone had been released when transcription began.
struct ReleaseCheckingTranscriber {
    released: Arc<AtomicUsize>,
    saw_released: AtomicBool,
}

#[async_trait]
impl Transcriber for ReleaseCheckingTranscriber {
    async fn transcribe(&self, _audio: &[u8], _format_tag: &str) -> VoiceResult<String> {
        self.saw_released
            .store(self.released.load(Ordering::SeqCst) > 0, Ordering::SeqCst);
        Ok("chlorophyll".into())
    }
}

/// Streams a fixed PCM script, one chunk per `delay`.
struct ScriptedSynthesizer {
    chunks: Vec<Vec<u8>>,
    delay: Duration,
    consumed: Arc<AtomicUsize>,
    streams: AtomicUsize,
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, _text: &str, _voice_id: &str) -> VoiceResult<SynthesizedAudio> {
        tokio::time::sleep(self.delay).await;
        Ok(SynthesizedAudio {
            bytes: vec![0x49, 0x44, 0x33, 0x04],
            format_tag: "audio/mpeg".into(),
        })
    }

    async fn stream(&self, _text: &str, _voice_id: &str) -> VoiceResult<PcmStream> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let consumed = Arc::clone(&self.consumed);
        let chunks = futures::stream::iter(self.chunks.clone())
            .then(move |chunk| {
                let consumed = Arc::clone(&consumed);
                async move {
                    tokio::time::sleep(delay).await;
                    consumed.fetch_add(1, Ordering::SeqCst);
                    Ok(chunk)
                }
            })
            .boxed();
        Ok(PcmStream {
            sample_rate: 24000,
            channels: 1,
            timing: SynthesisTiming::default(),
            chunks,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// 100 ms of 24 kHz mono s16le per 4800 bytes, split at odd offsets.
fn pcm_script(chunks: usize) -> Vec<Vec<u8>> {
    let pcm: Vec<u8> = (0..chunks * 2400)
        .flat_map(|i| ((i % 2000) as i16 - 1000).to_le_bytes())
        .collect();
    let mut out = Vec::new();
    let mut offset = 0;
    for i in 0..chunks {
        let mut end = (i + 1) * 4800;
        if i + 1 < chunks {
            end += if i % 2 == 0 { 1 } else { 0 };
        }
        out.push(pcm[offset..end].to_vec());
        offset = end;
    }
    out
}

struct Harness {
    controller: Arc<VoiceInteractionController>,
    sink: Arc<VirtualSink>,
    mic: Arc<ScriptedMicrophone>,
    stt: Arc<FixedTranscriber>,
    consumed: Arc<AtomicUsize>,
    synth: Arc<ScriptedSynthesizer>,
}

fn harness_with(mic: ScriptedMicrophone, chunks: usize) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sink = Arc::new(VirtualSink::new());
    let handle = Arc::clone(&sink);
    let slot = Arc::new(SinkSlot::new(move || {
        Ok(Arc::clone(&handle) as Arc<dyn AudioSink>)
    }));
    let mic = Arc::new(mic);
    let stt = Arc::new(FixedTranscriber::new("photosynthesis"));
    let consumed = Arc::new(AtomicUsize::new(0));
    let synth = Arc::new(ScriptedSynthesizer {
        chunks: pcm_script(chunks),
        delay: Duration::from_millis(50),
        consumed: Arc::clone(&consumed),
        streams: AtomicUsize::new(0),
    });
    let controller = Arc::new(VoiceInteractionController::new(
        VoiceConfig::default(),
        slot,
        mic.clone(),
        stt.clone(),
        synth.clone(),
    ));
    Harness {
        controller,
        sink,
        mic,
        stt,
        consumed,
        synth,
    }
}

fn harness(chunks: usize) -> Harness {
    harness_with(ScriptedMicrophone::default(), chunks)
}

async fn wait_for_buffers(sink: &VirtualSink, n: usize) {
    while sink.buffers().len() < n {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

async fn record(h: &Harness, chunks: usize, chunk_bytes: usize) {
    h.controller.start_recording().await.unwrap();
    for _ in 0..chunks {
        h.mic.feed(vec![0x11; chunk_bytes]);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_record_transcribe_then_speak() {
    let h = harness(5);

    // 3 seconds of 16 kHz mono in 100 ms chunks
    record(&h, 30, 3200).await;
    assert_eq!(h.controller.state(), InteractionState::Listening);
    assert!(h.controller.status().recording_duration_seconds >= 2);

    let transcript = h.controller.stop_recording().await.unwrap();
    assert_eq!(transcript.text, "photosynthesis");
    assert_eq!(transcript.format_tag, "audio/wav");
    assert_eq!(transcript.audio.len(), 44 + 30 * 3200);
    assert_eq!(h.stt.calls(), 1);
    assert_eq!(h.mic.released(), 1);
    assert_eq!(h.controller.state(), InteractionState::Idle);

    let outcome = h.controller.speak_stream("Great job!").await.unwrap();
    assert_eq!(outcome, PlaybackOutcome::Completed);

    let buffers = h.sink.buffers();
    assert!(!buffers.is_empty());
    let frames: usize = buffers.iter().map(|b| b.frames).sum();
    assert_eq!(frames, 5 * 2400);
    for pair in buffers.windows(2) {
        assert!((pair[1].start - pair[0].end()).abs() < 1e-9);
    }

    let status = h.controller.status();
    assert_eq!(status.state, InteractionState::Idle);
    assert!(status.time_to_first_audio_ms.unwrap() > 0.0);
    assert!(status.error.is_none());
    assert!(h.controller.barge_in().scheduled_buffers().is_empty());
    assert_eq!(h.sink.active_sources(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_stops_sound_and_network_read() {
    let h = harness(6);
    let controller = Arc::clone(&h.controller);
    let speaking = tokio::spawn(async move { controller.speak_stream("A long answer").await });

    wait_for_buffers(&h.sink, 2).await;
    assert_eq!(h.controller.state(), InteractionState::Speaking);
    h.controller.interrupt();
    assert_eq!(h.controller.state(), InteractionState::Idle);

    let outcome = speaking.await.unwrap().unwrap();
    assert_eq!(outcome, PlaybackOutcome::Interrupted);

    let now = h.sink.now();
    assert_eq!(h.sink.active_sources(), 0);
    assert!(h.sink.buffers().iter().all(|b| !b.sounding_at(now)));

    // Remaining chunks were never pulled off the stream.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.consumed.load(Ordering::SeqCst), 2);
    assert_eq!(h.sink.buffers().len(), 2);
    assert!(!h.sink.is_closed());
    assert!(h.controller.status().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_speak_stream_is_single_flight() {
    let h = harness(4);
    let controller = Arc::clone(&h.controller);
    let first = tokio::spawn(async move { controller.speak_stream("first").await });

    wait_for_buffers(&h.sink, 1).await;
    let first_ids: Vec<_> = h.sink.buffers().iter().map(|b| b.id).collect();

    let second = h.controller.speak_stream("second").await.unwrap();
    assert_eq!(second, PlaybackOutcome::Completed);
    assert_eq!(
        first.await.unwrap().unwrap(),
        PlaybackOutcome::Interrupted
    );

    let buffers = h.sink.buffers();
    for b in buffers.iter().filter(|b| first_ids.contains(&b.id)) {
        assert!(b.stopped_at.is_some(), "first session buffer {} kept playing", b.id);
    }
    let second_frames: usize = buffers
        .iter()
        .filter(|b| !first_ids.contains(&b.id))
        .map(|b| b.frames)
        .sum();
    assert_eq!(second_frames, 4 * 2400);
    assert_eq!(h.synth.streams.load(Ordering::SeqCst), 2);
    assert_eq!(h.controller.state(), InteractionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_is_idempotent() {
    let h = harness(3);
    h.controller.interrupt();
    h.controller.interrupt();
    assert_eq!(h.controller.state(), InteractionState::Idle);

    record(&h, 2, 3200).await;
    h.controller.interrupt();
    h.controller.interrupt();
    assert_eq!(h.controller.state(), InteractionState::Idle);
    assert_eq!(h.mic.released(), 1);
    assert_eq!(h.stt.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_short_recording_never_reaches_network() {
    let h = harness(1);
    record(&h, 1, 100).await;

    let err = h.controller.stop_recording().await.unwrap_err();
    assert!(matches!(
        err,
        VoiceError::RecordingTooShort {
            bytes: 100,
            min_bytes: 6400
        }
    ));
    assert_eq!(h.stt.calls(), 0);
    assert_eq!(h.mic.released(), 1);

    let status = h.controller.status();
    assert_eq!(status.state, InteractionState::Idle);
    assert!(status.error.unwrap().contains("too short"));
}

#[tokio::test(start_paused = true)]
async fn test_empty_recording() {
    let h = harness(1);
    h.controller.start_recording().await.unwrap();
    let err = h.controller.stop_recording().await.unwrap_err();
    assert!(matches!(err, VoiceError::EmptyRecording));
    assert_eq!(h.stt.calls(), 0);
    assert_eq!(h.controller.state(), InteractionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_denied_microphone() {
    let h = harness_with(ScriptedMicrophone::denied(), 1);
    let err = h.controller.start_recording().await.unwrap_err();
    assert!(matches!(err, VoiceError::DeviceAccessDenied(_)));
    let status = h.controller.status();
    assert_eq!(status.state, InteractionState::Idle);
    assert!(status.error.is_some());

    // Recoverable: nothing is left half-open.
    assert!(matches!(
        h.controller.stop_recording().await,
        Err(VoiceError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_recording_discards_audio() {
    let h = harness(1);
    record(&h, 10, 3200).await;
    h.controller.cancel_recording();
    assert_eq!(h.controller.state(), InteractionState::Idle);
    assert_eq!(h.mic.released(), 1);
    assert_eq!(h.stt.calls(), 0);

    // A fresh recording starts clean.
    record(&h, 3, 3200).await;
    let transcript = h.controller.stop_recording().await.unwrap();
    assert_eq!(transcript.audio.len(), 44 + 3 * 3200);
}

#[tokio::test(start_paused = true)]
async fn test_device_released_before_transcription() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mic = Arc::new(ScriptedMicrophone::default());
    let stt = Arc::new(ReleaseCheckingTranscriber {
        released: Arc::clone(&mic.released),
        saw_released: AtomicBool::new(false),
    });
    let controller = VoiceInteractionController::new(
        VoiceConfig::default(),
        Arc::new(SinkSlot::new(|| Ok(Arc::new(VirtualSink::new()) as Arc<dyn AudioSink>))),
        mic.clone(),
        stt.clone(),
        Arc::new(FixedSynth),
    );

    controller.start_recording().await.unwrap();
    for _ in 0..5 {
        mic.feed(vec![0; 3200]);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let transcript = controller.stop_recording().await.unwrap();
    assert_eq!(transcript.text, "chlorophyll");
    assert!(stt.saw_released.load(Ordering::SeqCst));
}

struct FixedSynth;

#[async_trait]
impl SpeechSynthesizer for FixedSynth {
    async fn synthesize(&self, _text: &str, _voice_id: &str) -> VoiceResult<SynthesizedAudio> {
        Err(VoiceError::synthesis("unused"))
    }

    async fn stream(&self, _text: &str, _voice_id: &str) -> VoiceResult<PcmStream> {
        Err(VoiceError::synthesis("unused"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_recording_while_speaking_barges_in() {
    let h = harness(6);
    let controller = Arc::clone(&h.controller);
    let speaking = tokio::spawn(async move { controller.speak_stream("Let me explain").await });

    wait_for_buffers(&h.sink, 1).await;
    h.controller.start_recording().await.unwrap();

    assert_eq!(
        speaking.await.unwrap().unwrap(),
        PlaybackOutcome::Interrupted
    );
    assert_eq!(h.controller.state(), InteractionState::Listening);
    assert_eq!(h.sink.active_sources(), 0);

    h.controller.cancel_recording();
}

#[tokio::test(start_paused = true)]
async fn test_speak_while_listening_is_rejected() {
    let h = harness(1);
    h.controller.start_recording().await.unwrap();
    assert!(matches!(
        h.controller.speak_stream("hello").await,
        Err(VoiceError::InvalidState(_))
    ));
    assert_eq!(h.controller.state(), InteractionState::Listening);
    h.controller.cancel_recording();
}

#[tokio::test(start_paused = true)]
async fn test_non_streaming_speak() {
    let h = harness(1);
    let outcome = h.controller.speak("Well done").await.unwrap();
    assert_eq!(outcome, PlaybackOutcome::Completed);
    assert_eq!(h.controller.state(), InteractionState::Idle);

    let clips: Vec<_> = h
        .sink
        .sources()
        .into_iter()
        .filter(|s| s.kind == tutor_voice::SourceKind::Clip)
        .collect();
    assert_eq!(clips.len(), 1);
    assert!(clips[0].stopped_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_non_streaming_speak_interrupted() {
    let h = harness(1);
    let controller = Arc::clone(&h.controller);
    let speaking = tokio::spawn(async move { controller.speak("Well done").await });

    // Synthesis takes 50 ms; the clip then plays for one second.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.controller.state(), InteractionState::Speaking);
    h.controller.interrupt();

    assert_eq!(
        speaking.await.unwrap().unwrap(),
        PlaybackOutcome::Interrupted
    );
    assert_eq!(h.sink.active_sources(), 0);
    assert!(h.controller.status().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_sink() {
    let h = harness(2);
    h.controller.speak_stream("bye").await.unwrap();
    h.controller.shutdown();
    assert!(h.sink.is_closed());
    assert_eq!(h.controller.state(), InteractionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_microphone_is_pending() {
    let h = harness_with(ScriptedMicrophone::slow(Duration::from_millis(100)), 1);
    let controller = Arc::clone(&h.controller);
    let starting = tokio::spawn(async move { controller.start_recording().await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = h.controller.status();
    assert_eq!(status.state, InteractionState::Listening);
    assert!(!status.is_recording, "not recording until the microphone is granted");

    let err = h.controller.stop_recording().await.unwrap_err();
    assert!(matches!(err, VoiceError::EmptyRecording));
    assert_eq!(h.controller.state(), InteractionState::Idle);

    assert!(starting.await.unwrap().unwrap_err().is_aborted());
    assert_eq!(h.mic.released(), 1);
    assert!(!h.controller.status().is_recording);
    assert_eq!(h.stt.calls(), 0);

    // Nothing is left holding the device.
    h.controller.start_recording().await.unwrap();
    assert!(h.controller.status().is_recording);
    h.controller.cancel_recording();
    assert_eq!(h.mic.released(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_while_microphone_is_pending() {
    let h = harness_with(ScriptedMicrophone::slow(Duration::from_millis(100)), 1);
    let controller = Arc::clone(&h.controller);
    let starting = tokio::spawn(async move { controller.start_recording().await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    h.controller.interrupt();

    assert!(starting.await.unwrap().unwrap_err().is_aborted());
    assert_eq!(h.controller.state(), InteractionState::Idle);
    assert_eq!(h.mic.released(), 1);
    assert!(h.controller.status().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_speak_stream_stops_playback() {
    let h = harness(6);
    let speaking = tokio::time::timeout(
        Duration::from_millis(130),
        h.controller.speak_stream("Abandoned answer"),
    )
    .await;
    assert!(speaking.is_err(), "stream should still be running at the deadline");
    assert!(!h.sink.buffers().is_empty());

    assert_eq!(h.controller.state(), InteractionState::Idle);
    assert!(!h.controller.status().is_speaking);
    assert!(!h.controller.barge_in().is_active());
    assert!(h.controller.barge_in().scheduled_buffers().is_empty());
    assert_eq!(h.sink.active_sources(), 0);

    // The next turn is unaffected.
    let outcome = h.controller.speak_stream("Next answer").await.unwrap();
    assert_eq!(outcome, PlaybackOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_speak_stops_clip() {
    let h = harness(1);
    // Synthesis takes 50 ms; the clip plays for one second.
    let speaking =
        tokio::time::timeout(Duration::from_millis(300), h.controller.speak("Dropped")).await;
    assert!(speaking.is_err());

    assert_eq!(h.controller.state(), InteractionState::Idle);
    assert!(!h.controller.barge_in().is_active());
    assert_eq!(h.sink.active_sources(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recording_continues_past_safety_limit() {
    let h = harness(1);
    // 31 seconds of audio; the safety limit is 30 s.
    record(&h, 310, 3200).await;

    let status = h.controller.status();
    assert_eq!(status.state, InteractionState::Listening);
    assert!(status.is_recording);
    assert!(status.recording_duration_seconds >= 30);
    assert_eq!(h.mic.released(), 0);

    let transcript = h.controller.stop_recording().await.unwrap();
    assert_eq!(transcript.audio.len(), 44 + 310 * 3200);
    assert!(transcript.duration_seconds >= 30);
    assert_eq!(h.mic.released(), 1);
}

#[tokio::test]
#[ignore] // Requires audio hardware
async fn test_default_devices() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let devices = tutor_voice::CpalMicrophone::list_input_devices().unwrap();
    println!("Input devices: {:?}", devices);
    let sink = SinkSlot::default_output().acquire_or_reuse().unwrap();
    assert!(sink.now() >= 0.0);
}
