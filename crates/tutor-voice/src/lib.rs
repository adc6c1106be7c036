//! # Tutor Voice - Real-time Voice Interaction Engine
//!
//! Captures microphone audio into discrete utterances for transcription, and
//! renders an incremental stream of raw PCM from a speech-synthesis service as
//! continuous, gapless sound that the user can interrupt at any moment.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                  VoiceInteractionController                       │
//! │  Idle ⇄ Speaking        Idle → Listening → Processing → Idle      │
//! │                                                                   │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐       │
//! │  │ Synthesizer  │→  │SampleDecoder │→  │PlaybackScheduler │→ sink │
//! │  │ (PCM stream) │   │ (residual)   │   │ (gapless clock)  │       │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘       │
//! │          ↑                 BargeInController (cancel + stop)      │
//! │  ┌──────────────┐   ┌──────────────┐                              │
//! │  │  Microphone  │→  │CaptureSession│→ Transcriber                 │
//! │  │    (cpal)    │   │ (utterance)  │                              │
//! │  └──────────────┘   └──────────────┘                              │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The audio sink (rodio in production, [`VirtualSink`] in tests) is created
//! once through a [`SinkSlot`] and reused by every playback session.

pub mod barge_in;
pub mod capture;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod scheduler;
pub mod sink;
pub mod synthesis;
pub mod transcription;

pub use barge_in::{BargeInController, PlaybackSession};
pub use capture::{
    AcquiredDevice, CaptureChunk, CaptureDevice, CaptureFormat, CaptureSession, CaptureState,
    CpalMicrophone, MicrophoneSource, Transcript, Utterance,
};
pub use config::{EndpointConfig, VoiceConfig};
pub use controller::{InteractionState, PlaybackOutcome, VoiceInteractionController, VoiceStatus};
pub use decoder::{decode_pcm16le, SampleDecoder};
pub use error::{VoiceError, VoiceResult};
pub use scheduler::{PlaybackScheduler, ScheduledBuffer};
pub use sink::{
    AudioSink, ClipPlayback, EncodedClip, RodioSink, SampleBuffer, SinkSlot, SourceId,
    SourceKind, VirtualSink, VirtualSource,
};
pub use synthesis::{
    synthesize_with_retry, HttpSynthesizer, PcmChunkStream, PcmStream, SpeechSynthesizer,
    SynthesisTiming, SynthesizedAudio,
};
pub use transcription::{FixedTranscriber, HttpTranscriber, Transcriber};
