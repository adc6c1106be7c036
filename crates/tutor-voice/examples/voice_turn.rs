//! Voice turn demo: record one answer, transcribe it, speak feedback.
//!
//! Press Enter to start recording, Enter again to stop. While feedback is
//! playing, Enter barges in. Set `OPENAI_API_KEY` (or `TUTOR_VOICE_STT__API_KEY`
//! and `TUTOR_VOICE_TTS__API_KEY`) in `.env`.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tutor_voice::{
    CpalMicrophone, HttpSynthesizer, HttpTranscriber, PlaybackOutcome, SinkSlot, VoiceConfig,
    VoiceInteractionController,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[voice_turn] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = VoiceConfig::load()?;
    let microphone = Arc::new(CpalMicrophone::from_config(&config));
    let transcriber = Arc::new(HttpTranscriber::from_config(&config.stt)?);
    let synthesizer = Arc::new(HttpSynthesizer::from_config(&config)?);
    let sink_slot = Arc::new(SinkSlot::new(|| {
        Ok(Arc::new(tutor_voice::RodioSink::new()?) as Arc<dyn tutor_voice::AudioSink>)
    }));

    let controller = Arc::new(VoiceInteractionController::new(
        config,
        sink_slot,
        microphone,
        transcriber,
        synthesizer,
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("🎓 Voice turn demo. Press Enter to answer, Ctrl+D to quit.");
    while lines.next_line().await?.is_some() {
        if let Err(e) = controller.start_recording().await {
            warn!("{}", e);
            continue;
        }
        info!("🎙️ Listening... press Enter when done.");
        if lines.next_line().await?.is_none() {
            controller.cancel_recording();
            break;
        }

        let transcript = match controller.stop_recording().await {
            Ok(t) => t,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };
        info!("You said: {}", transcript.text);

        let reply = format!("Great job! You said: {}.", transcript.text.trim());
        let speaker = Arc::clone(&controller);
        let mut speaking = tokio::spawn(async move { speaker.speak_stream(&reply).await });

        tokio::select! {
            outcome = &mut speaking => match outcome? {
                Ok(PlaybackOutcome::Completed) => {
                    let status = controller.status();
                    info!(ttfa_ms = ?status.time_to_first_audio_ms, "Feedback finished");
                }
                Ok(PlaybackOutcome::Interrupted) => info!("Feedback interrupted"),
                Err(e) => warn!("{}", e),
            },
            _ = lines.next_line() => {
                controller.interrupt();
                let _ = speaking.await;
            }
        }
        info!("Press Enter to answer again.");
    }

    controller.shutdown();
    Ok(())
}
