use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use voice_onboarding::{
    AudioFormat, AudioQueueEngine, ChunkOutcome, Config, CpalBackend, OutputBackend,
    PlaybackEvent, PlaybackOrchestrator, StepPhase, WavBackend,
};

/// Onboard - Streamed voice onboarding player
#[derive(Parser)]
#[command(name = "onboard", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play the onboarding conversation
    Play {
        /// Voice to request
        #[arg(long, env = "ONBOARD_VOICE_ID")]
        voice: Option<u32>,
        /// Step to start from
        #[arg(long, env = "ONBOARD_FIRST_STEP")]
        from_step: Option<u32>,
        /// Write audio to a WAV file instead of the speaker
        #[arg(long)]
        wav: Option<PathBuf>,
    },
    /// Print the cached bearer token, fetching one if needed
    Token {
        /// Discard the cached token first
        #[arg(long)]
        refresh: bool,
    },
    /// Test speaker output through the audio engine
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voice_onboarding=info",
        1 => "info,voice_onboarding=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;

    match cli.command {
        Command::Play {
            voice,
            from_step,
            wav,
        } => {
            if let Some(voice) = voice {
                config.session.voice_id = voice;
            }
            if let Some(step) = from_step {
                config.session.first_step = step;
            }
            play(&config, wav).await
        }
        Command::Token { refresh } => token(&config, refresh).await,
        Command::TestSpeaker => test_speaker(&config).await,
    }
}

/// Play the step chain until it completes, fails, or is interrupted
async fn play(config: &Config, wav: Option<PathBuf>) -> anyhow::Result<()> {
    let backend: Arc<dyn OutputBackend> = match wav {
        Some(path) => {
            tracing::info!(path = %path.display(), "writing audio to wav file");
            Arc::new(WavBackend::new(path))
        }
        None => Arc::new(CpalBackend),
    };

    let orchestrator = PlaybackOrchestrator::from_config(config, backend)?;

    let (tx, mut rx) = mpsc::channel(32);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                PlaybackEvent::Transcription {
                    step_id,
                    text: Some(text),
                } => println!("[step {step_id}] {text}"),
                PlaybackEvent::Transcription { step_id, text: None } => {
                    println!("[step {step_id}] (no transcription)");
                }
                PlaybackEvent::Phase {
                    step_id,
                    phase: StepPhase::Completed,
                } => tracing::debug!(step_id, "step finished playing"),
                PlaybackEvent::Phase { .. } => {}
            }
        }
    });

    let result = tokio::select! {
        result = orchestrator.run(tx) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping playback");
            orchestrator.stop().await;
            Ok(())
        }
    };

    let _ = printer.await;
    result
}

/// Show the bearer token used for speech requests
async fn token(config: &Config, refresh: bool) -> anyhow::Result<()> {
    let orchestrator = PlaybackOrchestrator::from_config(config, Arc::new(CpalBackend))?;
    let tokens = orchestrator.tokens();

    if refresh {
        tokens.invalidate()?;
    }

    let cached = tokens.is_cached()?;
    let token = tokens.get_valid_token().await?;

    println!("{}", if cached { "cached" } else { "fetched" });
    println!("{token}");
    Ok(())
}

/// Play a 440Hz tone through the engine in speech-sized chunks
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let format = AudioFormat::PCM_S16LE_MONO_16K;
    let engine = AudioQueueEngine::spawn(Arc::new(CpalBackend), &config.engine);
    engine.initialize(format).await?;

    let pcm = tone(format.sample_rate, 440.0, 2.0);
    let mut dropped = 0_usize;
    for chunk in pcm.chunks(config.engine.chunk_threshold) {
        if let ChunkOutcome::Dropped(_) = engine.enqueue_chunk(chunk.to_vec()).await? {
            dropped += 1;
        }
    }

    println!(
        "Queued {} bytes at {} Hz ({dropped} chunks dropped)...",
        pcm.len(),
        format.sample_rate
    );

    engine.end_of_input().await?.wait().await?;
    engine.stop().await;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// 16-bit little-endian sine tone at 30% volume
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn tone(sample_rate: u32, frequency: f32, duration_secs: f32) -> Vec<u8> {
    let num_samples = (sample_rate as f32 * duration_secs) as usize;

    (0..num_samples)
        .flat_map(|i| {
            let t = i as f32 / sample_rate as f32;
            let sample = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3;
            ((sample * f32::from(i16::MAX)) as i16).to_le_bytes()
        })
        .collect()
}
