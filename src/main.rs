use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use live_narrator::audio::{
    AudioBackend, BLOCK_SIZE, CpalBackend, DeviceState, PLAYBACK_SAMPLE_RATE, SAMPLE_RATE, pcm,
};
use live_narrator::{
    Config, ImageFileSource, LiveTransport, NarratorEvent, PlaybackScheduler, SessionManager,
};

/// Narrator - live spoken narration of a scene
#[derive(Parser)]
#[command(name = "narrator", version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, env = "NARRATOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a narration session until Ctrl-C
    Live {
        /// Image file the scene renderer keeps overwriting
        #[arg(short, long)]
        frame: Option<PathBuf>,
        /// Replace the narrator's system instruction
        #[arg(short, long)]
        prompt: Option<String>,
        /// Prebuilt voice to narrate with
        #[arg(long)]
        voice: Option<String>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test gapless speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,live_narrator=info",
        1 => "info,live_narrator=debug",
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

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Live {
            frame,
            prompt,
            voice,
        } => {
            let mut config = Config::load(cli.config.as_deref())?;
            if let Some(prompt) = prompt {
                config.session.system_instruction = prompt;
            }
            if let Some(voice) = voice {
                config.session.voice = voice;
            }
            live(config, frame).await
        }
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

/// Run a narration session
#[allow(clippy::future_not_send)]
async fn live(config: Config, frame: Option<PathBuf>) -> anyhow::Result<()> {
    if config.api_key.is_none() {
        anyhow::bail!("no API key configured (set GEMINI_API_KEY or NARRATOR_API_KEY)");
    }
    tracing::debug!(?config, "loaded configuration");

    let transport = LiveTransport::new(&config);
    let mut manager = SessionManager::new(&config, CpalBackend, transport);
    if let Some(path) = frame {
        tracing::info!(path = %path.display(), "sending scene snapshots");
        manager = manager.with_frame_source(ImageFileSource::new(path, &config.frames));
    }

    manager.connect().await?;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break Ok(());
            }
            event = manager.next_event() => match event {
                Some(NarratorEvent::Opened) => {
                    tracing::info!("narrator is listening");
                }
                Some(NarratorEvent::Text(text)) => println!("{text}"),
                Some(NarratorEvent::Speech { start_time, duration }) => {
                    tracing::debug!(start_time, duration, "speech scheduled");
                }
                Some(NarratorEvent::Interrupted { stopped }) => {
                    tracing::info!(stopped, "narrator interrupted");
                }
                Some(NarratorEvent::TurnComplete) => {}
                Some(NarratorEvent::Closed(reason)) => {
                    tracing::info!(reason = ?reason, "session ended");
                    break Ok(());
                }
                Some(NarratorEvent::Error(message)) => {
                    break Err(anyhow::anyhow!("session failed: {message}"));
                }
                None => break Ok(()),
            },
        }
    };

    manager.disconnect().await;
    outcome
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut input = CpalBackend.open_input(SAMPLE_RATE, BLOCK_SIZE)?;
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
    input.start(chunk_tx)?;

    println!("Capture rate: {} Hz, {BLOCK_SIZE}-sample blocks", input.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut samples = Vec::new();
        let mut blocks = 0;
        while let Ok(chunk) = chunk_rx.try_recv() {
            samples.extend_from_slice(&chunk.samples);
            blocks += 1;
        }

        let energy = pcm::rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] blocks: {blocks:2} | RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]",
            i + 1
        );
    }

    input.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with three tones scheduled back to back
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    const TONES: [f32; 3] = [440.0, 554.37, 659.25];
    const TONE_SECS: f32 = 0.6;

    println!("Testing speaker output...");
    println!("You should hear three rising tones with no gap between them\n");

    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
    let mut output = CpalBackend.open_output(PLAYBACK_SAMPLE_RATE, finished_tx)?;
    if output.state() == DeviceState::Suspended {
        output.resume().await?;
    }

    let mut scheduler = PlaybackScheduler::new();
    for frequency in TONES {
        let samples = tone(frequency, TONE_SECS, PLAYBACK_SAMPLE_RATE);
        let buffer = output.create_buffer(samples, PLAYBACK_SAMPLE_RATE).await?;
        let unit = scheduler.enqueue(&buffer, output.as_mut())?;
        println!(
            "{frequency:7.2} Hz at {:.3}s for {:.3}s",
            unit.start_time, unit.duration
        );
    }

    let deadline = Duration::from_secs_f32(TONE_SECS * 3.0 + 2.0);
    let drained = tokio::time::timeout(deadline, async {
        while !scheduler.is_idle() {
            match finished_rx.recv().await {
                Some(id) => {
                    scheduler.complete(id);
                }
                None => break,
            }
        }
    })
    .await;

    output.close().await?;

    if drained.is_err() {
        anyhow::bail!("playback did not finish; is an output device connected?");
    }

    println!("\n---");
    println!("If you heard one continuous rising sequence, playback is gapless!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Sine tone at 30% volume
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn tone(frequency: f32, seconds: f32, sample_rate: u32) -> Vec<f32> {
    let rate = sample_rate as f32;
    let len = (rate * seconds) as usize;
    (0..len)
        .map(|i| (2.0 * std::f32::consts::PI * frequency * i as f32 / rate).sin() * 0.3)
        .collect()
}
