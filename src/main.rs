use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::builder::FalseyValueParser;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use hark::config::{SpeakerBackend, WAKE_SAMPLE_RATE, WakeConfig};
use hark::voice::{
    AudioCapture, AudioFormat, CaptureEvent, DeviceSpeakerFactory, PcmResampler, WakeWordDetector,
    bytes_to_samples, play_blocking, rms, sine_pcm,
};
use hark::{Assistant, Config};

/// hark - wake word voice assistant for the realtime speech API
#[derive(Parser)]
#[command(name = "hark", version, about)]
struct Cli {
    /// Log every inbound event and save each request as a WAV file
    #[arg(long, env = "DEBUG", value_parser = FalseyValueParser::new())]
    debug: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,

        /// Capture sample rate
        #[arg(long, env = "SAMPLE_RATE", default_value = "24000")]
        sample_rate: u32,
    },
    /// Test speaker output
    TestSpeaker {
        /// Output backend (cpal or null)
        #[arg(long, env = "SPEAKER_BACKEND", default_value = "cpal")]
        backend: String,
    },
    /// Print live wake word scores from the microphone
    TestWake {
        /// Duration in seconds
        #[arg(short, long, default_value = "30")]
        duration: u64,

        /// Wake word model
        #[arg(long, env = "WAKE_MODEL_PATH", default_value = "hey_jarvis_v0.1.onnx")]
        model: PathBuf,

        /// Detection threshold
        #[arg(long, env = "WAKE_THRESHOLD", default_value = "0.5")]
        threshold: f32,

        /// Capture sample rate
        #[arg(long, env = "SAMPLE_RATE", default_value = "24000")]
        sample_rate: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match (cli.verbose, cli.debug) {
        (0, false) => "info,hark=info,ort=warn",
        (0 | 1, _) => "info,hark=debug,ort=warn",
        (2, _) => "debug",
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
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, sample_rate } => test_mic(duration, sample_rate).await,
            Command::TestSpeaker { backend } => test_speaker(&backend).await,
            Command::TestWake {
                duration,
                model,
                threshold,
                sample_rate,
            } => test_wake(duration, model, threshold, sample_rate).await,
        };
    }

    let mut config = Config::from_env()?;
    config.debug |= cli.debug;
    tracing::debug!(?config, "loaded configuration");

    tracing::info!(
        model = %config.realtime.model,
        voice = %config.realtime.voice,
        debug = config.debug,
        "starting hark"
    );

    Assistant::new(config).run().await?;

    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64, sample_rate: u32) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let format = AudioFormat::pcm16_mono(sample_rate);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut capture = AudioCapture::new(format)?;
    capture.start(tx)?;

    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut second = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                CaptureEvent::Audio(frame) => second.extend_from_slice(frame.bytes()),
                CaptureEvent::Failed(reason) => anyhow::bail!("capture failed: {reason}"),
            }
        }

        let energy = rms(&second);
        let peak = bytes_to_samples(&second)
            .iter()
            .map(|&s| f32::from(s).abs() / 32768.0)
            .fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker(backend: &str) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let factory = DeviceSpeakerFactory::new(SpeakerBackend::parse(backend)?);
    let format = AudioFormat::pcm16_mono(24000);
    let tone = sine_pcm(format, 440.0, 2.0, 0.3);

    println!("Playing {} bytes at {} Hz...", tone.len(), format.sample_rate);
    play_blocking(&factory, format, &tone, Duration::from_millis(200)).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Run the detector on live audio and print its scores
#[allow(clippy::future_not_send)]
async fn test_wake(duration: u64, model: PathBuf, threshold: f32, sample_rate: u32) -> anyhow::Result<()> {
    let wake = WakeConfig {
        model_path: model,
        threshold,
        ..WakeConfig::default()
    };
    let mut detector = WakeWordDetector::load_model(&wake)?;
    let mut resampler = if sample_rate == WAKE_SAMPLE_RATE {
        None
    } else {
        Some(PcmResampler::new(sample_rate, WAKE_SAMPLE_RATE)?)
    };

    let format = AudioFormat::pcm16_mono(sample_rate);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut capture = AudioCapture::new(format)?;
    capture.start(tx)?;

    println!(
        "Say \"{}\" ({duration} seconds, threshold {})",
        detector.wake_word(),
        detector.threshold()
    );
    println!("---");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut best = 0.0f32;
    let mut last_report = Instant::now();

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            () = tokio::time::sleep_until(deadline) => break,
        };
        let Some(event) = event else { break };

        let bytes = match event {
            CaptureEvent::Audio(frame) => frame.into_bytes(),
            CaptureEvent::Failed(reason) => anyhow::bail!("capture failed: {reason}"),
        };
        let bytes = match resampler.as_mut() {
            Some(resampler) => resampler.process(&bytes)?,
            None => bytes,
        };

        let now = Instant::now();
        if let Some(event) = detector.process(&bytes, now) {
            println!("wake word detected: {} ({:.3})", event.wake_word, event.score);
        }
        best = best.max(detector.last_peak());

        if now.duration_since(last_report) >= Duration::from_secs(1) {
            println!("score: {best:.3}");
            best = 0.0;
            last_report = now;
        }
    }

    capture.stop();
    println!("---");
    println!("{} predictions", detector.inference_count());

    Ok(())
}
