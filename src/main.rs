use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use ohm_voice::api::ApiServer;
use ohm_voice::settings::SUPPORTED_SAMPLE_RATES;
use ohm_voice::voice::{
    Arbiter, ArbiterOptions, AudioDevices, CAPTURE_SAMPLE_RATE, CpalDevices, GeminiLiveConnector,
    PlaybackBuffer, PlaybackScheduler, PlaybackSink, Recognizer, SpeechToText, TranscribingRecognizer,
    UnavailableRecognizer, VoiceActivityDetector, VoiceSignal, codec,
};
use ohm_voice::{AudioSettings, Config, JsonFileStore, KeyValueStore, MemoryStore, Preferences};

/// Ohm - hands-free, full-duplex voice sessions with a live speech model
#[derive(Parser)]
#[command(name = "ohm", version, about)]
struct Cli {
    /// Port for the control API (overrides config)
    #[arg(long, env = "OHM_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Keep preferences in memory only
    #[arg(long)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List output devices
    Devices,
    /// Show or change persisted audio settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the capture as a WAV file
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print current settings
    Show,
    /// Change one or more settings
    Set {
        /// Output device id ("default" for the system default)
        #[arg(long)]
        output_device: Option<String>,
        /// Playback sample rate
        #[arg(long)]
        sample_rate: Option<u32>,
        /// Playback channel count (1 or 2)
        #[arg(long)]
        channels: Option<u16>,
        /// Hands-free mode
        #[arg(long)]
        hands_free: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,ohm_voice=info",
        1 => "info,ohm_voice=debug",
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
    let mut config = Config::load();
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    tracing::debug!(?config, "loaded configuration");

    let store: Arc<dyn KeyValueStore> = if cli.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(JsonFileStore::open(config.settings_path()))
    };

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Devices => list_devices(),
            Command::Settings { action } => {
                settings(store.as_ref(), action.unwrap_or(SettingsAction::Show))
            }
            Command::TestMic { duration, save } => test_mic(duration, save).await,
            Command::TestSpeaker => test_speaker(store.as_ref()).await,
        };
    }

    tracing::info!(port = config.server.port, ephemeral = cli.ephemeral, "starting ohm");

    let devices: Arc<dyn AudioDevices> = Arc::new(CpalDevices);
    let connector = GeminiLiveConnector::new(config.live.clone())?;
    let recognizer = build_recognizer(&config, Arc::clone(&devices));

    let (arbiter, handle) = Arbiter::new(
        ArbiterOptions::from(&config),
        devices,
        Box::new(connector),
        recognizer,
        store,
    );

    let api = ApiServer::new(handle.clone(), config.server.port).spawn();

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("shutting down");
        shutdown.shutdown().await;
    });

    tracing::info!(phrases = ?config.wake.phrases, "ohm ready");

    // The arbiter owns audio handles that must stay on this thread
    arbiter.run().await;
    api.abort();

    Ok(())
}

/// Wake-word recognizer for the configured STT provider
fn build_recognizer(config: &Config, devices: Arc<dyn AudioDevices>) -> Box<dyn Recognizer> {
    let stt = SpeechToText::new(
        config.wake.stt_provider,
        config.stt_api_key().map(ToString::to_string),
        config.wake.stt_model.clone(),
    );

    match stt {
        Ok(stt) => Box::new(TranscribingRecognizer::new(
            devices,
            stt,
            config.wake.session_length,
        )),
        Err(e) => {
            tracing::warn!(error = %e, "wake word unavailable, hands-free mode disabled");
            Box::new(UnavailableRecognizer::new(e.to_string()))
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    let devices = CpalDevices.list_output_devices()?;
    println!("Output devices:");
    for device in devices {
        println!("  {:<32} {}", device.id, device.label);
    }
    Ok(())
}

fn settings(store: &dyn KeyValueStore, action: SettingsAction) -> anyhow::Result<()> {
    let mut prefs = Preferences::load(store);

    if let SettingsAction::Set {
        output_device,
        sample_rate,
        channels,
        hands_free,
    } = action
    {
        let audio = AudioSettings {
            output_device_id: output_device.unwrap_or(prefs.audio.output_device_id),
            sample_rate: sample_rate.unwrap_or(prefs.audio.sample_rate),
            channel_count: channels.unwrap_or(prefs.audio.channel_count),
        };
        audio.validate()?;
        prefs.audio = audio;
        if let Some(enabled) = hands_free {
            prefs.hands_free = enabled;
        }
        prefs.save(store)?;
        println!("Settings saved.\n");
    }

    println!("Output device: {}", prefs.audio.output_device_id);
    println!(
        "Sample rate:   {} Hz (supported: {SUPPORTED_SAMPLE_RATES:?})",
        prefs.audio.sample_rate
    );
    println!("Channels:      {}", prefs.audio.channel_count);
    println!("Hands-free:    {}", prefs.hands_free);
    Ok(())
}

/// Test microphone input with a live level meter
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64, save: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::channel(64);
    let mut capture = CpalDevices.open_capture(tx)?;
    let mut vad = VoiceActivityDetector::default();

    println!("Sample rate: {CAPTURE_SAMPLE_RATE} Hz");
    println!("---");

    let mut recorded = Vec::new();
    let mut window = Vec::new();
    let mut speaking = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.tick().await;
    let mut second = 0;

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let signal = vad.observe(&frame.samples, tokio::time::Instant::now());
                speaking |= signal == VoiceSignal::Speaking;
                window.extend_from_slice(&frame.samples);
                if save.is_some() {
                    recorded.extend_from_slice(&frame.samples);
                }
            }
            _ = tick.tick() => {
                second += 1;
                let energy = ohm_voice::voice::rms(&window);
                let peak = window.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

                // Visual meter
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let meter_len = (energy * 100.0).min(50.0) as usize;
                let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

                println!(
                    "[{second:2}s] RMS: {energy:.4} | Peak: {peak:.4} | {} | [{meter}]",
                    if speaking { "speech " } else { "silence" },
                );
                window.clear();
                speaking = false;
            }
        }
    }

    capture.stop();

    if let Some(path) = save {
        let wav = codec::samples_to_wav(&recorded, CAPTURE_SAMPLE_RATE)?;
        std::fs::write(&path, wav)?;
        println!("\nSaved {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If the meter moved and flipped to \"speech\" while you talked, the mic works.");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with three back-to-back tones
#[allow(clippy::future_not_send)]
async fn test_speaker(store: &dyn KeyValueStore) -> anyhow::Result<()> {
    let settings = Preferences::load(store).audio;
    println!(
        "Testing speaker output on \"{}\" at {} Hz...",
        settings.output_device_id, settings.sample_rate
    );
    println!("You should hear three rising tones with no gaps\n");

    let (completions_tx, mut completions) = mpsc::unbounded_channel();
    let mut sink = CpalDevices.open_playback(&settings, completions_tx)?;
    if let Some(fallback) = sink.take_fallback() {
        println!("Warning: {fallback}; using the default output");
    }
    let mut scheduler = PlaybackScheduler::new(sink);

    for frequency in [440.0_f32, 554.37, 659.25] {
        let buffer = tone(frequency, 0.6, settings.sample_rate, settings.channel_count);
        let scheduled = scheduler.schedule(buffer)?;
        println!(
            "Scheduled {frequency:.0} Hz at {:.3}s for {:.3}s",
            scheduled.start, scheduled.duration
        );
    }

    while scheduler.active_count() > 0 {
        match tokio::time::timeout(Duration::from_secs(5), completions.recv()).await {
            Ok(Some(id)) => {
                scheduler.complete(id);
            }
            Ok(None) | Err(_) => break,
        }
    }
    scheduler.close();

    println!("\n---");
    println!("If you heard the tones, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: ohm devices");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Sine tone at 30% volume, duplicated across channels
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn tone(frequency: f32, seconds: f32, sample_rate: u32, channels: u16) -> PlaybackBuffer {
    let frames = (sample_rate as f32 * seconds) as usize;
    let samples = (0..frames)
        .flat_map(|i| {
            let t = i as f32 / sample_rate as f32;
            let sample = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3;
            std::iter::repeat_n(sample, usize::from(channels))
        })
        .collect();

    PlaybackBuffer {
        samples,
        sample_rate,
        channels,
    }
}
