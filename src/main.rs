//! quick-tts: type or hotkey a phrase, hear it through a remote TTS voice.

mod cache;
mod config;
mod error;
mod gui;
mod hotkey;
mod playback;
mod speaker;
mod synth;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::VoiceConfig;
use crate::hotkey::HotkeyManager;
use crate::playback::{PlaybackQueue, PlaybackWorker, RodioBackend};
use crate::speaker::Speaker;
use crate::synth::HttpSynthesizer;

#[derive(Parser, Debug)]
#[command(name = "quick-tts", about = "Desktop text-to-speech box")]
struct Args {
    /// Path to the voice config (sound_model.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the shortcut file
    #[arg(short, long)]
    shortcuts: Option<PathBuf>,

    /// Start with global hotkeys enabled
    #[arg(long)]
    hotkeys: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy windowing/GL internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,winit=info,eframe=info,egui_glow=info,reqwest=info,hyper_util=info")
    } else {
        EnvFilter::new("info,winit=warn,eframe=warn,egui_glow=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("quick-tts starting");

    let voice = VoiceConfig::load(args.config.as_deref()).inspect_err(|e| error!("{e}"))?;
    info!(
        "Voice: {} (style: {}, speed: {}%, pitch: {}%) → {}",
        voice.voice,
        voice.style,
        voice.speed,
        voice.pitch,
        voice.full_api_url()
    );
    info!("Audio cache: {}", voice.storage_dir.display());

    let runtime = tokio::runtime::Runtime::new()?;
    let shutdown = CancellationToken::new();

    let (queue, rx) = PlaybackQueue::channel();
    let worker = PlaybackWorker::spawn(rx, RodioBackend::default, shutdown.clone())?;

    let synth = Arc::new(HttpSynthesizer::new()?);
    let speaker = Speaker::new(
        voice,
        synth,
        queue,
        runtime.handle().clone(),
        shutdown.clone(),
    );

    let shortcut_file = args
        .shortcuts
        .unwrap_or_else(config::default_shortcut_path);
    let hotkeys = HotkeyManager::new(shortcut_file, speaker.clone(), runtime.handle().clone());
    info!(
        "{} shortcut(s) from {}",
        hotkeys.bindings().len(),
        hotkeys.shortcut_file().display()
    );

    // Blocks until the window is closed; the hotkey listener stops with it.
    let result = gui::run(speaker, hotkeys, args.config, args.hotkeys);

    info!("Shutting down");
    if worker.is_finished() {
        warn!("Playback worker exited before shutdown");
    }
    shutdown.cancel();
    worker.shutdown();
    runtime.shutdown_timeout(Duration::from_secs(1));

    result?;
    Ok(())
}
