//! Reelgate - Drop-folder Media Ingest Pipeline
//!
//! Entry point: loads configuration, sets up logging and runs the watch loop,
//! a dry-run probe, or writes a default config file.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tracing_appender::{non_blocking, rolling};
use walkdir::WalkDir;

use reelgate::album::ScreenshotAlbumBuilder;
use reelgate::chat::TelegramClient;
use reelgate::classify::{Classifier, path_exclusion};
use reelgate::cli::{Args, Commands};
use reelgate::config::Config;
use reelgate::media::{MediaCommandBuilder, ProcessTranscoder};
use reelgate::pipeline::Pipeline;
use reelgate::probe::{FfprobeProber, MediaProber};
use reelgate::watch::{Dispatcher, DropFolderWatcher};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            // Try to load config.toml from current directory first
            if Path::new("config.toml").exists() {
                Config::from_file("config.toml")?
            } else {
                Config::default()
            }
        }
    };

    // Setup logging to both console and file
    let log_level = if args.verbose { "debug" } else { config.log_level.as_str() };
    setup_logging(log_level)?;

    info!("Starting Reelgate - Drop-folder Media Ingest Pipeline");

    match args.command {
        Commands::InitConfig { output } => {
            config.save_to_file(&output)?;
            println!("Wrote default configuration to {}", output.display());
        }
        Commands::Probe { input } => {
            probe_inputs(&config, &input).await?;
        }
        Commands::Watch => {
            config.validate()?;
            watch(Arc::new(config)).await?;
        }
    }

    Ok(())
}

async fn watch(config: Arc<Config>) -> Result<()> {
    let chat = Arc::new(TelegramClient::connect(&config.chat).await?);

    let transcoder = ProcessTranscoder::new(&config.media.transcoder_path);
    match transcoder.get_version_info().await {
        Ok(version) => info!("Transcoder: {}", version),
        Err(e) => warn!("Could not read transcoder version: {}", e),
    }

    let albums = ScreenshotAlbumBuilder::new(MediaCommandBuilder::new(
        &config.media.transcoder_path,
        &config.media.ffmpeg_path,
    ));

    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        Arc::new(FfprobeProber::new(&config.media.ffprobe_path)),
        Arc::new(transcoder),
        chat,
        Arc::new(albums),
    ));

    let listener = if config.chat.accept_replies {
        Some(tokio::spawn(pipeline.clone().listen_for_replies()))
    } else {
        None
    };

    let (watcher, events) = DropFolderWatcher::start(&config.paths.buffer_in, config.pipeline.queue_capacity)?;
    let dispatcher = Dispatcher::new(
        pipeline.clone(),
        config.pipeline.settle_delay(),
        config.pipeline.max_in_flight,
    );
    let dispatch = tokio::spawn(dispatcher.run(events));

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, finishing running tasks");

    // closing the watch closes the event queue
    drop(watcher);
    if let Some(listener) = listener {
        listener.abort();
    }

    let stats = dispatch.await?;
    info!(
        "Processed {} files ({} failed), {} requests still open",
        stats.succeeded + stats.failed,
        stats.failed,
        pipeline.requests().store().len()
    );
    Ok(())
}

/// Classify files without transcoding or contacting the chat service
async fn probe_inputs(config: &Config, input: &Path) -> Result<()> {
    let prober = FfprobeProber::new(&config.media.ffprobe_path);
    let classifier = Classifier::new(config.pipeline.require_mixed_audio);

    println!("\n{:<50} {:>10} {:>12} {:<30}", "File", "Duration", "Size (MB)", "Result");
    println!("{}", "-".repeat(105));

    for entry in WalkDir::new(input).max_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let name = path.file_name().unwrap_or_default().to_string_lossy();

        if let Some(exclusion) = path_exclusion(path) {
            println!("{:<50} {:>10} {:>12} {:<30}", name, "-", "-", format!("ineligible ({})", exclusion));
            continue;
        }

        let probe = match prober.probe(path).await {
            Ok(probe) => probe,
            Err(e) => {
                error!("{}", e);
                println!("{:<50} {:>10} {:>12} {:<30}", name, "-", "-", "probe failed");
                continue;
            }
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);

        let result = match classifier.classify(path, &probe, size) {
            Ok(category) => category.to_string(),
            Err(rejection) => format!("rejected ({})", rejection),
        };

        println!(
            "{:<50} {:>10.1} {:>12.1} {:<30}",
            name,
            probe.duration,
            size as f64 / 1024.0 / 1024.0,
            result
        );
    }

    Ok(())
}

/// Setup logging to both console and file
fn setup_logging(log_level: &str) -> Result<()> {
    // Create log directory
    let reelgate_dir = std::env::current_dir()?.join(".reelgate");
    let log_dir = reelgate_dir.join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "reelgate.log");
    let (non_blocking_file, _guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(_guard);

    // Create console layer
    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // Create file layer
    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false); // No ANSI colors in file

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("reelgate={}", log_level)))
        .map_err(|e| anyhow::anyhow!("Invalid log level '{}': {}", log_level, e))?;

    // Setup layered subscriber
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized - console: {}, file: {}",
          log_level, log_dir.join("reelgate.log").display());

    Ok(())
}
