//! wake-stream entry point.
//!
//! # Startup sequence
//!
//! 1. Parse the command line.
//! 2. Initialise logging (`RUST_LOG` wins over `--verbose`).
//! 3. Load [`AppConfig`] (defaults on first run) and apply CLI overrides.
//! 4. Create the tokio runtime.
//! 5. Open the default microphone and start the [`Device`].
//! 6. Run until Ctrl-C or a microphone failure.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use wake_stream::{
    app::{Device, EngineFactory},
    audio::CpalMicrophone,
    config::{AppConfig, AppPaths},
    detection::{DetectionEngine, EnergyEngine},
    stream::WsConnector,
};

#[derive(Debug, Parser)]
#[command(name = "wake-stream", version, about = "Stream spoken utterances after a wake word")]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Streaming endpoint, e.g. ws://10.0.0.2:9090/realtime
    #[arg(long)]
    uri: Option<String>,

    /// Identity sent in start messages
    #[arg(long)]
    device_id: Option<String>,

    /// Keep the connection open between utterances
    #[arg(long)]
    keep_open: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Write a settings file with all defaults and exit
    #[arg(long)]
    write_default_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Logging
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // 2. Configuration
    let path = cli.config.clone().unwrap_or_else(|| AppPaths::new().settings_file);
    if cli.write_default_config {
        AppConfig::default().save_to(&path)?;
        log::info!("wrote default settings to {}", path.display());
        return Ok(());
    }

    let mut config = AppConfig::load_from(&path)?;
    if let Some(uri) = cli.uri {
        config.stream.endpoint = Some(uri);
    }
    if let Some(id) = cli.device_id {
        config.device.id = id;
    }
    if cli.keep_open {
        config.stream.keep_open = true;
    }
    log::info!(
        "wake-stream {} starting, settings from {}",
        env!("CARGO_PKG_VERSION"),
        path.display()
    );

    // 3. Runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(run(config))
}

async fn run(config: AppConfig) -> Result<()> {
    let microphone = CpalMicrophone::open(
        config.audio.channels,
        config.audio.sample_rate,
        config.audio.input_gain_db,
    )
    .context("opening microphone")?;

    let engines: EngineFactory = {
        let audio = config.audio.clone();
        let detection = config.detection.clone();
        Box::new(move || {
            Ok(Arc::new(EnergyEngine::new(&audio, &detection)) as Arc<dyn DetectionEngine>)
        })
    };

    let device = Device::start(config, engines, Arc::new(microphone), Arc::new(WsConnector))?;
    device
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
