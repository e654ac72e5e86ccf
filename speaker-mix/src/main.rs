//! Speaker mixer (speaker-mix) - Main entry point
//!
//! Plays the given source files through the mixer, one per source pipeline.
//! With `--cycle-secs`, every interval the mix is stopped and the next files
//! of the list are assigned; the event loop then restarts playback.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use speaker_common::config::{OutputBackend, SystemConfig};
use speaker_common::PipelineIndex;
use speaker_mix::audio::{CpalTransport, NullTransport, OutputTransport};
use speaker_mix::{FsStorage, Orchestrator};
use tokio::signal;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for speaker-mix
#[derive(Parser, Debug)]
#[command(name = "speaker-mix")]
#[command(about = "Mix several audio files into one output stream")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "SPEAKER_CONFIG")]
    config: Option<PathBuf>,

    /// Local directory backing the storage mount point
    #[arg(short, long, env = "SPEAKER_ROOT")]
    root: Option<PathBuf>,

    /// Output backend (cpal, null)
    #[arg(short, long, env = "SPEAKER_OUTPUT")]
    output: Option<OutputBackend>,

    /// Output volume (-64..=63)
    #[arg(long, allow_hyphen_values = true)]
    volume: Option<i32>,

    /// Switch to the next files every N seconds (0 = never)
    #[arg(long, default_value = "0")]
    cycle_secs: u64,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Source URIs under the mount point (e.g. /spiffs/a.mp3)
    uris: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = SystemConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = &config.logging.level;
                format!("speaker_mix={level},speaker_common={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "speaker-mix {} (git {}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    if args.list_devices {
        for device in CpalTransport::list_devices().context("Failed to list output devices")? {
            println!("{}", device);
        }
        return Ok(());
    }

    if let Some(root) = args.root {
        config.storage.root = root;
    }
    if let Some(backend) = args.output {
        config.output.backend = backend;
    }

    if args.uris.is_empty() {
        bail!("No source files given");
    }

    info!(
        "Storage {} -> {}",
        config.storage.mount_point,
        config.storage.root.display()
    );

    let storage = Arc::new(FsStorage::from_config(&config.storage));
    let transport: Box<dyn OutputTransport> = match config.output.backend {
        OutputBackend::Cpal => Box::new(CpalTransport::new(config.output.device.clone())),
        OutputBackend::Null => Box::new(NullTransport::new()),
    };

    let mut orchestrator = Orchestrator::initialize(config, storage, transport)
        .await
        .context("Failed to initialize playback")?;

    let mut playlist = Playlist::new(args.uris);
    playlist.assign_next(&mut orchestrator);

    let result = run(&mut orchestrator, &mut playlist, args.volume, args.cycle_secs).await;

    // Always terminate so blocked source workers are released
    orchestrator.terminate().await;
    info!("Shutdown complete");

    result.context("Playback aborted")
}

/// Start playback and drive the event loop until shutdown or a fatal error
async fn run(
    orchestrator: &mut Orchestrator,
    playlist: &mut Playlist,
    volume: Option<i32>,
    cycle_secs: u64,
) -> speaker_mix::Result<()> {
    if let Some(volume) = volume {
        orchestrator.set_volume(volume)?;
    }

    for i in 0..orchestrator.source_count() {
        // Sources without a file stay idle
        let _ = orchestrator.play(PipelineIndex::Source(i)).await;
    }
    orchestrator.play(PipelineIndex::Mix).await?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let cycle = (cycle_secs > 0).then(|| Duration::from_secs(cycle_secs));
    let mut next_cycle = cycle.map(|period| Instant::now() + period);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            return Ok(());
        }

        if let (Some(period), Some(due)) = (cycle, next_cycle) {
            if Instant::now() >= due {
                info!("Switching to the next files");
                if let Err(e) = orchestrator.stop(PipelineIndex::Mix).await {
                    warn!("Stop before switching failed: {}", e);
                }
                playlist.assign_next(orchestrator);
                next_cycle = Some(due + period);
            }
        }

        if let Err(e) = orchestrator.handle_events().await {
            error!("Fatal playback error: {}", e);
            return Err(e);
        }
    }
}

/// Source list consumed round-robin, one file per source pipeline
struct Playlist {
    uris: Vec<String>,
    cursor: usize,
}

impl Playlist {
    fn new(uris: Vec<String>) -> Self {
        Self { uris, cursor: 0 }
    }

    fn assign_next(&mut self, orchestrator: &mut Orchestrator) {
        let count = orchestrator.source_count().min(self.uris.len());
        for i in 0..count {
            let uri = &self.uris[self.cursor % self.uris.len()];
            if let Err(e) = orchestrator.assign_source(i, uri) {
                warn!("Could not assign {} to source {}: {}", uri, i, e);
            }
            self.cursor += 1;
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
