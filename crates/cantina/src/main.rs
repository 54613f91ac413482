use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use cantina::music::output::{AudioOutput, NullOutput};
use cantina::voice::clients::{NullLlm, NullStt, NullTts};
use cantina::{Collaborators, Supervisor};
use cantinaconf::CantinaConfig;
use cantinaproto::sources;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// The CantinaOS daemon
///
/// Orchestrates the animatronic DJ: voice pipeline, music engine, DJ
/// auto-sequencer, eye lights, and the dashboard bridge.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/cantina/config.toml
/// 3. ~/.config/cantina/config.toml
/// 4. ./cantina.toml (or --config path)
/// 5. Environment variables (CANTINA_*)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./cantina.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cantina: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let (config, config_sources) = CantinaConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &config_sources.files {
            println!("#   - {}", path.display());
        }
        if !config_sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &config_sources.env_overrides {
                println!("#   - {var}");
            }
        }
        println!();
        println!("{}", config.to_toml());
        return Ok(());
    }

    let log_rx = cantina::telemetry::init(&config.logging);

    info!("Configuration loaded from:");
    for path in &config_sources.files {
        info!("   - {}", path.display());
    }
    if !config_sources.env_overrides.is_empty() {
        info!("   Environment overrides: {:?}", config_sources.env_overrides);
    }

    std::fs::create_dir_all(&config.paths.state_dir)
        .context("Failed to create state directory")?;
    if !config.paths.music_dir.exists() {
        warn!(
            dir = %config.paths.music_dir.display(),
            "music directory does not exist, the library will be empty"
        );
    }

    let output = open_audio_output(&config);
    let collaborators = Collaborators {
        output,
        stt: Arc::new(NullStt),
        llm: Arc::new(NullLlm::default()),
        tts: Arc::new(NullTts),
        link_factory: Supervisor::link_factory_from(&config),
        log_rx,
    };

    let (mut supervisor, dispatcher) = Supervisor::build(&config, collaborators);
    supervisor
        .start_all()
        .await
        .context("startup failed")?;

    // Ctrl-C: first asks for a clean shutdown, second aborts hard (exit 2).
    {
        let bus = Arc::clone(supervisor.bus());
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                bus.emit(
                    cantinaproto::topics::SHUTDOWN_REQUESTED,
                    sources::INTERNAL,
                    cantinaproto::Payload::ShutdownRequested,
                )
                .await;
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cantina: aborted");
                std::process::exit(2);
            }
        });
    }

    // CLI REPL on stdin.
    {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match dispatcher.handle_line(&line, sources::CLI).await {
                    Ok(Some(output)) => println!("{output}"),
                    Ok(None) => {}
                    Err(e) => eprintln!("error: {e}"),
                }
            }
        });
    }

    supervisor.run_until_shutdown().await;
    Ok(())
}

fn open_audio_output(config: &CantinaConfig) -> Arc<dyn AudioOutput> {
    match config.audio.backend.as_str() {
        "rodio" => {
            #[cfg(feature = "rodio-output")]
            match cantina::music::output::RodioOutput::open() {
                Ok(output) => return output,
                Err(e) => {
                    warn!(error = %e, "audio device unavailable, using null output");
                }
            }
            #[cfg(not(feature = "rodio-output"))]
            warn!("built without rodio-output, using null output");
        }
        "null" => {}
        other => warn!(backend = %other, "unknown audio backend, using null output"),
    }
    NullOutput::new()
}
