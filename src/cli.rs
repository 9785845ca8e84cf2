use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use cansentry::alerting::AlertManager;
use cansentry::baseline::persist;
use cansentry::config::Config;
use cansentry::engine::{spawn_maintenance, Pipeline};
use cansentry::source::{PacedReplaySource, TraceFileSource};

#[derive(Parser)]
#[command(name = "cansentry")]
#[command(author, version, about = "Baseline-learning intrusion detection for CAN buses")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct SourceArgs {
    /// CAN trace file to read
    #[arg(short, long)]
    pub input: PathBuf,

    /// Replay the trace at its recorded cadence instead of
    /// processing it as fast as possible
    #[arg(long)]
    pub real_time: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Learn a baseline from traffic and save it
    Learn {
        #[command(flatten)]
        source: SourceArgs,

        /// Where to write the learned baseline
        #[arg(short, long, default_value = "baseline.json")]
        baseline: PathBuf,

        /// Override the learning window, seconds
        #[arg(long)]
        learning_duration: Option<u64>,
    },

    /// Detect against a previously learned baseline
    Detect {
        #[command(flatten)]
        source: SourceArgs,

        /// Baseline to load
        #[arg(short, long, default_value = "baseline.json")]
        baseline: PathBuf,
    },

    /// Learn for the configured window, then keep detecting
    Auto {
        #[command(flatten)]
        source: SourceArgs,

        /// Save the learned baseline here as well
        #[arg(short, long)]
        baseline: Option<PathBuf>,

        /// Override the learning window, seconds
        #[arg(long)]
        learning_duration: Option<u64>,
    },
}

pub fn run_command(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Learn {
            source,
            baseline,
            learning_duration,
        } => {
            if let Some(duration) = learning_duration {
                config.learning.initial_learning_window_sec = duration;
            }
            let alerts = build_alert_manager(&config)?;
            let mut pipeline = Pipeline::learn(config, alerts)?;
            drive(&mut pipeline, &source)?;
            pipeline.save_baseline(&baseline)?;
            info!(baseline = %baseline.display(), "learning run complete");
            Ok(())
        }

        Commands::Detect { source, baseline } => {
            let loaded = persist::load(&baseline)
                .with_context(|| format!("loading baseline from {}", baseline.display()))?;
            let alerts = build_alert_manager(&config)?;
            let mut pipeline = Pipeline::detect(config, loaded, alerts)?;
            let frames = drive(&mut pipeline, &source)?;
            info!(frames, "detection run complete");
            Ok(())
        }

        Commands::Auto {
            source,
            baseline,
            learning_duration,
        } => {
            if let Some(duration) = learning_duration {
                config.learning.initial_learning_window_sec = duration;
            }
            let alerts = build_alert_manager(&config)?;
            let mut pipeline = Pipeline::learn(config, alerts)?;
            let frames = drive(&mut pipeline, &source)?;
            if let Some(path) = baseline {
                pipeline.save_baseline(&path)?;
            }
            info!(frames, "auto run complete");
            Ok(())
        }
    }
}

fn build_alert_manager(config: &Config) -> Result<AlertManager> {
    AlertManager::with_standard_sinks(config.throttle.clone(), config.alerts.clone())
        .context("initializing alert sinks")
}

/// Wire up shutdown and maintenance, then run the pipeline over the
/// configured source.
fn drive(pipeline: &mut Pipeline, source_args: &SourceArgs) -> Result<u64> {
    let shutdown = pipeline.shutdown_handle();
    ctrlc::set_handler(move || {
        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    })
    .context("installing shutdown handler")?;

    let (tx, rx) = crossbeam_channel::unbounded();
    pipeline.set_maintenance_channel(rx);
    let maintenance_shutdown = pipeline.shutdown_handle();
    let maintenance = spawn_maintenance(
        tx,
        Duration::from_secs(60),
        Duration::from_secs(10),
        maintenance_shutdown.clone(),
    );

    let trace = TraceFileSource::open(&source_args.input)?;
    let frames = if source_args.real_time {
        let mut source = PacedReplaySource::new(trace);
        pipeline.run(&mut source)?
    } else {
        let mut source = trace;
        pipeline.run(&mut source)?
    };

    maintenance_shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = maintenance.join();
    Ok(frames)
}
