//! # facelink
//!
//! Host and stage worker binary.
//!
//! # Usage
//!
//! ```bash
//! # Run the full face swap pipeline
//! facelink run facelink --userdata-dir ~/.facelink
//!
//! # Capture straight to output, with debug logs as JSON
//! facelink --verbose --json run passthrough --userdata-dir /tmp/fl
//! ```
//!
//! The host re-executes this binary with the hidden `worker` command once
//! per stage. Workers talk to the host over stdin/stdout and log to stderr.

use clap::{Parser, Subcommand};
use facelink::backends::DeviceRegistry;
use facelink::host::{self, HostOptions};
use facelink::stages::{StageKind, run_stage};
use facelink::wiring::process_launchers;
use facelink_common::consts::DEFAULT_TICK_INTERVAL_MS;
use facelink_control::MessagePipe;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// facelink - real-time face swap pipeline
#[derive(Parser, Debug)]
#[command(name = "facelink")]
#[command(version)]
#[command(about = "Real-time face swap pipeline over shared memory")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a stage app until Ctrl+C
    Run {
        /// App to run
        app: String,

        /// Directory for the config file and persisted state
        #[arg(long, value_name = "DIR")]
        userdata_dir: PathBuf,
    },

    /// Run one stage worker over stdin/stdout (started by the host)
    #[command(hide = true)]
    Worker {
        /// Stage to run
        #[arg(long)]
        stage: String,

        /// Minimum interval between worker ticks
        #[arg(long, default_value_t = DEFAULT_TICK_INTERVAL_MS)]
        tick_interval_ms: u64,
    },
}

fn main() {
    if let Err(e) = run() {
        error!("FATAL: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Run { app, userdata_dir } => {
            let config = host::load_config(userdata_dir);
            let level = config
                .as_ref()
                .map(|c| c.shared.log_level.as_directive())
                .unwrap_or("info");
            let filter = setup_tracing(&cli, level);
            let config = config?;

            info!("facelink v{} starting app {}", env!("CARGO_PKG_VERSION"), app);
            let options = HostOptions {
                app: app.clone(),
                userdata_dir: userdata_dir.clone(),
            };
            let launchers = process_launchers(config.pipeline.tick_interval(), filter, cli.json);
            host::run_host(&options, &config, launchers)?;
        }
        Command::Worker { stage, tick_interval_ms } => {
            setup_tracing(&cli, "info");
            let kind: StageKind = stage.parse()?;
            let pipe = MessagePipe::from_stdio()?;
            run_stage(
                kind,
                pipe,
                Duration::from_millis(*tick_interval_ms),
                DeviceRegistry::simulated(),
            )?;
        }
    }
    Ok(())
}

/// Install the stderr subscriber and return the filter workers should inherit.
///
/// `RUST_LOG` wins when set; otherwise `--verbose` selects debug and
/// `default_level` applies.
fn setup_tracing(cli: &Cli, default_level: &str) -> String {
    let directives = match std::env::var("RUST_LOG") {
        Ok(env) if !env.is_empty() => env,
        _ if cli.verbose => "debug".to_string(),
        _ => default_level.to_string(),
    };
    let filter = EnvFilter::new(&directives);

    if cli.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    directives
}
