//! CLI entry point for the simulated rig.
//!
//! # Usage
//!
//! Acquire a z-stack from 0 to 50 µm in 1 µm steps at 100 fps:
//! ```bash
//! ephys-sim zstack --start 0 --end 50 --step 1 --fps 100
//! ```
//!
//! Walk the patch state machine:
//! ```bash
//! ephys-sim --log-level debug patch --states bath,approach --target 0,0,-50
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rust_ephys::config::RigConfig;
use rust_ephys::logging::{self, OutputFormat};
use rust_ephys::sim::{self, PatchRequest, ZStackRequest};
use std::path::PathBuf;
use std::time::Duration;

const UM: f64 = 1e-6;

#[derive(Parser)]
#[command(name = "ephys-sim")]
#[command(about = "Run rig procedures against simulated hardware", long_about = None)]
struct Cli {
    /// Rig config file (TOML). `EPHYS_` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the config.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format, overriding the config.
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    /// Print the summary as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire one z-stack (depths in µm)
    Zstack {
        /// First depth
        #[arg(long, allow_hyphen_values = true)]
        start: f64,

        /// Last depth
        #[arg(long, allow_hyphen_values = true)]
        end: f64,

        /// Step size
        #[arg(long, default_value = "1.0")]
        step: f64,

        /// Camera frame rate
        #[arg(long)]
        fps: Option<f64>,
    },

    /// Enter patch states one after another
    Patch {
        /// States to enter, comma separated
        #[arg(long, value_delimiter = ',', default_value = "bath")]
        states: Vec<String>,

        /// Milliseconds to let each state run
        #[arg(long, default_value = "2000")]
        dwell_ms: u64,

        /// Approach target `x,y,z` in µm
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        target: Option<Vec<f64>>,
    },

    /// Take a reference stack and correct a tip calibration error
    Track {
        /// Where the tip really is relative to where it is reported, `x,y,z` in µm
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, default_value = "3,-2,0")]
        offset: Vec<f64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RigConfig::load_from(path)?,
        None => RigConfig::from_env()?,
    };
    if let Some(level) = &cli.log_level {
        logging::parse_log_level(level)?;
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    logging::init(&config.logging)?;

    match cli.command {
        Commands::Zstack { start, end, step, fps } => {
            if let Some(fps) = fps {
                config.rig.camera.fps = fps;
            }
            let request = ZStackRequest {
                start: start * UM,
                end: end * UM,
                step: step * UM,
            };
            println!("🔬 z-stack {start} → {end} µm, step {step} µm");
            let summary = sim::run_z_stack(&config, request)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("   {} frames at {} fps", summary.depths.len(), summary.fps);
                println!("   worst depth error {:.3} µm", summary.max_depth_error / UM);
            }
        }
        Commands::Patch {
            states,
            dwell_ms,
            target,
        } => {
            let request = PatchRequest {
                states,
                dwell: Duration::from_millis(dwell_ms),
                target: target.map(|t| micrometers(&t)).transpose()?,
            };
            println!("🧪 patch states: {}", request.states.join(" → "));
            let summary = sim::run_patch(&config, &request)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for visit in &summary.visited {
                    let status = match (&visit.error, visit.finished) {
                        (Some(error), _) => format!("failed: {error}"),
                        (None, true) => "finished".to_string(),
                        (None, false) => "running".to_string(),
                    };
                    println!("   {:<12} → {:<12} {status}", visit.requested, visit.reached);
                }
                for (kind, count) in &summary.events {
                    println!("   {kind:<24} {count}");
                }
            }
        }
        Commands::Track { offset } => {
            let offset = micrometers(&offset)?;
            println!("🎯 tracking with true tip offset {:?} µm", offset.map(|v| v / UM));
            let summary = sim::run_tracking(&config, offset)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("   reference '{}'", summary.reference_key);
                println!("   measured error {:?} µm", summary.error.map(|v| v / UM));
            }
        }
    }
    Ok(())
}

fn micrometers(values: &[f64]) -> Result<[f64; 3]> {
    match values {
        [x, y, z] => Ok([x * UM, y * UM, z * UM]),
        _ => bail!("expected three comma-separated values, got {}", values.len()),
    }
}
