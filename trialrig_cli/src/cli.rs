//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "trialrig", version, about = "Closed-loop wheel task trial engine")]
pub struct Cli {
    /// Config TOML; repeat to layer files, later ones override earlier keys
    #[arg(long, value_name = "FILE", action = ArgAction::Append)]
    pub config: Vec<PathBuf>,

    /// Valve calibration CSV (strict header: open_time_ms,volume_ul)
    #[arg(long, value_name = "FILE")]
    pub calibration: Option<PathBuf>,

    /// Print JSON lines instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); overrides [logging] level
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a session against the simulated state-machine runtime
    Run {
        /// Directory watched for .pause and .stop
        #[arg(long, value_name = "DIR", default_value = ".")]
        session_dir: PathBuf,
        /// Stop after this many trials (overrides session.max_trials; 0 = until .stop)
        #[arg(long, value_name = "N")]
        trials: Option<usize>,
        /// Seed for trial draws and the simulated subject
        #[arg(long)]
        seed: Option<u64>,
        /// Training state file, loaded at start and rewritten at the end
        #[arg(long, value_name = "FILE")]
        state: Option<PathBuf>,
        /// Subject weight in grams for the adaptive reward
        #[arg(long, value_name = "GRAMS")]
        subject_weight_g: Option<f64>,
    },
    /// Print the spacer pulse times, or its sampled template
    Spacer {
        /// Print the template instead of the pulse times
        #[arg(long, action = ArgAction::SetTrue)]
        template: bool,
        /// Sampling rate for --template, in Hz
        #[arg(long, value_name = "HZ", default_value_t = 1000.0)]
        fs: f64,
    },
    /// Convert between reward volume and valve open time
    Valve {
        /// Volume in microlitres to convert to an open time
        #[arg(long, value_name = "UL", conflicts_with = "ms", required_unless_present = "ms")]
        ul: Option<f64>,
        /// Open time in milliseconds to convert to a volume
        #[arg(long, value_name = "MS")]
        ms: Option<f64>,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Print the state machine of the first trial
    Fsm {
        #[arg(long)]
        seed: Option<u64>,
    },
}
