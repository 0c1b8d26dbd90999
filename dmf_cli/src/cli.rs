//! CLI argument definitions.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "dmf", version, about = "DMF control board feedback CLI")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ActionKind {
    Retry,
    SweepFrequency,
    SweepVoltage,
    SweepElectrodes,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one protocol step against the simulated board
    Run {
        /// Step duration in ms
        #[arg(long, default_value_t = 100)]
        duration: u32,

        /// RMS actuation voltage (V)
        #[arg(long, default_value_t = 100.0)]
        voltage: f64,

        /// Waveform frequency (Hz)
        #[arg(long, default_value_t = 1e3)]
        frequency: f64,

        /// Target line force in µN/mm (derives voltage from calibration)
        #[arg(long)]
        force: Option<f64>,

        /// Actuated channels, e.g. "0,1,5"
        #[arg(long, default_value = "0", value_delimiter = ',')]
        channels: Vec<usize>,

        /// Actuated area in mm²; defaults to 9 mm² per actuated channel
        #[arg(long)]
        area: Option<f64>,

        /// Feedback action governing the step
        #[arg(long, value_enum, default_value_t = ActionKind::Retry)]
        action: ActionKind,

        /// Retry: percent of drop capacitance to reach
        #[arg(long, default_value_t = 80.0)]
        percent_threshold: f64,

        /// Retry: voltage added per repeat (V)
        #[arg(long, default_value_t = 5.0)]
        increase_voltage: f64,

        /// Retry: maximum repeats before failing
        #[arg(long, default_value_t = 3)]
        max_repeats: u32,

        /// Sweep: start of the swept range (Hz or V)
        #[arg(long)]
        sweep_start: Option<f64>,

        /// Sweep: end of the swept range (Hz or V)
        #[arg(long)]
        sweep_end: Option<f64>,

        /// Sweep: number of points
        #[arg(long, default_value_t = 10)]
        sweep_steps: usize,

        /// Disable feedback: settle for the duration and complete
        #[arg(long, action = ArgAction::SetTrue)]
        no_feedback: bool,

        /// Drop capacitance curve CSV (frequency,capacitance)
        #[arg(long, value_name = "FILE")]
        c_drop_csv: Option<PathBuf>,
    },
    /// Validate that the board realizes a commanded voltage
    Check {
        #[arg(long, default_value_t = 100.0)]
        voltage: f64,

        #[arg(long, default_value_t = 1e3)]
        frequency: f64,

        /// Simulate a dead amplifier
        #[arg(long, action = ArgAction::SetTrue)]
        amplifier_off: bool,
    },
    /// Preview how a sampling request fits the command buffer
    Plan {
        #[arg(long)]
        window_ms: u32,

        #[arg(long)]
        windows: u32,

        #[arg(long, default_value_t = 0)]
        delay_ms: u32,

        /// Transport command buffer size in bytes
        #[arg(long, default_value_t = 604)]
        buffer: usize,
    },
}
