//! Command implementations: hardware assembly and step execution.

use std::collections::BTreeSet;
use std::path::PathBuf;

use eyre::WrapErr;

use dmf_core::{
    Calibration, CapacitanceCurve, FeedbackAction, FeedbackOptions, RetryAction, SamplingCfg,
    StepOptions, StepOutcome, StepRunner, SweepElectrodesAction, SweepFrequencyAction,
    SweepVoltageAction, VoltageController, run_step,
};
use dmf_hardware::{LoadModel, SimulatedControlBoard};

use crate::cli::ActionKind;

const SIM_CHANNELS: usize = 40;
const SIM_BUFFER_BYTES: usize = 604;

pub struct RunArgs {
    pub duration: u32,
    pub voltage: f64,
    pub frequency: f64,
    pub force: Option<f64>,
    pub channels: Vec<usize>,
    pub area: Option<f64>,
    pub action: ActionKind,
    pub percent_threshold: f64,
    pub increase_voltage: f64,
    pub max_repeats: u32,
    pub sweep_start: Option<f64>,
    pub sweep_end: Option<f64>,
    pub sweep_steps: usize,
    pub no_feedback: bool,
    pub c_drop_csv: Option<PathBuf>,
}

fn channel_state(channels: &[usize], n: usize) -> Vec<u8> {
    let mut state = vec![0u8; n];
    for &c in channels {
        if let Some(slot) = state.get_mut(c) {
            *slot = 1;
        } else {
            tracing::warn!(channel = c, "channel beyond board channel count; ignored");
        }
    }
    state
}

fn build_action(args: &RunArgs, cal: &Calibration) -> FeedbackAction {
    match args.action {
        ActionKind::Retry => FeedbackAction::Retry(RetryAction {
            percent_threshold: args.percent_threshold,
            increase_voltage: args.increase_voltage,
            increase_force: 0.0,
            max_repeats: args.max_repeats,
        }),
        ActionKind::SweepFrequency => {
            let mut a = SweepFrequencyAction::from_board_limits(cal);
            if let Some(s) = args.sweep_start {
                a.start_frequency = s;
            }
            if let Some(e) = args.sweep_end {
                a.end_frequency = e;
            }
            a.n_frequency_steps = args.sweep_steps;
            FeedbackAction::SweepFrequency(a)
        }
        ActionKind::SweepVoltage => FeedbackAction::SweepVoltage(SweepVoltageAction {
            start_voltage: args.sweep_start.unwrap_or(5.0),
            end_voltage: args.sweep_end.unwrap_or(args.voltage),
            n_voltage_steps: args.sweep_steps,
        }),
        ActionKind::SweepElectrodes => {
            let channels: BTreeSet<usize> = args.channels.iter().copied().collect();
            FeedbackAction::SweepElectrodes(SweepElectrodesAction { channels })
        }
    }
}

pub fn run(cfg: &dmf_config::Config, args: RunArgs, json: bool) -> eyre::Result<()> {
    let mut calibration = Calibration::from_config(cfg);
    if let Some(path) = &args.c_drop_csv {
        let rows =
            dmf_config::load_capacitance_csv(path).wrap_err("loading drop capacitance curve")?;
        let points = rows.iter().map(|r| (r.frequency, r.capacitance)).collect();
        calibration.c_drop = CapacitanceCurve::new(points);
    } else if calibration.c_drop.is_none() {
        // the simulated droplet's fully-covered capacitance
        calibration.c_drop = CapacitanceCurve::flat(LoadModel::default().c_drop_per_mm2);
    }

    let board = SimulatedControlBoard::new(SIM_CHANNELS, SIM_BUFFER_BYTES);
    let sampling = SamplingCfg::from(&cfg.sampling);
    let action = build_action(&args, &calibration);

    let mut runner = StepRunner::builder()
        .with_board(board)
        .with_calibration(calibration)
        .with_sampling(sampling)
        .with_update_hook(|result| {
            let z = dmf_core::util::nan_mean(&result.impedance(None));
            let c = dmf_core::util::nan_mean(&result.capacitance(None));
            tracing::info!(
                voltage = result.settled_actuation_voltage(),
                impedance_ohm = z,
                capacitance_f = c,
                "measurement update"
            );
        })
        .build()?;

    let state = channel_state(&args.channels, SIM_CHANNELS);
    let actuated = state.iter().filter(|&&s| s != 0).count();
    let area = args
        .area
        .unwrap_or(actuated as f64 * LoadModel::default().electrode_area_mm2);

    let options = StepOptions {
        duration_ms: args.duration,
        voltage: args.voltage,
        frequency: args.frequency,
        force: args.force,
        feedback: FeedbackOptions {
            feedback_enabled: !args.no_feedback,
            action,
        },
    };

    let outcome = run_step(&mut runner, options, state, area)?;
    let attempts = runner.outcome_log().len();
    let error = runner.last_error().map(ToString::to_string);
    let series = runner.take_series();

    if json {
        let series_json = series.map(|s| {
            let stats: Vec<_> = s
                .values()
                .iter()
                .zip(s.capacitance_stats())
                .map(|(v, (mean, std))| {
                    serde_json::json!({ "value": v, "capacitance_mean": mean, "capacitance_std": std })
                })
                .collect();
            serde_json::json!({ "axis": s.axis().to_string(), "points": stats })
        });
        let out = serde_json::json!({
            "outcome": outcome.as_str(),
            "attempts": attempts,
            "error": error,
            "series": series_json,
        });
        println!("{out}");
    } else {
        println!("step outcome: {}", outcome.as_str());
        if let Some(err) = error {
            println!("error: {err}");
        }
        if let Some(s) = series {
            println!("sweep over {}: {} points", s.axis(), s.len());
            for (value, (mean, _std)) in s.values().iter().zip(s.capacitance_stats()) {
                println!("  {value:>12.2}  C = {mean:.3e} F");
            }
        }
    }

    if outcome == StepOutcome::Fail {
        std::process::exit(1);
    }
    Ok(())
}

pub fn check(
    cfg: &dmf_config::Config,
    voltage: f64,
    frequency: f64,
    amplifier_off: bool,
    json: bool,
) -> eyre::Result<()> {
    let calibration = Calibration::from_config(cfg);
    let mut board = SimulatedControlBoard::new(SIM_CHANNELS, SIM_BUFFER_BYTES);
    if amplifier_off {
        board = board.with_amplifier_off();
    }
    let sampling = SamplingCfg::from(&cfg.sampling);

    let mut ctl = VoltageController::new();
    match ctl.validate(&mut board, &calibration, &sampling, voltage, frequency) {
        Ok(result) => {
            let measured = result.settled_actuation_voltage();
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "ok": true, "requested": voltage, "measured": measured })
                );
            } else {
                println!("voltage ok: requested {voltage:.1} V, measured {measured:.1} V");
            }
            Ok(())
        }
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "ok": false, "error": e.to_string() })
                );
            } else {
                eprintln!("voltage check failed: {e}");
            }
            std::process::exit(1);
        }
    }
}

pub fn plan(window_ms: u32, windows: u32, delay_ms: u32, buffer: usize, json: bool) {
    let plan = dmf_core::windows::plan(window_ms, windows, delay_ms, buffer);
    if json {
        println!(
            "{}",
            serde_json::json!({
                "n_sampling_windows": plan.n_sampling_windows,
                "delay_between_windows_ms": plan.delay_between_windows_ms,
                "adjusted": plan.adjusted,
            })
        );
    } else if plan.adjusted {
        println!(
            "request shrunk to fit: {} windows, {} ms delay",
            plan.n_sampling_windows, plan.delay_between_windows_ms
        );
    } else {
        println!(
            "request fits: {} windows, {} ms delay",
            plan.n_sampling_windows, plan.delay_between_windows_ms
        );
    }
}
