//! Feedback actions and the per-measurement decision machine.
//!
//! Exactly one action variant governs a step at a time. `ActionState` is
//! built from the variant at step start and owns its configuration, so
//! switching variants rebuilds the state and discards prior sweep progress.
//! One `decide` transition runs per completed measurement.

use std::collections::BTreeSet;
use std::mem;

use crate::calibration::Calibration;
use crate::results::{FeedbackResult, FeedbackResultsSeries, SweepAxis};
use crate::util::{last_finite, lin_spaced, log_spaced};

/// Repeat the step with a voltage (or force) bump until the normalized
/// capacitance crosses a fraction of the calibrated drop capacitance.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAction {
    /// Percent of `c_drop(f)` the normalized capacitance must reach.
    pub percent_threshold: f64,
    /// Voltage added per repeat attempt (V RMS).
    pub increase_voltage: f64,
    /// Force added per repeat attempt (µN/mm), used under force
    /// normalization instead of `increase_voltage`.
    pub increase_force: f64,
    pub max_repeats: u32,
}

impl Default for RetryAction {
    fn default() -> Self {
        Self {
            percent_threshold: 0.0,
            increase_voltage: 0.0,
            increase_force: 0.0,
            max_repeats: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepFrequencyAction {
    pub start_frequency: f64,
    pub end_frequency: f64,
    pub n_frequency_steps: usize,
}

impl Default for SweepFrequencyAction {
    fn default() -> Self {
        Self {
            start_frequency: 100.0,
            end_frequency: 20e3,
            n_frequency_steps: 10,
        }
    }
}

impl SweepFrequencyAction {
    /// Default range seeded from the board's waveform limits.
    pub fn from_board_limits(cal: &Calibration) -> Self {
        Self {
            start_frequency: cal.min_waveform_frequency,
            end_frequency: cal.max_waveform_frequency,
            n_frequency_steps: 10,
        }
    }

    /// The closed, ordered, log-spaced frequency sequence.
    pub fn frequencies(&self) -> Vec<f64> {
        log_spaced(self.start_frequency, self.end_frequency, self.n_frequency_steps)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepVoltageAction {
    pub start_voltage: f64,
    pub end_voltage: f64,
    pub n_voltage_steps: usize,
}

impl Default for SweepVoltageAction {
    fn default() -> Self {
        Self {
            start_voltage: 5.0,
            end_voltage: 100.0,
            n_voltage_steps: 20,
        }
    }
}

impl SweepVoltageAction {
    /// The closed, ordered, linear voltage sequence.
    pub fn voltages(&self) -> Vec<f64> {
        lin_spaced(self.start_voltage, self.end_voltage, self.n_voltage_steps)
    }
}

/// Measure each configured channel alone: a degenerate single-channel sweep
/// of the same shape as a voltage sweep.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SweepElectrodesAction {
    pub channels: BTreeSet<usize>,
}

/// The feedback behavior configured for one protocol step.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackAction {
    Retry(RetryAction),
    SweepFrequency(SweepFrequencyAction),
    SweepVoltage(SweepVoltageAction),
    SweepElectrodes(SweepElectrodesAction),
}

impl Default for FeedbackAction {
    fn default() -> Self {
        Self::Retry(RetryAction::default())
    }
}

/// What the state machine decided after one completed measurement.
#[derive(Debug)]
pub enum Decision {
    /// Retry threshold met; the step succeeded.
    Ok,
    /// Below threshold with attempts left: reissue at the given (1-based)
    /// attempt number.
    Repeat { attempt: u32 },
    /// Attempts exhausted without crossing the threshold.
    Fail,
    /// Sweep: issue the next point.
    Next { axis: SweepAxis, value: f64 },
    /// Sweep exhausted; the accumulated series.
    SeriesComplete(FeedbackResultsSeries),
}

/// Per-step progress of the active action variant.
#[derive(Debug)]
pub enum ActionState {
    Retry {
        cfg: RetryAction,
        attempt: u32,
    },
    Sweep {
        axis: SweepAxis,
        values: Vec<f64>,
        /// Index of the next value to issue.
        next: usize,
        /// Value the outstanding measurement was taken at.
        current: Option<f64>,
        series: FeedbackResultsSeries,
    },
}

impl ActionState {
    pub fn new(action: &FeedbackAction) -> Self {
        let (axis, values) = match action {
            FeedbackAction::Retry(cfg) => {
                return Self::Retry {
                    cfg: cfg.clone(),
                    attempt: 0,
                };
            }
            FeedbackAction::SweepFrequency(a) => (SweepAxis::Frequency, a.frequencies()),
            FeedbackAction::SweepVoltage(a) => (SweepAxis::Voltage, a.voltages()),
            FeedbackAction::SweepElectrodes(a) => (
                SweepAxis::Channel,
                a.channels.iter().map(|&c| c as f64).collect(),
            ),
        };
        Self::Sweep {
            axis,
            series: FeedbackResultsSeries::new(axis),
            values,
            next: 0,
            current: None,
        }
    }

    /// Current 0-based retry attempt (0 for sweeps).
    pub fn attempt(&self) -> u32 {
        match self {
            Self::Retry { attempt, .. } => *attempt,
            Self::Sweep { .. } => 0,
        }
    }

    /// Retry configuration, when a retry action governs the step.
    pub fn retry_cfg(&self) -> Option<&RetryAction> {
        match self {
            Self::Retry { cfg, .. } => Some(cfg),
            Self::Sweep { .. } => None,
        }
    }

    /// The swept axis, when a sweep governs the step.
    pub fn axis(&self) -> Option<SweepAxis> {
        match self {
            Self::Retry { .. } => None,
            Self::Sweep { axis, .. } => Some(*axis),
        }
    }

    /// For sweeps: the first value to issue. Marks it outstanding.
    pub fn first_target(&mut self) -> Option<(SweepAxis, f64)> {
        match self {
            Self::Retry { .. } => None,
            Self::Sweep {
                axis,
                values,
                next,
                current,
                ..
            } => {
                let value = *values.first()?;
                *current = Some(value);
                *next = 1;
                Some((*axis, value))
            }
        }
    }

    /// One transition per completed measurement.
    pub fn decide(&mut self, result: FeedbackResult, calibration: &Calibration) -> Decision {
        match self {
            Self::Retry { cfg, attempt } => decide_retry(attempt, cfg, &result, calibration),
            Self::Sweep {
                axis,
                values,
                next,
                current,
                series,
            } => {
                // key the finished measurement by the value it was taken at
                let value = current.take().unwrap_or(f64::NAN);
                series.push(value, result);
                if *next < values.len() {
                    let value = values[*next];
                    *next += 1;
                    *current = Some(value);
                    Decision::Next { axis: *axis, value }
                } else {
                    let done = mem::replace(series, FeedbackResultsSeries::new(*axis));
                    Decision::SeriesComplete(done)
                }
            }
        }
    }
}

fn decide_retry(
    attempt: &mut u32,
    cfg: &RetryAction,
    result: &FeedbackResult,
    calibration: &Calibration,
) -> Decision {
    let reached = match calibration.c_drop_at(result.frequency) {
        // no drop calibration yet: nothing to compare against
        Err(_) => true,
        Ok(c_drop) => {
            let norm = result.normalized_capacitance(None);
            match last_finite(&norm) {
                Some(latest) => {
                    let threshold = cfg.percent_threshold / 100.0 * c_drop;
                    tracing::debug!(
                        attempt = *attempt,
                        normalized_capacitance = latest,
                        threshold,
                        "retry threshold check"
                    );
                    latest >= threshold
                }
                None => false,
            }
        }
    };

    if reached {
        tracing::info!(attempt = *attempt, "capacitance threshold reached");
        Decision::Ok
    } else if *attempt < cfg.max_repeats {
        *attempt += 1;
        tracing::info!(attempt = *attempt, "capacitance below threshold; repeating");
        Decision::Repeat { attempt: *attempt }
    } else {
        tracing::info!(
            attempts = *attempt + 1,
            "capacitance below threshold; attempts exhausted"
        );
        Decision::Fail
    }
}
