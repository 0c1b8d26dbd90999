#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Feedback measurement and control engine for a DMF control board
//! (hardware-agnostic).
//!
//! All hardware interaction goes through the `dmf_traits::Transport` trait;
//! the byte protocol, serial discovery and firmware management live on the
//! other side of it.
//!
//! ## Architecture
//!
//! - **Calibration**: resistor banks + specific-capacitance curves
//!   (`calibration` module)
//! - **Quantities**: impedance/capacitance/voltage/motion derivation with
//!   NaN-absorbing math (`results`, `filter`)
//! - **Scheduling**: buffer-aware sampling-window sizing (`windows`)
//! - **Actions**: retry/sweep decision machine (`action`)
//! - **Control**: bounded voltage/gain validation loop (`control`)
//! - **Orchestration**: cooperative per-step state machine (`runner`)
//!
//! ## Concurrency model
//!
//! Single-threaded and cooperative: measurement logic never blocks and never
//! overlaps. The runner hands back at most one scheduled continuation at a
//! time and cancellation is a first-class operation, so a stale callback can
//! never drive electrodes after a new step has started.

pub mod action;
pub mod calibration;
pub mod control;
pub mod error;
pub mod filter;
pub mod mocks;
pub mod results;
pub mod runner;
pub mod util;
pub mod windows;

pub use action::{
    ActionState, Decision, FeedbackAction, RetryAction, SweepElectrodesAction,
    SweepFrequencyAction, SweepVoltageAction,
};
pub use calibration::{Calibration, CapacitanceCurve};
pub use control::VoltageController;
pub use error::{BuildError, FeedbackError, Result};
pub use results::{FeedbackResult, FeedbackResultsSeries, SweepAxis};
pub use runner::{StepOutcome, StepRunner, StepStatus, run_step};
pub use windows::WindowPlan;

/// How measurement commands are windowed and encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingCfg {
    /// Duration of one sampling window (ms).
    pub sampling_window_ms: u32,
    /// Requested idle gap between consecutive windows (ms).
    pub delay_between_windows_ms: u32,
    /// Interleave high-voltage and feedback samples within a window.
    pub interleave_samples: bool,
    /// Report per-window RMS amplitudes; peak amplitudes when false.
    pub use_rms: bool,
}

impl Default for SamplingCfg {
    fn default() -> Self {
        Self {
            sampling_window_ms: 10,
            delay_between_windows_ms: 0,
            interleave_samples: true,
            use_rms: true,
        }
    }
}

impl From<&dmf_config::SamplingCfg> for SamplingCfg {
    fn from(cfg: &dmf_config::SamplingCfg) -> Self {
        Self {
            sampling_window_ms: cfg.sampling_window_ms,
            delay_between_windows_ms: cfg.delay_between_windows_ms,
            interleave_samples: cfg.interleave_samples,
            use_rms: cfg.use_rms,
        }
    }
}

/// Feedback behavior of one protocol step.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackOptions {
    pub feedback_enabled: bool,
    pub action: FeedbackAction,
}

impl Default for FeedbackOptions {
    fn default() -> Self {
        Self {
            feedback_enabled: true,
            action: FeedbackAction::default(),
        }
    }
}

/// Everything one protocol step asks of the engine.
///
/// When `force` is set and the drop capacitance has been calibrated, the
/// step voltage is derived from the target line force instead of `voltage`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOptions {
    pub duration_ms: u32,
    /// RMS actuation voltage (V).
    pub voltage: f64,
    /// Waveform frequency (Hz).
    pub frequency: f64,
    /// Target line force (µN/mm) under force normalization.
    pub force: Option<f64>,
    pub feedback: FeedbackOptions,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            duration_ms: 100,
            voltage: 100.0,
            frequency: 1e3,
            force: None,
            feedback: FeedbackOptions::default(),
        }
    }
}
