//! Actuation-voltage validation and amplifier-gain adjustment.
//!
//! Before a feedback-governed measurement begins, and whenever the operating
//! frequency changes, the commanded voltage is checked against a short
//! settle measurement. Adjustment is strictly bounded: the loop re-asserts
//! the target at most `MAX_VOLTAGE_ADJUSTMENTS` times, then proceeds with a
//! warning. A reading below the tolerance floor means the amplifier is not
//! delivering at all and fails the step immediately.

use dmf_traits::{MeasurementRequest, Transport};

use crate::calibration::Calibration;
use crate::error::FeedbackError;
use crate::results::FeedbackResult;
use crate::windows;
use crate::SamplingCfg;

/// Upper bound on voltage re-assertion attempts per validation.
pub const MAX_VOLTAGE_ADJUSTMENTS: u32 = 5;
/// Windows taken per validation measurement, enough for signal and gain to
/// settle.
pub const SETTLE_WINDOWS: u32 = 5;

/// Tracks amplifier-gain initialization and the operating frequency across
/// steps so validation runs only when it has to.
#[derive(Debug, Default)]
pub struct VoltageController {
    gain_initialized: bool,
    current_frequency: Option<f64>,
}

impl VoltageController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gain_initialized(&self) -> bool {
        self.gain_initialized
    }

    /// Forget connection-scoped state; the next step re-initializes the
    /// amplifier gain.
    pub fn reset(&mut self) {
        self.gain_initialized = false;
        self.current_frequency = None;
    }

    /// Whether a step at `frequency` must be validated before measuring.
    pub fn needs_validation(&self, frequency: f64, calibration: &Calibration) -> bool {
        (calibration.auto_adjust_amplifier_gain && !self.gain_initialized)
            || self.current_frequency != Some(frequency)
    }

    /// Record a frequency applied outside validation (e.g. sweep points).
    pub fn note_frequency(&mut self, frequency: f64) {
        self.current_frequency = Some(frequency);
    }

    /// Validate that the board realizes `voltage` at `frequency`.
    ///
    /// Returns the last settle measurement so callers can surface it.
    /// Fails with `LowVoltage` when the measured actuation voltage is below
    /// the tolerance floor (or unreadable).
    pub fn validate<T: Transport + ?Sized>(
        &mut self,
        board: &mut T,
        calibration: &Calibration,
        sampling: &SamplingCfg,
        voltage: f64,
        frequency: f64,
    ) -> Result<FeedbackResult, FeedbackError> {
        let transport = |e: dmf_traits::BoxError| FeedbackError::Transport(e.to_string());

        board.set_waveform_frequency(frequency).map_err(transport)?;
        self.current_frequency = Some(frequency);

        // all channels off while probing the amplifier
        let state = vec![0u8; board.channel_count()];
        let plan = windows::plan(
            sampling.sampling_window_ms,
            SETTLE_WINDOWS,
            0,
            board.command_buffer_size(),
        );
        let req = MeasurementRequest {
            sampling_window_ms: sampling.sampling_window_ms,
            n_sampling_windows: plan.n_sampling_windows,
            delay_between_windows_ms: plan.delay_between_windows_ms,
            interleave_samples: sampling.interleave_samples,
            use_rms: sampling.use_rms,
            channel_state: state,
        };

        let mut adjustments = 0u32;
        loop {
            board.set_waveform_voltage(voltage).map_err(transport)?;
            let raw = board.measure(&req).map_err(transport)?;
            let result = FeedbackResult::from_windows(
                &raw,
                &req,
                voltage,
                frequency,
                0.0,
                calibration.clone(),
            );

            let measured = result.settled_actuation_voltage();
            if !measured.is_finite() || measured < calibration.voltage_tolerance {
                return Err(FeedbackError::LowVoltage {
                    measured,
                    requested: voltage,
                });
            }

            let error = measured - voltage;
            tracing::info!(
                requested = voltage,
                measured,
                error_percent = 100.0 * error / voltage,
                "actuation voltage check"
            );

            if error.abs() <= calibration.voltage_tolerance {
                self.finish_initialization(calibration);
                return Ok(result);
            }

            if !calibration.auto_adjust_amplifier_gain {
                tracing::warn!(
                    requested = voltage,
                    measured,
                    "voltage outside tolerance and gain adjustment is disabled"
                );
                self.finish_initialization(calibration);
                return Ok(result);
            }

            adjustments += 1;
            if adjustments >= MAX_VOLTAGE_ADJUSTMENTS {
                let warn = FeedbackError::VoltageToleranceExceeded {
                    attempts: adjustments,
                };
                tracing::warn!(error = %warn, "proceeding without further correction");
                self.finish_initialization(calibration);
                return Ok(result);
            }
            tracing::info!(adjustments, "re-asserting target voltage");
        }
    }

    fn finish_initialization(&mut self, calibration: &Calibration) {
        if calibration.auto_adjust_amplifier_gain && !self.gain_initialized {
            self.gain_initialized = true;
            tracing::info!(
                gain = calibration.amplifier_gain,
                "amplifier gain initialized"
            );
        }
    }
}
