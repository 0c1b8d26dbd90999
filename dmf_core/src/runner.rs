//! Step orchestration: one protocol step driven under feedback.
//!
//! `StepRunner` is an explicit state machine advanced cooperatively.
//! `start_step` and `fire` each run to completion and either finish the step
//! or hand back a single scheduled continuation (`StepStatus::Pending`) for
//! the caller's timer facility. There is never more than one outstanding
//! continuation: starting a step cancels the previous one, and `fire`
//! without one is a state error. Long sequences (retries, sweeps) are chains
//! of continuations, never blocking loops; `run_step` is the blocking
//! convenience driver over the same machine.

use std::sync::Arc;
use std::time::Duration;

use dmf_traits::{Clock, MeasurementRequest, MonotonicClock, Transport};

use crate::action::{ActionState, Decision, SweepFrequencyAction};
use crate::calibration::Calibration;
use crate::control::VoltageController;
use crate::error::{BuildError, FeedbackError, Report, Result};
use crate::results::{FeedbackResult, FeedbackResultsSeries, SweepAxis};
use crate::util::nan_mean;
use crate::windows;
use crate::{SamplingCfg, StepOptions};

/// Terminal (or, for `Repeat`, per-attempt) outcome of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Feedback satisfied (retry threshold reached).
    Ok,
    /// One retry attempt fell short; the measurement is being reissued.
    Repeat,
    /// Failed: attempts exhausted or a fatal control error.
    Fail,
    /// Ran to completion without a feedback verdict (settle-only step or
    /// finished sweep).
    Complete,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::Repeat => "Repeat",
            Self::Fail => "Fail",
            Self::Complete => "Complete",
        }
    }
}

/// What the caller does next: wait out the continuation delay and `fire`,
/// or accept the terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending { delay_ms: u64 },
    Done(StepOutcome),
}

/// The single outstanding continuation kind.
#[derive(Debug, Clone, Copy)]
enum Continuation {
    /// Fixed-duration settle for a feedback-disabled step.
    Settle,
    /// A retry-action measurement is outstanding.
    CollectRetry,
    /// A sweep-point measurement is outstanding.
    CollectSweep,
}

/// Callback invoked with every completed measurement (validation included),
/// carrying enough data for a UI to render voltage/force/impedance.
pub type UpdateHook = Box<dyn FnMut(&FeedbackResult) + Send>;

pub struct StepRunner<T: Transport> {
    board: T,
    calibration: Calibration,
    sampling: SamplingCfg,
    clock: Arc<dyn Clock + Send + Sync>,
    voltage_ctl: VoltageController,
    on_update: Option<UpdateHook>,

    // per-step state
    options: StepOptions,
    channel_state: Vec<u8>,
    area_mm2: f64,
    /// Step voltage after force normalization.
    base_voltage: f64,
    /// Voltage/frequency commanded for the outstanding measurement.
    current_voltage: f64,
    current_frequency: f64,
    action_state: Option<ActionState>,
    pending: Option<Continuation>,
    current_request: Option<MeasurementRequest>,
    measurement_in_flight: bool,
    outcome: Option<StepOutcome>,
    outcome_log: Vec<StepOutcome>,
    last_error: Option<FeedbackError>,
    series: Option<FeedbackResultsSeries>,
}

impl<T: Transport> core::fmt::Debug for StepRunner<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StepRunner")
            .field("pending", &self.pending)
            .field("outcome", &self.outcome)
            .field("measurement_in_flight", &self.measurement_in_flight)
            .finish()
    }
}

impl<T: Transport> StepRunner<T> {
    pub fn builder() -> StepRunnerBuilder<T> {
        StepRunnerBuilder::default()
    }

    /// Begin a step. Cancels any continuation left over from a previous
    /// step before touching shared state.
    pub fn start_step(
        &mut self,
        options: StepOptions,
        channel_state: Vec<u8>,
        area_mm2: f64,
    ) -> Result<StepStatus> {
        self.cancel();
        self.outcome = None;
        self.outcome_log.clear();
        self.last_error = None;
        self.series = None;
        self.action_state = None;

        let mut state = channel_state;
        state.resize(self.board.channel_count(), 0);

        // force normalization: derive voltage from target force when the
        // drop capacitance has been calibrated
        let mut voltage = options.voltage;
        if let Some(force) = options.force {
            match self.calibration.force_to_voltage(force, options.frequency) {
                Ok(v) => {
                    let v = v.min(self.calibration.max_waveform_voltage);
                    tracing::debug!(force, voltage = v, "force-normalized step voltage");
                    voltage = v;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "force normalization unavailable; using direct voltage");
                }
            }
        }

        self.options = options;
        self.channel_state = state;
        self.area_mm2 = area_mm2;
        self.base_voltage = voltage;
        self.current_voltage = voltage;
        self.current_frequency = self.options.frequency;

        if !self.options.feedback.feedback_enabled {
            // no validation or deciding: waveform + electrodes, one settle wait
            if let Err(e) = self.apply_waveform(voltage, self.options.frequency) {
                return Ok(self.fail_step(e));
            }
            self.voltage_ctl.note_frequency(self.options.frequency);
            self.pending = Some(Continuation::Settle);
            return Ok(StepStatus::Pending {
                delay_ms: u64::from(self.options.duration_ms),
            });
        }

        if self.area_mm2 <= 0.0 {
            return Ok(self.fail_step(FeedbackError::DeviceScaleNotSet));
        }

        let mut action_state = ActionState::new(&self.options.feedback.action);
        let first_target = action_state.first_target();
        let sweep_axis = action_state.axis();
        self.action_state = Some(action_state);

        // a sweep with nothing to iterate (empty channel set) completes with
        // an empty series, without touching the board
        if let (None, Some(axis)) = (first_target, sweep_axis) {
            self.series = Some(FeedbackResultsSeries::new(axis));
            return Ok(self.complete_step(StepOutcome::Complete));
        }

        if let Err(e) = self.ensure_validated(voltage, self.options.frequency) {
            return Ok(self.fail_step(e));
        }

        let issued = match first_target {
            // retry action measures at the step's own operating point
            None => self.issue_measurement(Continuation::CollectRetry, voltage),
            Some((axis, value)) => self.issue_sweep_point(axis, value),
        };
        match issued {
            Ok(status) => Ok(status),
            Err(e) => Ok(self.fail_step(e)),
        }
    }

    /// Run the continuation scheduled by the previous `start_step`/`fire`.
    /// Calling without an outstanding continuation is a programming error.
    pub fn fire(&mut self) -> Result<StepStatus> {
        let cont = self.pending.take().ok_or_else(|| {
            Report::new(FeedbackError::State("no continuation pending".into()))
        })?;

        match cont {
            Continuation::Settle => Ok(self.complete_step(StepOutcome::Complete)),
            Continuation::CollectRetry | Continuation::CollectSweep => {
                let raw = match self.board.take_measurement() {
                    Ok(raw) => raw,
                    Err(e) => {
                        return Ok(self.fail_step(FeedbackError::Transport(e.to_string())));
                    }
                };
                self.measurement_in_flight = false;
                let Some(req) = self.current_request.take() else {
                    return Ok(self.fail_step(FeedbackError::State(
                        "measurement completed without a request".into(),
                    )));
                };
                let result = FeedbackResult::from_windows(
                    &raw,
                    &req,
                    self.current_voltage,
                    self.current_frequency,
                    self.area_mm2,
                    self.calibration.clone(),
                );
                self.notify_update(&result);

                // a sub-tolerance actuation voltage is a distinguished
                // failure, never a data point: short-circuit the action
                let settled = result.settled_actuation_voltage();
                if !settled.is_finite() || settled < self.calibration.voltage_tolerance {
                    return Ok(self.fail_step(FeedbackError::LowVoltage {
                        measured: settled,
                        requested: self.current_voltage,
                    }));
                }

                let decision = match self.action_state.as_mut() {
                    Some(st) => st.decide(result, &self.calibration),
                    None => {
                        return Ok(self.fail_step(FeedbackError::State(
                            "measurement completed without an action".into(),
                        )));
                    }
                };

                let issued = match decision {
                    Decision::Ok => return Ok(self.complete_step(StepOutcome::Ok)),
                    Decision::Fail => return Ok(self.complete_step(StepOutcome::Fail)),
                    Decision::SeriesComplete(series) => {
                        self.series = Some(series);
                        return Ok(self.complete_step(StepOutcome::Complete));
                    }
                    Decision::Repeat { attempt } => {
                        self.outcome_log.push(StepOutcome::Repeat);
                        let voltage = self.retry_voltage(attempt);
                        self.issue_measurement(Continuation::CollectRetry, voltage)
                    }
                    Decision::Next { axis, value } => self.issue_sweep_point(axis, value),
                };
                match issued {
                    Ok(status) => Ok(status),
                    Err(e) => Ok(self.fail_step(e)),
                }
            }
        }
    }

    /// Drop the outstanding continuation, if any, and drain an abandoned
    /// measurement so a stale callback can never drive the electrodes.
    pub fn cancel(&mut self) {
        if self.pending.take().is_some() {
            tracing::debug!("cancelled pending step continuation");
        }
        if self.measurement_in_flight {
            let _ = self.board.take_measurement();
            self.measurement_in_flight = false;
        }
        self.current_request = None;
    }

    /// Re-assert the external power-stage watchdog. Skipped while a
    /// measurement command is in flight to avoid interleaving with an
    /// outstanding request/response pair.
    pub fn service_watchdog(&mut self) -> Result<()> {
        if self.measurement_in_flight {
            tracing::trace!("measurement in flight; skipping watchdog assertion");
            return Ok(());
        }
        self.board
            .assert_watchdog()
            .map_err(|e| Report::new(FeedbackError::Transport(e.to_string())))
    }

    /// Replace the calibration and push the resistor/capacitor banks to the
    /// board; host-side edits have no effect until this synchronization.
    pub fn set_calibration(&mut self, calibration: Calibration) -> Result<()> {
        self.board
            .sync_calibration(
                &calibration.r_hv,
                &calibration.c_hv,
                &calibration.r_fb,
                &calibration.c_fb,
            )
            .map_err(|e| Report::new(FeedbackError::Transport(e.to_string())))?;
        self.calibration = calibration;
        Ok(())
    }

    /// Forget connection-scoped control state after a reconnect; the next
    /// step re-initializes the amplifier gain.
    pub fn reset_connection_state(&mut self) {
        self.voltage_ctl.reset();
    }

    /// Measure a medium's specific capacitance (F/mm²) over a frequency
    /// sweep on the given actuated electrodes, for `c_drop`/`c_filler`
    /// calibration. Blocking; restores the step's operating frequency.
    pub fn measure_capacitance(
        &mut self,
        options: &StepOptions,
        channel_state: &[u8],
        area_mm2: f64,
        sweep: &SweepFrequencyAction,
    ) -> Result<Vec<(f64, f64)>> {
        if area_mm2 <= 0.0 {
            return Err(Report::new(FeedbackError::DeviceScaleNotSet));
        }
        let transport = |e: dmf_traits::BoxError| FeedbackError::Transport(e.to_string());

        let mut state = channel_state.to_vec();
        state.resize(self.board.channel_count(), 0);
        self.board
            .set_waveform_voltage(options.voltage)
            .map_err(transport)?;

        // a handful of windows per point is enough for the gain to settle
        let duration_ms = 5 * self.sampling.sampling_window_ms;
        let n = windows::windows_for_duration(
            duration_ms,
            self.sampling.sampling_window_ms,
            self.sampling.delay_between_windows_ms,
        );
        let plan = windows::plan(
            self.sampling.sampling_window_ms,
            n,
            self.sampling.delay_between_windows_ms,
            self.board.command_buffer_size(),
        );
        let req = MeasurementRequest {
            sampling_window_ms: self.sampling.sampling_window_ms,
            n_sampling_windows: plan.n_sampling_windows,
            delay_between_windows_ms: plan.delay_between_windows_ms,
            interleave_samples: self.sampling.interleave_samples,
            use_rms: self.sampling.use_rms,
            channel_state: state,
        };

        let mut points = Vec::new();
        for frequency in sweep.frequencies() {
            self.board
                .set_waveform_frequency(frequency)
                .map_err(transport)?;
            self.voltage_ctl.note_frequency(frequency);
            let raw = self.board.measure(&req).map_err(transport)?;
            let result = FeedbackResult::from_windows(
                &raw,
                &req,
                options.voltage,
                frequency,
                area_mm2,
                self.calibration.clone(),
            );
            let c = nan_mean(&result.normalized_capacitance(None));
            tracing::info!(frequency, capacitance_per_mm2 = c, "capacitance point");
            if c.is_finite() {
                points.push((frequency, c));
            }
        }

        self.board
            .set_waveform_frequency(options.frequency)
            .map_err(transport)?;
        self.voltage_ctl.note_frequency(options.frequency);
        Ok(points)
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn clock(&self) -> Arc<dyn Clock + Send + Sync> {
        self.clock.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Terminal outcome of the last step, once done.
    pub fn outcome(&self) -> Option<StepOutcome> {
        self.outcome
    }

    /// Every outcome the step reported, one `Repeat` per reissued attempt,
    /// ending with the terminal outcome.
    pub fn outcome_log(&self) -> &[StepOutcome] {
        &self.outcome_log
    }

    /// The typed error that failed the last step, if any.
    pub fn last_error(&self) -> Option<&FeedbackError> {
        self.last_error.as_ref()
    }

    /// The accumulated sweep series of the last completed sweep step.
    pub fn take_series(&mut self) -> Option<FeedbackResultsSeries> {
        self.series.take()
    }

    pub fn gain_initialized(&self) -> bool {
        self.voltage_ctl.gain_initialized()
    }

    fn notify_update(&mut self, result: &FeedbackResult) {
        if let Some(hook) = self.on_update.as_mut() {
            hook(result);
        }
    }

    fn apply_waveform(&mut self, voltage: f64, frequency: f64) -> std::result::Result<(), FeedbackError> {
        let transport = |e: dmf_traits::BoxError| FeedbackError::Transport(e.to_string());
        self.board.set_waveform_frequency(frequency).map_err(transport)?;
        self.board.set_waveform_voltage(voltage).map_err(transport)?;
        self.board
            .set_channel_state(&self.channel_state)
            .map_err(transport)
    }

    fn ensure_validated(&mut self, voltage: f64, frequency: f64) -> std::result::Result<(), FeedbackError> {
        if !self.voltage_ctl.needs_validation(frequency, &self.calibration) {
            return Ok(());
        }
        let result = self.voltage_ctl.validate(
            &mut self.board,
            &self.calibration,
            &self.sampling,
            voltage,
            frequency,
        )?;
        self.notify_update(&result);
        Ok(())
    }

    /// Size, start and schedule one non-blocking measurement.
    fn issue_measurement(
        &mut self,
        cont: Continuation,
        voltage: f64,
    ) -> std::result::Result<StepStatus, FeedbackError> {
        let transport = |e: dmf_traits::BoxError| FeedbackError::Transport(e.to_string());
        self.board.set_waveform_voltage(voltage).map_err(transport)?;

        let requested = windows::windows_for_duration(
            self.options.duration_ms,
            self.sampling.sampling_window_ms,
            self.sampling.delay_between_windows_ms,
        );
        let plan = windows::plan(
            self.sampling.sampling_window_ms,
            requested,
            self.sampling.delay_between_windows_ms,
            self.board.command_buffer_size(),
        );
        let req = MeasurementRequest {
            sampling_window_ms: self.sampling.sampling_window_ms,
            n_sampling_windows: plan.n_sampling_windows,
            delay_between_windows_ms: plan.delay_between_windows_ms,
            interleave_samples: self.sampling.interleave_samples,
            use_rms: self.sampling.use_rms,
            channel_state: self.channel_state.clone(),
        };
        self.board.start_measurement(&req).map_err(transport)?;

        let delay_ms = (u64::from(self.sampling.sampling_window_ms)
            + u64::from(plan.delay_between_windows_ms))
            * u64::from(plan.n_sampling_windows);
        self.measurement_in_flight = true;
        self.current_voltage = voltage;
        self.current_request = Some(req);
        self.pending = Some(cont);
        Ok(StepStatus::Pending { delay_ms })
    }

    /// Apply one swept value and measure there.
    fn issue_sweep_point(
        &mut self,
        axis: SweepAxis,
        value: f64,
    ) -> std::result::Result<StepStatus, FeedbackError> {
        let transport = |e: dmf_traits::BoxError| FeedbackError::Transport(e.to_string());
        let voltage = match axis {
            SweepAxis::Frequency => {
                self.board.set_waveform_frequency(value).map_err(transport)?;
                self.voltage_ctl.note_frequency(value);
                self.current_frequency = value;
                self.base_voltage
            }
            SweepAxis::Voltage => value,
            SweepAxis::Channel => {
                let mut state = vec![0u8; self.channel_state.len()];
                match state.get_mut(value as usize) {
                    Some(slot) => *slot = 1,
                    None => tracing::warn!(channel = value, "swept channel out of range"),
                }
                self.channel_state = state;
                self.base_voltage
            }
        };
        self.issue_measurement(Continuation::CollectSweep, voltage)
    }

    /// Target voltage for a (1-based) retry attempt: force increments under
    /// force normalization, voltage increments otherwise, clamped to the
    /// board's waveform limit.
    fn retry_voltage(&self, attempt: u32) -> f64 {
        let Some(cfg) = self.action_state.as_ref().and_then(ActionState::retry_cfg) else {
            return self.base_voltage;
        };
        let n = f64::from(attempt);
        if let Some(force) = self.options.force
            && cfg.increase_force != 0.0
        {
            match self
                .calibration
                .force_to_voltage(force + cfg.increase_force * n, self.options.frequency)
            {
                Ok(v) => return v.min(self.calibration.max_waveform_voltage),
                Err(e) => {
                    tracing::warn!(error = %e, "force increase unavailable; using voltage increase");
                }
            }
        }
        (self.base_voltage + cfg.increase_voltage * n).min(self.calibration.max_waveform_voltage)
    }

    fn complete_step(&mut self, outcome: StepOutcome) -> StepStatus {
        self.pending = None;
        self.outcome = Some(outcome);
        self.outcome_log.push(outcome);
        tracing::info!(outcome = outcome.as_str(), "step complete");
        StepStatus::Done(outcome)
    }

    /// Record a fatal step error, de-energize the electrodes and finish the
    /// step as `Fail`. The error always reaches the log at error level.
    fn fail_step(&mut self, err: FeedbackError) -> StepStatus {
        tracing::error!(error = %err, "step failed");
        let off = vec![0u8; self.channel_state.len()];
        if let Err(e) = self.board.set_channel_state(&off) {
            tracing::warn!(error = %e, "failed to de-energize electrodes");
        }
        self.measurement_in_flight = false;
        self.current_request = None;
        self.last_error = Some(err);
        self.complete_step(StepOutcome::Fail)
    }
}

/// Builder for `StepRunner`. All fields are validated on `build()`.
pub struct StepRunnerBuilder<T> {
    board: Option<T>,
    calibration: Option<Calibration>,
    sampling: Option<SamplingCfg>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    on_update: Option<UpdateHook>,
}

impl<T> Default for StepRunnerBuilder<T> {
    fn default() -> Self {
        Self {
            board: None,
            calibration: None,
            sampling: None,
            clock: None,
            on_update: None,
        }
    }
}

impl<T: Transport> StepRunnerBuilder<T> {
    pub fn with_board(mut self, board: T) -> Self {
        self.board = Some(board);
        self
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = Some(calibration);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingCfg) -> Self {
        self.sampling = Some(sampling);
        self
    }

    /// Provide a custom clock; defaults to `MonotonicClock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Callback for every completed measurement.
    pub fn with_update_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&FeedbackResult) + Send + 'static,
    {
        self.on_update = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<StepRunner<T>> {
        let board = self
            .board
            .ok_or_else(|| Report::new(BuildError::MissingTransport))?;
        let calibration = self.calibration.unwrap_or_default();
        let sampling = self.sampling.unwrap_or_default();
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        if sampling.sampling_window_ms == 0 {
            return Err(Report::new(BuildError::InvalidConfig(
                "sampling_window_ms must be >= 1",
            )));
        }
        if calibration.r_hv.is_empty() || calibration.r_fb.is_empty() {
            return Err(Report::new(BuildError::InvalidConfig(
                "calibration resistor banks must be non-empty",
            )));
        }
        if calibration.r_hv.len() != calibration.c_hv.len()
            || calibration.r_fb.len() != calibration.c_fb.len()
        {
            return Err(Report::new(BuildError::InvalidConfig(
                "calibration resistor/capacitor banks must be equal length",
            )));
        }
        if !calibration.voltage_tolerance.is_finite() || calibration.voltage_tolerance < 0.0 {
            return Err(Report::new(BuildError::InvalidConfig(
                "voltage_tolerance must be finite and >= 0",
            )));
        }

        Ok(StepRunner {
            board,
            calibration,
            sampling,
            clock,
            voltage_ctl: VoltageController::new(),
            on_update: self.on_update,
            options: StepOptions::default(),
            channel_state: Vec::new(),
            area_mm2: 0.0,
            base_voltage: 0.0,
            current_voltage: 0.0,
            current_frequency: 0.0,
            action_state: None,
            pending: None,
            current_request: None,
            measurement_in_flight: false,
            outcome: None,
            outcome_log: Vec::new(),
            last_error: None,
            series: None,
        })
    }
}

/// Run a step to its terminal outcome, sleeping out each scheduled
/// continuation on the runner's clock.
pub fn run_step<T: Transport>(
    runner: &mut StepRunner<T>,
    options: StepOptions,
    channel_state: Vec<u8>,
    area_mm2: f64,
) -> Result<StepOutcome> {
    let clock = runner.clock();
    let mut status = runner.start_step(options, channel_state, area_mm2)?;
    loop {
        match status {
            StepStatus::Pending { delay_ms } => {
                clock.sleep(Duration::from_millis(delay_ms));
                status = runner.fire()?;
            }
            StepStatus::Done(outcome) => return Ok(outcome),
        }
    }
}
