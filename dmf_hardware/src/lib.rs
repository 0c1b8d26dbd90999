#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Simulated DMF control board.
//!
//! A deterministic `Transport` implementation backed by an RC load model:
//! actuated electrodes present a capacitance that ramps from the filler
//! value toward the drop value as a simulated droplet arrives. Window
//! amplitudes are generated by inverting the engine's impedance relation,
//! so derived quantities round-trip exactly (plus a small deterministic
//! ripple). Useful for the CLI, integration tests and demos; the real
//! serial transport lives outside this workspace.

pub mod error;

use std::f64::consts::PI;

use dmf_traits::{BoxError, MeasurementRequest, RawWindow, Transport};
use error::HwError;

/// Electrical model of the device load seen by the board.
#[derive(Debug, Clone)]
pub struct LoadModel {
    /// Specific capacitance with the droplet fully covering the actuated
    /// electrodes (F/mm²).
    pub c_drop_per_mm2: f64,
    /// Specific capacitance of the filler medium (F/mm²).
    pub c_filler_per_mm2: f64,
    /// Area of one electrode (mm²).
    pub electrode_area_mm2: f64,
    /// Time for a droplet to fully cover an actuated electrode (ms).
    pub fill_time_ms: f64,
    /// Stray capacitance with nothing actuated (F).
    pub c_stray: f64,
}

impl Default for LoadModel {
    fn default() -> Self {
        Self {
            c_drop_per_mm2: 3e-9,
            c_filler_per_mm2: 0.3e-9,
            electrode_area_mm2: 9.0,
            fill_time_ms: 400.0,
            c_stray: 1e-12,
        }
    }
}

/// Deterministic simulated control board.
pub struct SimulatedControlBoard {
    channels: usize,
    buffer_size: usize,
    load: LoadModel,
    r_fb: Vec<f64>,
    voltage: f64,
    frequency: f64,
    channel_state: Vec<u8>,
    /// Droplet coverage of the actuated electrodes, 0..=1.
    coverage: f64,
    /// When false the amplifier produces almost nothing, for exercising
    /// low-voltage handling.
    amplifier_on: bool,
    pending: Option<Vec<RawWindow>>,
    watchdog_asserts: u64,
}

impl SimulatedControlBoard {
    pub fn new(channels: usize, buffer_size: usize) -> Self {
        Self {
            channels,
            buffer_size,
            load: LoadModel::default(),
            // matches the default host calibration banks
            r_fb: vec![1e3, 10e3, 100e3, 1e6],
            voltage: 0.0,
            frequency: 1e3,
            channel_state: vec![0; channels],
            coverage: 0.0,
            amplifier_on: true,
            pending: None,
            watchdog_asserts: 0,
        }
    }

    pub fn with_load(mut self, load: LoadModel) -> Self {
        self.load = load;
        self
    }

    /// Simulate a dead or disabled amplifier.
    pub fn with_amplifier_off(mut self) -> Self {
        self.amplifier_on = false;
        self
    }

    pub fn watchdog_asserts(&self) -> u64 {
        self.watchdog_asserts
    }

    fn actuated_area(&self) -> f64 {
        let n = self.channel_state.iter().filter(|&&s| s != 0).count();
        n as f64 * self.load.electrode_area_mm2
    }

    /// Device capacitance at the current droplet coverage.
    fn device_capacitance(&self) -> f64 {
        let area = self.actuated_area();
        let c_specific = self.load.c_filler_per_mm2
            + self.coverage * (self.load.c_drop_per_mm2 - self.load.c_filler_per_mm2);
        self.load.c_stray + area * c_specific
    }

    fn render_windows(&mut self, req: &MeasurementRequest) -> Vec<RawWindow> {
        let window_ms = f64::from(req.sampling_window_ms);
        let actuated = req.channel_state.iter().any(|&s| s != 0);
        let n = req.n_sampling_windows as usize;

        let v_hv_base = if self.amplifier_on { self.voltage } else { 1.0 };

        (0..n)
            .map(|i| {
                if actuated && self.load.fill_time_ms > 0.0 {
                    self.coverage = (self.coverage + window_ms / self.load.fill_time_ms).min(1.0);
                }
                let c = self.device_capacitance();
                let z = 1.0 / (2.0 * PI * self.frequency * c);

                // deterministic ripple stands in for measurement noise
                let ripple = 1.0 + 1e-3 * (i as f64 * 0.7).sin();
                let v_hv = v_hv_base * ripple;

                // bank whose feedback amplitude lands nearest half of v_hv
                let (bank, r_fb) = self
                    .r_fb
                    .iter()
                    .copied()
                    .enumerate()
                    .min_by(|a, b| {
                        let da = (z * v_hv / a.1 - v_hv / 2.0).abs();
                        let db = (z * v_hv / b.1 - v_hv / 2.0).abs();
                        da.total_cmp(&db)
                    })
                    .unwrap_or((0, 1e3));
                let v_fb = z * v_hv / r_fb;

                RawWindow {
                    v_hv,
                    v_fb,
                    hv_resistor: 0,
                    fb_resistor: bank as i8,
                }
            })
            .collect()
    }

    fn apply_measure_state(&mut self, req: &MeasurementRequest) {
        let was_actuated = self.channel_state.iter().any(|&s| s != 0);
        let now_actuated = req.channel_state.iter().any(|&s| s != 0);
        if !was_actuated && now_actuated {
            // fresh actuation: droplet starts arriving
            self.coverage = 0.0;
        }
        self.channel_state = req.channel_state.clone();
    }
}

impl Transport for SimulatedControlBoard {
    fn measure(&mut self, req: &MeasurementRequest) -> Result<Vec<RawWindow>, BoxError> {
        self.apply_measure_state(req);
        tracing::debug!(
            windows = req.n_sampling_windows,
            window_ms = req.sampling_window_ms,
            "simulated measurement"
        );
        Ok(self.render_windows(req))
    }

    fn start_measurement(&mut self, req: &MeasurementRequest) -> Result<(), BoxError> {
        if self.pending.is_some() {
            return Err(Box::new(HwError::MeasurementInFlight));
        }
        self.apply_measure_state(req);
        let windows = self.render_windows(req);
        self.pending = Some(windows);
        Ok(())
    }

    fn take_measurement(&mut self) -> Result<Vec<RawWindow>, BoxError> {
        self.pending
            .take()
            .ok_or_else(|| Box::new(HwError::NoMeasurementPending) as BoxError)
    }

    fn set_waveform_voltage(&mut self, vrms: f64) -> Result<(), BoxError> {
        if !vrms.is_finite() || vrms < 0.0 {
            return Err(Box::new(HwError::WaveformOutOfRange(format!(
                "voltage {vrms}"
            ))));
        }
        self.voltage = vrms;
        Ok(())
    }

    fn set_waveform_frequency(&mut self, hz: f64) -> Result<(), BoxError> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(Box::new(HwError::WaveformOutOfRange(format!(
                "frequency {hz}"
            ))));
        }
        self.frequency = hz;
        Ok(())
    }

    fn set_channel_state(&mut self, state: &[u8]) -> Result<(), BoxError> {
        let was_actuated = self.channel_state.iter().any(|&s| s != 0);
        let mut next = state.to_vec();
        next.resize(self.channels, 0);
        let now_actuated = next.iter().any(|&s| s != 0);
        if !was_actuated && now_actuated {
            self.coverage = 0.0;
        }
        self.channel_state = next;
        Ok(())
    }

    fn channel_count(&mut self) -> usize {
        self.channels
    }

    fn command_buffer_size(&mut self) -> usize {
        self.buffer_size
    }

    fn assert_watchdog(&mut self) -> Result<(), BoxError> {
        self.watchdog_asserts += 1;
        Ok(())
    }

    fn sync_calibration(
        &mut self,
        _r_hv: &[f64],
        _c_hv: &[f64],
        r_fb: &[f64],
        _c_fb: &[f64],
    ) -> Result<(), BoxError> {
        self.r_fb = r_fb.to_vec();
        Ok(())
    }
}
