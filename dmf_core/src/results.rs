//! Measurement results and on-demand physical-quantity derivation.
//!
//! A `FeedbackResult` stores one measurement's raw per-window readings plus
//! the calibration in effect when it was taken. Impedance, capacitance,
//! actuation voltage, position and velocity are computed on demand; nothing
//! derived is stored. All derivations absorb bad denominators and invalid
//! resistor selections as NaN so every series stays aligned with `time_ms`.

use std::f64::consts::{FRAC_1_SQRT_2, PI};
use std::fmt;

use dmf_traits::{MeasurementRequest, RawWindow};

use crate::calibration::Calibration;
use crate::error::FeedbackError;
use crate::filter;
use crate::util::{nan_mean, nan_std};

/// The dimension swept by a results series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAxis {
    Frequency,
    Voltage,
    Channel,
}

impl fmt::Display for SweepAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frequency => f.write_str("Frequency"),
            Self::Voltage => f.write_str("Voltage"),
            Self::Channel => f.write_str("Channel"),
        }
    }
}

/// One measurement's raw per-window samples and acquisition context.
#[derive(Debug, Clone)]
pub struct FeedbackResult {
    /// Window start times (ms from the first window).
    pub time_ms: Vec<f64>,
    /// High-voltage-side amplitude per window (V).
    pub v_hv: Vec<f64>,
    /// Feedback-side amplitude per window (V).
    pub v_fb: Vec<f64>,
    /// High-voltage resistor bank selected per window; -1 = none valid.
    pub hv_resistor: Vec<i8>,
    /// Feedback resistor bank selected per window; -1 = none valid.
    pub fb_resistor: Vec<i8>,
    /// Commanded RMS voltage.
    pub voltage: f64,
    /// Commanded waveform frequency (Hz).
    pub frequency: f64,
    /// Total actuated electrode area (mm²).
    pub area_mm2: f64,
    /// Whether window amplitudes are RMS (peak when false).
    pub use_rms: bool,
    /// Calibration in effect at measurement time.
    pub calibration: Calibration,
}

impl FeedbackResult {
    pub fn from_windows(
        windows: &[RawWindow],
        req: &MeasurementRequest,
        voltage: f64,
        frequency: f64,
        area_mm2: f64,
        calibration: Calibration,
    ) -> Self {
        let period =
            f64::from(req.sampling_window_ms) + f64::from(req.delay_between_windows_ms);
        Self {
            time_ms: (0..windows.len()).map(|i| i as f64 * period).collect(),
            v_hv: windows.iter().map(|w| w.v_hv).collect(),
            v_fb: windows.iter().map(|w| w.v_fb).collect(),
            hv_resistor: windows.iter().map(|w| w.hv_resistor).collect(),
            fb_resistor: windows.iter().map(|w| w.fb_resistor).collect(),
            voltage,
            frequency,
            area_mm2,
            use_rms: req.use_rms,
            calibration,
        }
    }

    pub fn len(&self) -> usize {
        self.time_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ms.is_empty()
    }

    /// Windows usable for motion derivations: both banks valid and unchanged
    /// since the previous window (a bank switch mid-series leaves a seam the
    /// firmware's auto-ranging does not compensate across).
    fn stable_mask(&self) -> Vec<bool> {
        (0..self.len())
            .map(|i| {
                let valid = self.hv_resistor[i] >= 0 && self.fb_resistor[i] >= 0;
                let unchanged = i == 0
                    || (self.hv_resistor[i] == self.hv_resistor[i - 1]
                        && self.fb_resistor[i] == self.fb_resistor[i - 1]);
                valid && unchanged
            })
            .collect()
    }

    /// Device impedance magnitude per window (ohm):
    /// `|Z| = V_fb / V_hv · R_known` with the feedback-bank resistor recorded
    /// for that window. Invalid bank or zero denominator yields NaN.
    pub fn impedance(&self, filter_order: Option<usize>) -> Vec<f64> {
        let raw: Vec<f64> = (0..self.len())
            .map(|i| {
                let Some(r_known) = self.calibration.fb_resistor(self.fb_resistor[i]) else {
                    return f64::NAN;
                };
                if self.hv_resistor[i] < 0 || self.v_hv[i] == 0.0 {
                    return f64::NAN;
                }
                self.v_fb[i] / self.v_hv[i] * r_known
            })
            .collect();
        match filter_order {
            Some(order) => filter::smooth(&raw, order),
            None => raw,
        }
    }

    /// Device capacitance per window (F): `C = 1 / (2π f |Z|)`.
    pub fn capacitance(&self, filter_order: Option<usize>) -> Vec<f64> {
        let raw: Vec<f64> = self
            .impedance(None)
            .into_iter()
            .map(|z| {
                if !z.is_finite() || z <= 0.0 || self.frequency <= 0.0 {
                    f64::NAN
                } else {
                    1.0 / (2.0 * PI * self.frequency * z)
                }
            })
            .collect();
        match filter_order {
            Some(order) => filter::smooth(&raw, order),
            None => raw,
        }
    }

    /// Capacitance per actuated area (F/mm²); NaN when the area is unset.
    pub fn normalized_capacitance(&self, filter_order: Option<usize>) -> Vec<f64> {
        let area = self.area_mm2;
        self.capacitance(filter_order)
            .into_iter()
            .map(|c| if area > 0.0 { c / area } else { f64::NAN })
            .collect()
    }

    /// Actuation voltage per window (V RMS). Peak readings are scaled by
    /// 1/√2. Windows with no valid high-voltage bank yield NaN.
    pub fn actuation_voltage(&self) -> Vec<f64> {
        let scale = if self.use_rms { 1.0 } else { FRAC_1_SQRT_2 };
        (0..self.len())
            .map(|i| {
                if self.hv_resistor[i] < 0 {
                    f64::NAN
                } else {
                    self.v_hv[i] * scale
                }
            })
            .collect()
    }

    /// The settled actuation voltage: the last window's reading, used by the
    /// voltage control loop. NaN when the measurement is empty.
    pub fn settled_actuation_voltage(&self) -> f64 {
        self.actuation_voltage().last().copied().unwrap_or(f64::NAN)
    }

    /// Droplet front position per window (mm), from normalized capacitance:
    /// `x = C / (c_drop(f) · √area)`. Windows outside the stable resistor
    /// selection are NaN.
    pub fn position(&self, filter_order: Option<usize>) -> Result<Vec<f64>, FeedbackError> {
        if self.area_mm2 <= 0.0 {
            return Err(FeedbackError::DeviceScaleNotSet);
        }
        let c_drop = self.calibration.c_drop_at(self.frequency)?;
        let edge_mm = self.area_mm2.sqrt();
        let mask = self.stable_mask();
        let raw: Vec<f64> = self
            .capacitance(None)
            .into_iter()
            .zip(mask)
            .map(|(c, ok)| if ok { c / (c_drop * edge_mm) } else { f64::NAN })
            .collect();
        Ok(match filter_order {
            Some(order) => filter::smooth(&raw, order),
            None => raw,
        })
    }

    /// Droplet velocity (mm/ms) as the midpoint finite difference of
    /// `position()`: returns `(t_mid, dx/dt)`, each of length n-1.
    pub fn velocity(
        &self,
        filter_order: Option<usize>,
    ) -> Result<(Vec<f64>, Vec<f64>), FeedbackError> {
        let x = self.position(filter_order)?;
        let t = &self.time_ms;
        let mut t_mid = Vec::with_capacity(x.len().saturating_sub(1));
        let mut dxdt = Vec::with_capacity(x.len().saturating_sub(1));
        for i in 1..x.len() {
            let dt = t[i] - t[i - 1];
            t_mid.push((t[i] + t[i - 1]) / 2.0);
            dxdt.push(if dt == 0.0 { f64::NAN } else { (x[i] - x[i - 1]) / dt });
        }
        Ok((t_mid, dxdt))
    }
}

/// Ordered (swept value, result) pairs accumulated over one sweep.
/// Append-only while the sweep runs; consumed wholesale when it finishes.
#[derive(Debug, Clone)]
pub struct FeedbackResultsSeries {
    axis: SweepAxis,
    values: Vec<f64>,
    results: Vec<FeedbackResult>,
}

impl FeedbackResultsSeries {
    pub fn new(axis: SweepAxis) -> Self {
        Self {
            axis,
            values: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn axis(&self) -> SweepAxis {
        self.axis
    }

    pub fn push(&mut self, value: f64, result: FeedbackResult) {
        self.values.push(value);
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn results(&self) -> &[FeedbackResult] {
        &self.results
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &FeedbackResult)> {
        self.values.iter().copied().zip(self.results.iter())
    }

    /// Per-entry (mean, std) of capacitance, NaN entries ignored.
    pub fn capacitance_stats(&self) -> Vec<(f64, f64)> {
        self.results
            .iter()
            .map(|r| {
                let c = r.capacitance(None);
                (nan_mean(&c), nan_std(&c))
            })
            .collect()
    }

    /// Per-entry (mean, std) of impedance, NaN entries ignored.
    pub fn impedance_stats(&self) -> Vec<(f64, f64)> {
        self.results
            .iter()
            .map(|r| {
                let z = r.impedance(None);
                (nan_mean(&z), nan_std(&z))
            })
            .collect()
    }

    /// Per-entry mean actuation voltage, NaN entries ignored.
    pub fn mean_actuation_voltage(&self) -> Vec<f64> {
        self.results
            .iter()
            .map(|r| nan_mean(&r.actuation_voltage()))
            .collect()
    }
}
