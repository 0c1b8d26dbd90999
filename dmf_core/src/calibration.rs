//! Board calibration: series resistor/capacitor banks, waveform limits, and
//! frequency-dependent specific-capacitance curves.

use crate::error::FeedbackError;

/// Scale factor in `force ≈ ½ · c(f) · V² · 1e9` relating line force (µN/mm)
/// to RMS voltage, with specific capacitance in F/mm².
const FORCE_SCALE: f64 = 0.5e9;

/// Frequency-dependent specific capacitance of a medium, in F/mm².
///
/// Points are (Hz, F/mm²), strictly increasing in frequency. Lookups
/// interpolate linearly in log-frequency and flat-extrapolate at both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacitanceCurve {
    points: Vec<(f64, f64)>,
}

impl CapacitanceCurve {
    /// Build a curve from (Hz, F/mm²) points sorted by frequency.
    pub fn new(points: Vec<(f64, f64)>) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let ordered = points.windows(2).all(|w| w[1].0 > w[0].0);
        let finite = points
            .iter()
            .all(|(f, c)| f.is_finite() && *f > 0.0 && c.is_finite() && *c > 0.0);
        if !ordered || !finite {
            return None;
        }
        Some(Self { points })
    }

    /// A frequency-independent curve, as produced by single-point calibration.
    pub fn flat(c: f64) -> Option<Self> {
        Self::new(vec![(1.0, c)])
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Specific capacitance at `hz`.
    pub fn lookup(&self, hz: f64) -> f64 {
        let pts = &self.points;
        if hz <= pts[0].0 {
            return pts[0].1;
        }
        if hz >= pts[pts.len() - 1].0 {
            return pts[pts.len() - 1].1;
        }
        let i = pts.partition_point(|(f, _)| *f < hz);
        let (f0, c0) = pts[i - 1];
        let (f1, c1) = pts[i];
        let t = (hz.log10() - f0.log10()) / (f1.log10() - f0.log10());
        c0 + t * (c1 - c0)
    }
}

/// Host-side copy of the board-resident calibration.
///
/// Resistor/capacitor banks are indexed consistently with the firmware's
/// selectable feedback and high-voltage attenuator banks; the arrays are
/// non-empty and equal-length per side. Edits to bank values reach the
/// hardware only after the orchestrator re-synchronizes with the transport.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub r_hv: Vec<f64>,
    pub c_hv: Vec<f64>,
    pub r_fb: Vec<f64>,
    pub c_fb: Vec<f64>,
    pub amplifier_gain: f64,
    pub auto_adjust_amplifier_gain: bool,
    /// Acceptable |measured - commanded| actuation voltage error (V RMS).
    /// Doubles as the low-voltage floor: a measured voltage below this value
    /// means the amplifier is not delivering.
    pub voltage_tolerance: f64,
    pub max_waveform_voltage: f64,
    pub min_waveform_frequency: f64,
    pub max_waveform_frequency: f64,
    pub c_drop: Option<CapacitanceCurve>,
    pub c_filler: Option<CapacitanceCurve>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            r_hv: vec![10e3, 100e3, 1e6],
            c_hv: vec![47e-12, 47e-12, 47e-12],
            r_fb: vec![1e3, 10e3, 100e3, 1e6],
            c_fb: vec![47e-12, 47e-12, 47e-12, 47e-12],
            amplifier_gain: 100.0,
            auto_adjust_amplifier_gain: true,
            voltage_tolerance: 5.0,
            max_waveform_voltage: 200.0,
            min_waveform_frequency: 100.0,
            max_waveform_frequency: 20e3,
            c_drop: None,
            c_filler: None,
        }
    }
}

impl Calibration {
    /// Merge persisted calibration and board limits into the runtime form.
    pub fn from_config(cfg: &dmf_config::Config) -> Self {
        let mut cal = Self {
            amplifier_gain: cfg.board.amplifier_gain,
            auto_adjust_amplifier_gain: cfg.feedback.auto_adjust_amplifier_gain,
            voltage_tolerance: cfg.feedback.voltage_tolerance,
            max_waveform_voltage: cfg.board.max_waveform_voltage,
            min_waveform_frequency: cfg.board.min_waveform_frequency,
            max_waveform_frequency: cfg.board.max_waveform_frequency,
            ..Self::default()
        };
        if let Some(p) = &cfg.calibration {
            cal.r_hv = p.r_hv.clone();
            cal.c_hv = p.c_hv.clone();
            cal.r_fb = p.r_fb.clone();
            cal.c_fb = p.c_fb.clone();
            cal.c_drop = CapacitanceCurve::new(p.c_drop.clone());
            cal.c_filler = CapacitanceCurve::new(p.c_filler.clone());
        }
        cal
    }

    /// Feedback-bank resistor for a firmware bank index; None when the index
    /// is invalid (-1 or out of range).
    pub fn fb_resistor(&self, index: i8) -> Option<f64> {
        usize::try_from(index).ok().and_then(|i| self.r_fb.get(i)).copied()
    }

    /// High-voltage-bank resistor for a firmware bank index.
    pub fn hv_resistor(&self, index: i8) -> Option<f64> {
        usize::try_from(index).ok().and_then(|i| self.r_hv.get(i)).copied()
    }

    /// Specific capacitance of the liquid at `hz` (F/mm²).
    pub fn c_drop_at(&self, hz: f64) -> Result<f64, FeedbackError> {
        self.c_drop
            .as_ref()
            .map(|c| c.lookup(hz))
            .ok_or(FeedbackError::CalibrationMissing("drop"))
    }

    /// Specific capacitance of the filler medium at `hz` (F/mm²).
    pub fn c_filler_at(&self, hz: f64) -> Result<f64, FeedbackError> {
        self.c_filler
            .as_ref()
            .map(|c| c.lookup(hz))
            .ok_or(FeedbackError::CalibrationMissing("filler"))
    }

    /// RMS voltage required to realize a target line force (µN/mm) at `hz`,
    /// inverting `force ≈ ½ · c_drop(f) · V² · 1e9`.
    pub fn force_to_voltage(&self, force_un_per_mm: f64, hz: f64) -> Result<f64, FeedbackError> {
        let c = self.c_drop_at(hz)?;
        Ok((force_un_per_mm / (FORCE_SCALE * c)).max(0.0).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve() -> CapacitanceCurve {
        CapacitanceCurve::new(vec![(100.0, 4e-12), (1e3, 3e-12), (10e3, 2e-12)]).unwrap()
    }

    #[test]
    fn lookup_flat_extrapolates_at_boundaries() {
        let c = curve();
        assert_eq!(c.lookup(10.0), 4e-12);
        assert_eq!(c.lookup(1e6), 2e-12);
    }

    #[test]
    fn lookup_interpolates_in_log_frequency() {
        let c = curve();
        // sqrt(100 * 1000) is the log midpoint of the first segment
        let mid = c.lookup(316.227_766_016_837_9);
        assert!((mid - 3.5e-12).abs() < 1e-15);
        assert!((c.lookup(1e3) - 3e-12).abs() < 1e-20);
    }

    #[test]
    fn unordered_or_invalid_points_are_rejected() {
        assert!(CapacitanceCurve::new(vec![]).is_none());
        assert!(CapacitanceCurve::new(vec![(1e3, 3e-12), (100.0, 4e-12)]).is_none());
        assert!(CapacitanceCurve::new(vec![(100.0, f64::NAN)]).is_none());
    }

    #[test]
    fn missing_drop_curve_is_a_typed_error() {
        let cal = Calibration::default();
        assert!(matches!(
            cal.c_drop_at(1e3),
            Err(FeedbackError::CalibrationMissing("drop"))
        ));
        assert!(matches!(
            cal.force_to_voltage(10.0, 1e3),
            Err(FeedbackError::CalibrationMissing("drop"))
        ));
    }

    #[test]
    fn force_round_trips_through_voltage() {
        let mut cal = Calibration::default();
        cal.c_drop = CapacitanceCurve::flat(3e-12);
        let v = cal.force_to_voltage(15.0, 1e3).unwrap();
        // force back out of the voltage
        let force = 0.5e9 * 3e-12 * v * v;
        assert!((force - 15.0).abs() < 1e-9);
        // 3 pF/mm² at 100 Vrms is ~15 µN/mm
        assert!((v - 100.0).abs() < 1.0);
    }

    #[test]
    fn bank_lookups_reject_invalid_indices() {
        let cal = Calibration::default();
        assert_eq!(cal.fb_resistor(0), Some(1e3));
        assert_eq!(cal.hv_resistor(2), Some(1e6));
        assert_eq!(cal.fb_resistor(-1), None);
        assert_eq!(cal.fb_resistor(99), None);
    }
}
