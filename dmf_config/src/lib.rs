#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and calibration parsing for the DMF feedback engine.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - The capacitance-curve CSV loader enforces headers and strictly
//!   monotonic frequencies before the points are handed to the engine.

use serde::Deserialize;

/// Specific-capacitance curve CSV schema.
///
/// Expected headers:
/// frequency,capacitance
///
/// Example (capacitance in F/mm^2):
/// frequency,capacitance
/// 100,3.1e-12
/// 1000,2.9e-12
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CurveRow {
    /// Waveform frequency in Hz.
    pub frequency: f64,
    /// Specific capacitance in F/mm^2.
    pub capacitance: f64,
}

/// How raw samples are windowed and encoded for one measurement command.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
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

/// Voltage validation and amplifier-gain adjustment knobs.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct FeedbackCfg {
    /// Acceptable |measured - commanded| actuation voltage error (V RMS).
    /// A measured voltage *below* this value is treated as an amplifier
    /// failure and aborts the step.
    pub voltage_tolerance: f64,
    /// Re-assert the target voltage (bounded attempts) when the measured
    /// actuation voltage falls outside tolerance.
    pub auto_adjust_amplifier_gain: bool,
}

impl Default for FeedbackCfg {
    fn default() -> Self {
        Self {
            voltage_tolerance: 5.0,
            auto_adjust_amplifier_gain: true,
        }
    }
}

/// Waveform limits and amplifier gain as stored on the board.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct BoardCfg {
    pub amplifier_gain: f64,
    pub max_waveform_voltage: f64,
    pub min_waveform_frequency: f64,
    pub max_waveform_frequency: f64,
}

impl Default for BoardCfg {
    fn default() -> Self {
        Self {
            amplifier_gain: 100.0,
            max_waveform_voltage: 200.0,
            min_waveform_frequency: 100.0,
            max_waveform_frequency: 20e3,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

/// Series resistor/capacitor banks and optional capacitance curves as
/// persisted in the config file. Mirrors the board-resident calibration;
/// the engine converts this into its runtime form at connect time.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PersistedCalibration {
    /// High-voltage attenuator series resistors (ohm), one per bank.
    pub r_hv: Vec<f64>,
    /// High-voltage attenuator series capacitors (F), one per bank.
    pub c_hv: Vec<f64>,
    /// Feedback series resistors (ohm), one per bank.
    pub r_fb: Vec<f64>,
    /// Feedback series capacitors (F), one per bank.
    pub c_fb: Vec<f64>,
    /// Liquid ("drop") specific-capacitance curve, (Hz, F/mm^2) pairs.
    pub c_drop: Vec<(f64, f64)>,
    /// Filler-medium specific-capacitance curve, (Hz, F/mm^2) pairs.
    pub c_filler: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sampling: SamplingCfg,
    pub feedback: FeedbackCfg,
    pub board: BoardCfg,
    pub logging: Logging,
    /// Optional persisted calibration; preferred at runtime over the board's
    /// defaults when present.
    pub calibration: Option<PersistedCalibration>,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Sampling
        if self.sampling.sampling_window_ms == 0 {
            eyre::bail!("sampling.sampling_window_ms must be >= 1");
        }
        if self.sampling.sampling_window_ms > 10_000 {
            eyre::bail!("sampling.sampling_window_ms is unreasonably large (>10s)");
        }

        // Feedback
        if !self.feedback.voltage_tolerance.is_finite() || self.feedback.voltage_tolerance < 0.0 {
            eyre::bail!("feedback.voltage_tolerance must be finite and >= 0");
        }

        // Board
        if !self.board.amplifier_gain.is_finite() || self.board.amplifier_gain <= 0.0 {
            eyre::bail!("board.amplifier_gain must be > 0");
        }
        if self.board.max_waveform_voltage <= 0.0 {
            eyre::bail!("board.max_waveform_voltage must be > 0");
        }
        if self.board.min_waveform_frequency <= 0.0 {
            eyre::bail!("board.min_waveform_frequency must be > 0");
        }
        if self.board.max_waveform_frequency <= self.board.min_waveform_frequency {
            eyre::bail!("board.max_waveform_frequency must exceed min_waveform_frequency");
        }

        // Calibration, when present
        if let Some(cal) = &self.calibration {
            cal.validate()?;
        }

        Ok(())
    }
}

impl PersistedCalibration {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.r_hv.is_empty() || self.r_fb.is_empty() {
            eyre::bail!("calibration resistor banks must be non-empty");
        }
        if self.r_hv.len() != self.c_hv.len() {
            eyre::bail!(
                "calibration r_hv/c_hv length mismatch ({} vs {})",
                self.r_hv.len(),
                self.c_hv.len()
            );
        }
        if self.r_fb.len() != self.c_fb.len() {
            eyre::bail!(
                "calibration r_fb/c_fb length mismatch ({} vs {})",
                self.r_fb.len(),
                self.c_fb.len()
            );
        }
        for (name, bank) in [("r_hv", &self.r_hv), ("r_fb", &self.r_fb)] {
            if bank.iter().any(|r| !r.is_finite() || *r <= 0.0) {
                eyre::bail!("calibration {name} entries must be finite and > 0");
            }
        }
        for (name, bank) in [("c_hv", &self.c_hv), ("c_fb", &self.c_fb)] {
            if bank.iter().any(|c| !c.is_finite() || *c < 0.0) {
                eyre::bail!("calibration {name} entries must be finite and >= 0");
            }
        }
        for (name, curve) in [("c_drop", &self.c_drop), ("c_filler", &self.c_filler)] {
            validate_curve_points(name, curve)?;
        }
        Ok(())
    }
}

fn validate_curve_points(name: &str, points: &[(f64, f64)]) -> eyre::Result<()> {
    for (i, (f, c)) in points.iter().enumerate() {
        if !f.is_finite() || *f <= 0.0 {
            eyre::bail!("{name} point {i}: frequency must be finite and > 0");
        }
        if !c.is_finite() || *c <= 0.0 {
            eyre::bail!("{name} point {i}: capacitance must be finite and > 0");
        }
    }
    for i in 1..points.len() {
        if points[i].0 <= points[i - 1].0 {
            eyre::bail!(
                "{name} frequencies must be strictly increasing (points {} and {})",
                i - 1,
                i
            );
        }
    }
    Ok(())
}

/// Load a specific-capacitance curve from CSV with strict `frequency,capacitance`
/// headers. Rows must have strictly increasing, positive frequencies.
pub fn load_capacitance_csv(path: &std::path::Path) -> eyre::Result<Vec<CurveRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open capacitance CSV {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["frequency", "capacitance"];
    let actual: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "capacitance CSV must have headers 'frequency,capacitance', got: {}",
            actual.join(",")
        );
    }

    let mut rows: Vec<CurveRow> = Vec::new();
    for (idx, rec) in rdr.deserialize::<CurveRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }

    if rows.len() < 2 {
        eyre::bail!("capacitance curve requires at least two rows, got {}", rows.len());
    }
    let points: Vec<(f64, f64)> = rows.iter().map(|r| (r.frequency, r.capacitance)).collect();
    validate_curve_points("curve", &points)?;

    Ok(rows)
}
