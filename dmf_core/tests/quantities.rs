use dmf_core::calibration::{Calibration, CapacitanceCurve};
use dmf_core::error::FeedbackError;
use dmf_core::results::FeedbackResult;
use dmf_traits::{MeasurementRequest, RawWindow};
use std::f64::consts::PI;

fn request(n: u32) -> MeasurementRequest {
    MeasurementRequest {
        sampling_window_ms: 10,
        n_sampling_windows: n,
        delay_between_windows_ms: 0,
        interleave_samples: true,
        use_rms: true,
        channel_state: vec![1, 0, 0, 0],
    }
}

fn result_from(windows: Vec<RawWindow>, cal: Calibration) -> FeedbackResult {
    let req = request(windows.len() as u32);
    FeedbackResult::from_windows(&windows, &req, 100.0, 1e3, 1.0, cal)
}

fn window(v_hv: f64, v_fb: f64, bank: i8) -> RawWindow {
    RawWindow {
        v_hv,
        v_fb,
        hv_resistor: if bank < 0 { -1 } else { 0 },
        fb_resistor: bank,
    }
}

#[test]
fn impedance_scales_linearly_with_known_resistor() {
    let cal = Calibration::default(); // r_fb = [1e3, 1e4, ...]
    let r = result_from(vec![window(10.0, 1.0, 0), window(10.0, 1.0, 1)], cal);
    let z = r.impedance(None);
    // |Z| = V_fb / V_hv * R_known
    assert!((z[0] - 100.0).abs() < 1e-9);
    // ten times the resistor, ten times the impedance
    assert!((z[1] - 1000.0).abs() < 1e-9);
}

#[test]
fn impedance_is_deterministic() {
    let cal = Calibration::default();
    let r = result_from(vec![window(7.5, 0.4, 1); 8], cal);
    assert_eq!(r.impedance(None), r.impedance(None));
}

#[test]
fn capacitance_round_trips_impedance() {
    let cal = Calibration::default();
    let r = result_from(
        vec![window(10.0, 1.0, 0), window(5.0, 2.0, 1), window(8.0, 0.1, 2)],
        cal,
    );
    let z = r.impedance(None);
    let c = r.capacitance(None);
    for (zi, ci) in z.iter().zip(&c) {
        // C = 1 / (2π f |Z|) exactly
        assert!((ci * 2.0 * PI * 1e3 * zi - 1.0).abs() < 1e-12);
    }
}

#[test]
fn invalid_resistor_banks_become_nan_and_keep_alignment() {
    let cal = Calibration::default();
    let r = result_from(
        vec![window(10.0, 1.0, 0), window(10.0, 1.0, -1), window(10.0, 1.0, 0)],
        cal,
    );
    let z = r.impedance(None);
    assert_eq!(z.len(), 3);
    assert!(z[0].is_finite());
    assert!(z[1].is_nan());
    assert!(z[2].is_finite());
    let c = r.capacitance(None);
    assert_eq!(c.len(), 3);
    assert!(c[1].is_nan());
}

#[test]
fn zero_denominator_yields_nan_not_panic() {
    let cal = Calibration::default();
    let r = result_from(vec![window(0.0, 1.0, 0)], cal);
    assert!(r.impedance(None)[0].is_nan());
}

#[test]
fn out_of_range_bank_index_is_invalid() {
    let cal = Calibration::default();
    let r = result_from(vec![window(10.0, 1.0, 99)], cal);
    assert!(r.impedance(None)[0].is_nan());
}

#[test]
fn actuation_voltage_respects_rms_flag() {
    let cal = Calibration::default();
    let windows = vec![window(100.0, 1.0, 0); 3];
    let req_rms = request(3);
    let rms = FeedbackResult::from_windows(&windows, &req_rms, 100.0, 1e3, 1.0, cal.clone());
    assert!((rms.settled_actuation_voltage() - 100.0).abs() < 1e-9);

    let mut req_peak = request(3);
    req_peak.use_rms = false;
    let peak = FeedbackResult::from_windows(&windows, &req_peak, 100.0, 1e3, 1.0, cal);
    assert!((peak.settled_actuation_voltage() - 100.0 / 2f64.sqrt()).abs() < 1e-9);
}

#[test]
fn settled_voltage_is_the_last_window() {
    let cal = Calibration::default();
    let r = result_from(
        vec![window(90.0, 1.0, 0), window(95.0, 1.0, 0), window(101.0, 1.0, 0)],
        cal,
    );
    assert!((r.settled_actuation_voltage() - 101.0).abs() < 1e-9);
}

#[test]
fn filtering_preserves_count_and_timestamps_and_raw_series() {
    let cal = Calibration::default();
    let windows: Vec<RawWindow> = (0..30)
        .map(|i| window(10.0, 1.0 + 0.01 * (i as f64 * 0.9).sin(), 0))
        .collect();
    let r = result_from(windows, cal);
    let raw = r.impedance(None);
    let smooth = r.impedance(Some(2));
    assert_eq!(raw.len(), smooth.len());
    assert_eq!(r.time_ms.len(), smooth.len());
    // the raw series is still available unchanged next to the filtered one
    assert_eq!(raw, r.impedance(None));
}

#[test]
fn position_requires_area_and_drop_calibration() {
    let cal = Calibration::default();
    let req = request(2);
    let windows = vec![window(10.0, 1.0, 0); 2];
    let no_area =
        FeedbackResult::from_windows(&windows, &req, 100.0, 1e3, 0.0, cal.clone());
    assert!(matches!(
        no_area.position(None),
        Err(FeedbackError::DeviceScaleNotSet)
    ));

    let with_area = FeedbackResult::from_windows(&windows, &req, 100.0, 1e3, 4.0, cal);
    assert!(matches!(
        with_area.position(None),
        Err(FeedbackError::CalibrationMissing("drop"))
    ));
}

#[test]
fn position_masks_resistor_bank_changes() {
    let mut cal = Calibration::default();
    cal.c_drop = CapacitanceCurve::flat(3e-12);
    let windows = vec![
        window(10.0, 1.0, 0),
        window(10.0, 1.0, 0),
        window(10.0, 1.0, 1), // bank switch: seam
        window(10.0, 1.0, 1),
        window(10.0, 1.0, -1), // invalid
    ];
    let req = request(5);
    let r = FeedbackResult::from_windows(&windows, &req, 100.0, 1e3, 4.0, cal);
    let x = r.position(None).unwrap();
    assert_eq!(x.len(), 5);
    assert!(x[0].is_finite());
    assert!(x[1].is_finite());
    assert!(x[2].is_nan(), "bank-change window must be excluded");
    assert!(x[3].is_finite());
    assert!(x[4].is_nan(), "invalid-bank window must be excluded");
}

#[test]
fn velocity_is_a_midpoint_finite_difference() {
    let mut cal = Calibration::default();
    cal.c_drop = CapacitanceCurve::flat(3e-12);
    let windows = vec![window(10.0, 1.0, 0); 6];
    let req = request(6);
    let r = FeedbackResult::from_windows(&windows, &req, 100.0, 1e3, 4.0, cal);
    let (t, v) = r.velocity(None).unwrap();
    assert_eq!(t.len(), 5);
    assert_eq!(v.len(), 5);
    // constant position: zero velocity everywhere
    for vi in &v {
        assert!(vi.abs() < 1e-12);
    }
    // midpoints of 10ms windows
    assert!((t[0] - 5.0).abs() < 1e-9);
    assert!((t[1] - 15.0).abs() < 1e-9);
}

#[test]
fn normalized_capacitance_divides_by_area() {
    let cal = Calibration::default();
    let req = request(1);
    let windows = vec![window(10.0, 1.0, 0)];
    let r = FeedbackResult::from_windows(&windows, &req, 100.0, 1e3, 4.0, cal);
    let c = r.capacitance(None)[0];
    let n = r.normalized_capacitance(None)[0];
    assert!((n - c / 4.0).abs() < 1e-24);
}
