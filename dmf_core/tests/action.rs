use std::collections::BTreeSet;
use std::f64::consts::PI;

use dmf_core::action::{
    ActionState, Decision, FeedbackAction, RetryAction, SweepElectrodesAction,
    SweepFrequencyAction, SweepVoltageAction,
};
use dmf_core::calibration::{Calibration, CapacitanceCurve};
use dmf_core::results::{FeedbackResult, SweepAxis};
use dmf_traits::{MeasurementRequest, RawWindow};

const C_DROP: f64 = 3e-12;

fn calibration() -> Calibration {
    let mut cal = Calibration::default();
    cal.c_drop = CapacitanceCurve::flat(C_DROP);
    cal
}

/// A one-window result whose normalized capacitance is `fraction` of the
/// calibrated drop capacitance (area 1 mm², 1 kHz, bank 0).
fn result_with_capacitance(fraction: f64, cal: &Calibration) -> FeedbackResult {
    let frequency = 1e3;
    let v_hv = 100.0;
    let r_known = cal.r_fb[0];
    let c = fraction * C_DROP;
    let z = 1.0 / (2.0 * PI * frequency * c);
    let v_fb = z * v_hv / r_known;
    let req = MeasurementRequest {
        sampling_window_ms: 10,
        n_sampling_windows: 1,
        delay_between_windows_ms: 0,
        interleave_samples: true,
        use_rms: true,
        channel_state: vec![1],
    };
    let windows = vec![RawWindow {
        v_hv,
        v_fb,
        hv_resistor: 0,
        fb_resistor: 0,
    }];
    FeedbackResult::from_windows(&windows, &req, v_hv, frequency, 1.0, cal.clone())
}

fn retry_action() -> FeedbackAction {
    FeedbackAction::Retry(RetryAction {
        percent_threshold: 80.0,
        increase_voltage: 5.0,
        increase_force: 0.0,
        max_repeats: 3,
    })
}

#[test]
fn retry_repeats_until_threshold_crossed() {
    let cal = calibration();
    let mut state = ActionState::new(&retry_action());

    // readings at 60/70/75/90 % of the drop capacitance vs an 80 % threshold
    for fraction in [0.60, 0.70, 0.75] {
        match state.decide(result_with_capacitance(fraction, &cal), &cal) {
            Decision::Repeat { .. } => {}
            other => panic!("expected Repeat at {fraction}, got {other:?}"),
        }
    }
    match state.decide(result_with_capacitance(0.90, &cal), &cal) {
        Decision::Ok => {}
        other => panic!("expected Ok, got {other:?}"),
    }
}

#[test]
fn retry_fails_after_max_repeats_plus_one_attempts() {
    let cal = calibration();
    let mut state = ActionState::new(&retry_action());

    let mut decisions = Vec::new();
    for _ in 0..4 {
        decisions.push(state.decide(result_with_capacitance(0.10, &cal), &cal));
    }
    assert!(matches!(decisions[0], Decision::Repeat { attempt: 1 }));
    assert!(matches!(decisions[1], Decision::Repeat { attempt: 2 }));
    assert!(matches!(decisions[2], Decision::Repeat { attempt: 3 }));
    // max_repeats = 3: the 4th measurement attempt fails
    assert!(matches!(decisions[3], Decision::Fail));
}

#[test]
fn retry_without_drop_calibration_passes() {
    let cal = Calibration::default(); // no c_drop curve
    let mut state = ActionState::new(&retry_action());
    match state.decide(result_with_capacitance(0.01, &calibration()), &cal) {
        Decision::Ok => {}
        other => panic!("expected Ok without calibration, got {other:?}"),
    }
}

#[test]
fn frequency_sweep_produces_exact_log_spaced_sequence() {
    let action = SweepFrequencyAction {
        start_frequency: 100.0,
        end_frequency: 10e3,
        n_frequency_steps: 5,
    };
    let f = action.frequencies();
    assert_eq!(f.len(), 5);
    assert_eq!(f[0], 100.0);
    assert_eq!(f[4], 10e3);
    // constant ratio between consecutive points
    let ratio = f[1] / f[0];
    for w in f.windows(2) {
        assert!((w[1] / w[0] - ratio).abs() < 1e-9);
    }
}

#[test]
fn voltage_sweep_is_linear_inclusive() {
    let action = SweepVoltageAction {
        start_voltage: 5.0,
        end_voltage: 100.0,
        n_voltage_steps: 20,
    };
    let v = action.voltages();
    assert_eq!(v.len(), 20);
    assert_eq!(v[0], 5.0);
    assert_eq!(v[19], 100.0);
    for w in v.windows(2) {
        assert!(w[1] > w[0], "not monotonically increasing");
    }
    let step = v[1] - v[0];
    for w in v.windows(2) {
        assert!((w[1] - w[0] - step).abs() < 1e-9);
    }
}

#[test]
fn empty_sweep_range_degenerates_to_single_measurement() {
    let action = FeedbackAction::SweepVoltage(SweepVoltageAction {
        start_voltage: 50.0,
        end_voltage: 50.0,
        n_voltage_steps: 20,
    });
    let cal = calibration();
    let mut state = ActionState::new(&action);
    let (axis, value) = state.first_target().unwrap();
    assert_eq!(axis, SweepAxis::Voltage);
    assert_eq!(value, 50.0);
    match state.decide(result_with_capacitance(0.5, &cal), &cal) {
        Decision::SeriesComplete(series) => assert_eq!(series.len(), 1),
        other => panic!("expected SeriesComplete, got {other:?}"),
    }
}

#[test]
fn sweep_accumulates_series_keyed_by_issued_value() {
    let action = FeedbackAction::SweepVoltage(SweepVoltageAction {
        start_voltage: 10.0,
        end_voltage: 30.0,
        n_voltage_steps: 3,
    });
    let cal = calibration();
    let mut state = ActionState::new(&action);
    let (_, first) = state.first_target().unwrap();
    assert_eq!(first, 10.0);

    match state.decide(result_with_capacitance(0.5, &cal), &cal) {
        Decision::Next { axis, value } => {
            assert_eq!(axis, SweepAxis::Voltage);
            assert_eq!(value, 20.0);
        }
        other => panic!("unexpected {other:?}"),
    }
    match state.decide(result_with_capacitance(0.6, &cal), &cal) {
        Decision::Next { value, .. } => assert_eq!(value, 30.0),
        other => panic!("unexpected {other:?}"),
    }
    match state.decide(result_with_capacitance(0.7, &cal), &cal) {
        Decision::SeriesComplete(series) => {
            assert_eq!(series.len(), 3);
            assert_eq!(series.values(), &[10.0, 20.0, 30.0]);
            let stats = series.capacitance_stats();
            assert!(stats.iter().all(|(mean, _)| mean.is_finite()));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn electrode_sweep_iterates_the_channel_set_in_order() {
    let channels: BTreeSet<usize> = [7, 2, 11].into_iter().collect();
    let action = FeedbackAction::SweepElectrodes(SweepElectrodesAction { channels });
    let cal = calibration();
    let mut state = ActionState::new(&action);
    let (axis, first) = state.first_target().unwrap();
    assert_eq!(axis, SweepAxis::Channel);
    assert_eq!(first, 2.0);
    match state.decide(result_with_capacitance(0.5, &cal), &cal) {
        Decision::Next { value, .. } => assert_eq!(value, 7.0),
        other => panic!("unexpected {other:?}"),
    }
    match state.decide(result_with_capacitance(0.5, &cal), &cal) {
        Decision::Next { value, .. } => assert_eq!(value, 11.0),
        other => panic!("unexpected {other:?}"),
    }
    match state.decide(result_with_capacitance(0.5, &cal), &cal) {
        Decision::SeriesComplete(series) => assert_eq!(series.values(), &[2.0, 7.0, 11.0]),
        other => panic!("unexpected {other:?}"),
    }
}
