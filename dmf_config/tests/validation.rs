use dmf_config::load_toml;
use rstest::rstest;

const GOOD: &str = r#"
[sampling]
sampling_window_ms = 10
delay_between_windows_ms = 0
interleave_samples = true
use_rms = true

[feedback]
voltage_tolerance = 5.0
auto_adjust_amplifier_gain = true

[board]
amplifier_gain = 100.0
max_waveform_voltage = 200.0
min_waveform_frequency = 100.0
max_waveform_frequency = 20000.0

[logging]
level = "info"
"#;

#[test]
fn good_config_parses_and_validates() {
    let cfg = load_toml(GOOD).expect("parse");
    cfg.validate().expect("validate");
    assert_eq!(cfg.sampling.sampling_window_ms, 10);
    assert!(cfg.feedback.auto_adjust_amplifier_gain);
}

#[test]
fn empty_config_uses_defaults() {
    let cfg = load_toml("").expect("parse");
    cfg.validate().expect("validate");
    assert_eq!(cfg.sampling.sampling_window_ms, 10);
    assert_eq!(cfg.feedback.voltage_tolerance, 5.0);
    assert!(cfg.calibration.is_none());
}

#[rstest]
#[case("[sampling]\nsampling_window_ms = 0\n", "sampling_window_ms")]
#[case("[feedback]\nvoltage_tolerance = -1.0\n", "voltage_tolerance")]
#[case("[board]\namplifier_gain = 0.0\n", "amplifier_gain")]
#[case(
    "[board]\nmin_waveform_frequency = 1000.0\nmax_waveform_frequency = 100.0\n",
    "max_waveform_frequency"
)]
fn out_of_range_values_are_rejected(#[case] toml: &str, #[case] needle: &str) {
    let cfg = load_toml(toml).expect("parse");
    let err = cfg.validate().expect_err("should fail validation");
    assert!(
        err.to_string().contains(needle),
        "error {err} does not mention {needle}"
    );
}

#[test]
fn calibration_bank_lengths_must_match() {
    let toml = r#"
[calibration]
r_hv = [10000.0, 100000.0]
c_hv = [4.7e-11]
r_fb = [1000.0]
c_fb = [4.7e-11]
"#;
    let cfg = load_toml(toml).expect("parse");
    let err = cfg.validate().expect_err("length mismatch");
    assert!(err.to_string().contains("r_hv/c_hv"));
}

#[test]
fn calibration_curves_must_be_strictly_increasing() {
    let toml = r#"
[calibration]
r_hv = [10000.0]
c_hv = [4.7e-11]
r_fb = [1000.0]
c_fb = [4.7e-11]
c_drop = [[1000.0, 3e-12], [100.0, 4e-12]]
"#;
    let cfg = load_toml(toml).expect("parse");
    let err = cfg.validate().expect_err("unordered curve");
    assert!(err.to_string().contains("strictly increasing"));
}

#[test]
fn persisted_calibration_round_trips() {
    let toml = r#"
[calibration]
r_hv = [10000.0, 100000.0, 1000000.0]
c_hv = [4.7e-11, 4.7e-11, 4.7e-11]
r_fb = [1000.0, 10000.0, 100000.0, 1000000.0]
c_fb = [4.7e-11, 4.7e-11, 4.7e-11, 4.7e-11]
c_drop = [[100.0, 4e-12], [10000.0, 2.5e-12]]
"#;
    let cfg = load_toml(toml).expect("parse");
    cfg.validate().expect("validate");
    let cal = cfg.calibration.expect("calibration present");
    assert_eq!(cal.r_fb.len(), 4);
    assert_eq!(cal.c_drop.len(), 2);
}
