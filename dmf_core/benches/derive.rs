use criterion::{Criterion, black_box, criterion_group, criterion_main};

use dmf_core::calibration::Calibration;
use dmf_core::filter;
use dmf_core::results::FeedbackResult;
use dmf_traits::{MeasurementRequest, RawWindow};

fn sample_result(n: usize) -> FeedbackResult {
    let windows: Vec<RawWindow> = (0..n)
        .map(|i| RawWindow {
            v_hv: 100.0 + (i as f64 * 0.3).sin(),
            v_fb: 1.0 + 0.05 * (i as f64 * 0.7).cos(),
            hv_resistor: 0,
            fb_resistor: (i % 4) as i8,
        })
        .collect();
    let req = MeasurementRequest {
        sampling_window_ms: 10,
        n_sampling_windows: n as u32,
        delay_between_windows_ms: 0,
        interleave_samples: true,
        use_rms: true,
        channel_state: vec![1, 0, 0, 0],
    };
    FeedbackResult::from_windows(&windows, &req, 100.0, 1e3, 9.0, Calibration::default())
}

fn bench_derivations(c: &mut Criterion) {
    let result = sample_result(5_000);
    c.bench_function("impedance_5k", |b| {
        b.iter(|| black_box(result.impedance(None)))
    });
    c.bench_function("capacitance_5k", |b| {
        b.iter(|| black_box(result.capacitance(None)))
    });

    let series = result.impedance(None);
    c.bench_function("savgol_order2_5k", |b| {
        b.iter(|| black_box(filter::smooth(&series, 2)))
    });
}

criterion_group!(benches, bench_derivations);
criterion_main!(benches);
