use dmf_core::windows::{max_windows, plan};
use proptest::prelude::*;

proptest! {
    #[test]
    fn adjusted_plans_fit_and_never_extend_the_request(
        window_ms in 1u32..200,
        n in 1u32..5_000,
        delay_ms in 0u32..200,
        buffer in 0usize..8_192,
    ) {
        let p = plan(window_ms, n, delay_ms, buffer);
        let n_max = max_windows(buffer);

        // hard resource constraint: an oversized count is never returned
        prop_assert!(p.n_sampling_windows <= n_max);
        prop_assert!(p.n_sampling_windows >= 1);

        let original = u64::from(window_ms + delay_ms) * u64::from(n);
        let adjusted = u64::from(window_ms + p.delay_between_windows_ms)
            * u64::from(p.n_sampling_windows);
        if p.adjusted {
            // total duration is preserved, never exceeded
            prop_assert!(adjusted <= original);
        } else {
            prop_assert_eq!(p.n_sampling_windows, n);
            prop_assert_eq!(p.delay_between_windows_ms, delay_ms);
        }
    }

    #[test]
    fn fitting_requests_are_untouched(
        window_ms in 1u32..200,
        delay_ms in 0u32..200,
        buffer in 16usize..8_192,
    ) {
        let n_max = max_windows(buffer);
        let n = n_max; // exactly at the limit
        let p = plan(window_ms, n, delay_ms, buffer);
        prop_assert!(!p.adjusted);
        prop_assert_eq!(p.n_sampling_windows, n);
    }
}
