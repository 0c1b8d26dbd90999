//! Buffer-aware sizing of sampling-window batches.
//!
//! One measurement command must fit the transport's fixed payload budget.
//! Each window costs a channel-selector byte, one two-byte sample word per
//! analog channel (high-voltage and feedback) and a bank-index byte, after a
//! fixed command header. Requests for more windows than fit are shrunk while
//! preserving the requested total duration; the shrink is a diagnostic, not
//! an error, and an oversized request is never sent to the transport.

/// Fixed command header preceding the window payload.
pub const COMMAND_HEADER_BYTES: usize = 4;
/// Per-window encoding cost: selector byte + 2 analog channels x 2-byte
/// sample word + bank-index byte.
pub const BYTES_PER_WINDOW: usize = 6;

/// A buffer-checked `(n_sampling_windows, delay_between_windows_ms)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    pub n_sampling_windows: u32,
    pub delay_between_windows_ms: u32,
    /// True when the request was shrunk to fit the command buffer.
    pub adjusted: bool,
}

/// Maximum windows per command for a given payload budget, at least 1.
pub fn max_windows(command_buffer_size: usize) -> u32 {
    let payload = command_buffer_size.saturating_sub(COMMAND_HEADER_BYTES);
    u32::try_from(payload / BYTES_PER_WINDOW).unwrap_or(u32::MAX).max(1)
}

/// Fit `(sampling_window_ms, n_sampling_windows, delay_between_windows_ms)`
/// into one command.
///
/// When the request already fits it is returned unchanged. Otherwise the
/// delay is recomputed to preserve the total duration `(window + delay) · n`:
/// the delay rounds up and the window count rounds down, so the adjusted
/// total never exceeds the original request.
pub fn plan(
    sampling_window_ms: u32,
    n_sampling_windows: u32,
    delay_between_windows_ms: u32,
    command_buffer_size: usize,
) -> WindowPlan {
    let n = n_sampling_windows.max(1);
    let n_max = max_windows(command_buffer_size);
    if n <= n_max {
        return WindowPlan {
            n_sampling_windows: n,
            delay_between_windows_ms,
            adjusted: false,
        };
    }

    let duration =
        (u64::from(sampling_window_ms) + u64::from(delay_between_windows_ms)) * u64::from(n);
    let per_window = duration.div_ceil(u64::from(n_max)).max(1);
    let delay = per_window.saturating_sub(u64::from(sampling_window_ms));
    let per_window = u64::from(sampling_window_ms) + delay;
    let n_fit = u32::try_from(duration / per_window.max(1))
        .unwrap_or(u32::MAX)
        .clamp(1, n_max);

    tracing::info!(
        requested = n,
        n_max,
        n_sampling_windows = n_fit,
        delay_between_windows_ms = delay,
        "buffer overflow avoided; sampling windows shrunk to fit command buffer"
    );

    WindowPlan {
        n_sampling_windows: n_fit,
        delay_between_windows_ms: u32::try_from(delay).unwrap_or(u32::MAX),
        adjusted: true,
    }
}

/// Windows needed to span a step duration at the given window/delay pacing.
pub fn windows_for_duration(
    duration_ms: u32,
    sampling_window_ms: u32,
    delay_between_windows_ms: u32,
) -> u32 {
    let per = sampling_window_ms
        .saturating_add(delay_between_windows_ms)
        .max(1);
    duration_ms.div_ceil(per).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_requests_pass_through() {
        let p = plan(10, 20, 5, 4 + 6 * 50);
        assert_eq!(
            p,
            WindowPlan {
                n_sampling_windows: 20,
                delay_between_windows_ms: 5,
                adjusted: false
            }
        );
    }

    #[test]
    fn oversized_request_keeps_total_duration() {
        // 5ms windows, no delay, 200 requested; budget fits 50.
        let p = plan(5, 200, 0, 4 + 6 * 50);
        assert_eq!(p.n_sampling_windows, 50);
        assert_eq!(p.delay_between_windows_ms, 15);
        assert!(p.adjusted);
        let original = (5u64 + 0) * 200;
        let adjusted = u64::from(5 + p.delay_between_windows_ms)
            * u64::from(p.n_sampling_windows);
        assert!(adjusted <= original);
    }

    #[test]
    fn delay_rounds_up_and_count_down() {
        // duration 7*3=21ms into 2 windows: per-window ceil(21/2)=11,
        // delay 11-7=4, fit = 21/11 = 1 window
        let p = plan(7, 3, 0, 4 + 6 * 2);
        assert_eq!(p.delay_between_windows_ms, 4);
        assert_eq!(p.n_sampling_windows, 1);
        assert!(u64::from(7 + p.delay_between_windows_ms) <= 21);
    }

    #[test]
    fn tiny_buffers_still_yield_one_window() {
        assert_eq!(max_windows(0), 1);
        assert_eq!(max_windows(9), 1);
        let p = plan(10, 100, 0, 0);
        assert_eq!(p.n_sampling_windows, 1);
    }

    #[test]
    fn duration_window_count_is_ceiling() {
        assert_eq!(windows_for_duration(100, 10, 0), 10);
        assert_eq!(windows_for_duration(101, 10, 0), 11);
        assert_eq!(windows_for_duration(100, 10, 5), 7);
        assert_eq!(windows_for_duration(0, 10, 0), 1);
        assert_eq!(windows_for_duration(50, 0, 0), 50);
    }
}
