pub mod clock;

pub use clock::{Clock, MonotonicClock};

/// Boxed error type used across the hardware boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One impedance measurement command as accepted by the control board.
///
/// `channel_state` holds one 0/1 entry per electrode channel; its length must
/// match the board's `channel_count()`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRequest {
    pub sampling_window_ms: u32,
    pub n_sampling_windows: u32,
    pub delay_between_windows_ms: u32,
    /// Interleave high-voltage and feedback samples within a window
    /// (firmware-side acquisition order only).
    pub interleave_samples: bool,
    /// Report per-window RMS amplitudes; peak amplitudes when false.
    pub use_rms: bool,
    pub channel_state: Vec<u8>,
}

/// Raw per-window readings returned by the board for one sampling window.
///
/// `hv_resistor` / `fb_resistor` are the series-resistor bank indices selected
/// by the firmware's auto-ranging for that window; -1 means no bank produced
/// an in-range reading and the window's voltages are unusable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawWindow {
    /// High-voltage-side amplitude (V).
    pub v_hv: f64,
    /// Feedback-side amplitude (V).
    pub v_fb: f64,
    pub hv_resistor: i8,
    pub fb_resistor: i8,
}

impl RawWindow {
    /// True when both resistor banks produced an in-range reading.
    pub fn banks_valid(&self) -> bool {
        self.hv_resistor >= 0 && self.fb_resistor >= 0
    }
}

/// Opaque link to the DMF control board.
///
/// The byte protocol, serial discovery and firmware management live behind
/// this trait. Measurements come in a blocking flavor (`measure`) and a
/// split non-blocking flavor: `start_measurement` queues the command and
/// returns immediately; `take_measurement` collects the finished windows
/// after the caller has waited out the sampling duration.
pub trait Transport {
    fn measure(&mut self, req: &MeasurementRequest) -> Result<Vec<RawWindow>, BoxError>;

    fn start_measurement(&mut self, req: &MeasurementRequest) -> Result<(), BoxError>;
    fn take_measurement(&mut self) -> Result<Vec<RawWindow>, BoxError>;

    fn set_waveform_voltage(&mut self, vrms: f64) -> Result<(), BoxError>;
    fn set_waveform_frequency(&mut self, hz: f64) -> Result<(), BoxError>;

    /// Apply an electrode state without measuring.
    fn set_channel_state(&mut self, state: &[u8]) -> Result<(), BoxError>;

    fn channel_count(&mut self) -> usize;
    /// Fixed command payload budget in bytes; bounds how many sampling
    /// windows fit in a single measurement command.
    fn command_buffer_size(&mut self) -> usize;

    /// Re-assert the external power-stage watchdog.
    fn assert_watchdog(&mut self) -> Result<(), BoxError>;

    /// Push updated series resistor/capacitor bank values to the board.
    /// Until this is called, edits to host-side calibration have no effect
    /// on the measurement hardware.
    fn sync_calibration(
        &mut self,
        r_hv: &[f64],
        c_hv: &[f64],
        r_fb: &[f64],
        c_fb: &[f64],
    ) -> Result<(), BoxError>;
}
