use thiserror::Error;

/// Typed failures raised by the control loop and step orchestrator.
///
/// Quantity-derivation failures (zero denominators, missing resistor
/// selections) are never raised; they are absorbed as NaN samples so series
/// stay index-aligned.
#[derive(Debug, Error, Clone)]
pub enum FeedbackError {
    /// The requested specific-capacitance curve has never been measured.
    /// Recoverable: callers fall back to direct voltage mode.
    #[error("no {0} capacitance calibration has been measured")]
    CalibrationMissing(&'static str),
    /// The amplifier is not delivering the commanded voltage. Fatal to the
    /// current step and always surfaced to the operator.
    #[error(
        "low actuation voltage: measured {measured:.1} V (requested {requested:.1} V); \
         check that the amplifier is on"
    )]
    LowVoltage { measured: f64, requested: f64 },
    /// Gain adjustment exhausted its attempts. Logged as a warning; the step
    /// proceeds without further correction.
    #[error("unable to reach the requested voltage after {attempts} adjustment attempts")]
    VoltageToleranceExceeded { attempts: u32 },
    /// The actuated area cannot be computed. Fatal to the step.
    #[error("actuated area is not set; assign an area to the device electrodes")]
    DeviceScaleNotSet,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid state: {0}")]
    State(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing transport")]
    MissingTransport,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
