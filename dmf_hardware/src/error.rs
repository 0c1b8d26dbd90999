use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("no measurement in flight")]
    NoMeasurementPending,
    #[error("a measurement is already in flight")]
    MeasurementInFlight,
    #[error("waveform out of range: {0}")]
    WaveformOutOfRange(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
