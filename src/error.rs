//! Our error types for the PSU channel core.

use thiserror::Error;

use crate::types::ProtectionKind;

pub type Result<T> = core::result::Result<T, Error>;

/// Errors returned synchronously by channel and dispatcher operations.
///
/// Protection trips are never reported through this type, they are state
/// transitions observed through the status queries and the event queue.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    #[error("Invalid channel index {0}")]
    InvalidChannel(usize),
    #[error("Channel {0} is not OK")]
    ChannelNotOk(u8),
    #[error("Value out of range")]
    OutOfRange,
    #[error("Value exceeds the configured limit")]
    LimitExceeded,
    #[error("Power limit exceeded")]
    PowerLimitExceeded,
    #[error("Feature not supported by this channel")]
    NotSupported,
    #[error("Channel coupling is not allowed")]
    CouplingNotAllowed,
    #[error("{0:?} protection is tripped")]
    ProtectionTripped(ProtectionKind),
    #[error("Low ripple mode is not allowed in the present operating point")]
    LowRippleNotAllowed,
    #[error("Hardware fault: {0}")]
    Hardware(HardwareFault),
    #[error("Invalid calibration: {0}")]
    Calibration(CalibrationError),
}

/// Reason a channel self-test failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareFault {
    #[error("ADC self-test failed")]
    Adc,
    #[error("DAC self-test failed")]
    Dac,
    #[error("IO expander self-test failed")]
    IoExpander,
    #[error("Power good signal lost")]
    PowerGood,
}

/// Reason a calibration table was refused when loading.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("Min and max physical values are equal")]
    DegenerateValue,
    #[error("Min and max ADC codes are equal")]
    DegenerateAdc,
    #[error("Mid point is not between min and max")]
    MidPointOutOfOrder,
    #[error("Calibration point is not a finite number")]
    NotFinite,
    #[error("Calibration point has not been measured")]
    MissingPoint,
    #[error("No calibration data for this axis")]
    NotCalibrated,
}

impl From<HardwareFault> for Error {
    fn from(err: HardwareFault) -> Self {
        Error::Hardware(err)
    }
}

impl From<CalibrationError> for Error {
    fn from(err: CalibrationError) -> Self {
        Error::Calibration(err)
    }
}
