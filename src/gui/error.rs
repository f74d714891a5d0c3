use crate::error::HardwareError;
use std::{error::Error, fmt::Display};

/// Failures of the terminal interface.
#[derive(Debug)]
pub enum RigGuiError {
    /// Drawing or reading the terminal failed.
    IOError(std::io::Error),
    /// The serial device list could not be read.
    HardwareError(HardwareError),
}

impl Display for RigGuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IOError(e) => write!(f, "terminal error: {}", e),
            Self::HardwareError(e) => write!(f, "{}", e),
        }
    }
}

impl Error for RigGuiError {}

impl From<std::io::Error> for RigGuiError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<HardwareError> for RigGuiError {
    fn from(value: HardwareError) -> Self {
        Self::HardwareError(value)
    }
}
