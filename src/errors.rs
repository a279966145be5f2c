use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("timeout: no complete frame after {waited:?}")]
    Timeout { waited: Duration },
    #[error("checksum validation failed (xor={checksum:#04X})")]
    Crc { checksum: u8 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
}

impl DriverError {
    /// Numeric status as reported by the sensor firmware: 1 = timeout, 2 = checksum.
    ///
    /// Adapter errors never come out of a read; they map to 3.
    pub fn code(&self) -> u8 {
        match self {
            DriverError::Timeout { .. } => 1,
            DriverError::Crc { .. } => 2,
            DriverError::Io(_) | DriverError::Serial(_) => 3,
        }
    }

    /// True for the two failures a caller may simply retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DriverError::Timeout { .. } | DriverError::Crc { .. })
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
