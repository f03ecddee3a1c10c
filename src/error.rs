use thiserror::Error as DeriveError;
#[cfg(feature = "ftdi")]
use libftd2xx::{FtStatus, DeviceTypeError};

#[derive(DeriveError, Debug)]
pub enum Error {
    #[error("Card not initialized")]
    NotReady,

    #[error("Card did not respond in time")]
    Timeout,

    #[error("No response to CMD{command}")]
    NoResponse { command: u8 },

    #[error("CMD{command} rejected with R1 {response:#04X}")]
    CommandRejected { command: u8, response: u8 },

    #[error("Data block rejected with token {response:#04X}")]
    DataRejected { response: u8 },

    #[error("Expected data start token, got {token:#04X}")]
    BadStartToken { token: u8 },

    #[error("Card initialization failed")]
    InitializationFailed,

    #[error("Unknown CSD structure version {version}")]
    UnknownCsdVersion { version: u8 },

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Access is not sector aligned")]
    UnalignedAccess,

    #[error("Unsupported control code {code}")]
    UnsupportedControl { code: u8 },

    #[error("GPIO access failed")]
    Gpio,

    #[error("SPI transfer failed")]
    Spi,

    #[cfg(feature = "ftdi")]
    #[error("FTDI Status: {0}")]
    FtStatus(#[from] FtStatus),

    #[cfg(feature = "ftdi")]
    #[error("FTDI Device Type Error: {0}")]
    DeviceTypeError(#[from] DeviceTypeError),
}
