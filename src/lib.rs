#![cfg_attr(not(feature = "std"), no_std)]

pub mod block;
pub mod error;
pub mod spi;
pub mod time;

#[cfg(feature = "std")]
pub mod file;

pub use embedded_hal::digital as eh_digital;
pub use embedded_hal::spi as eh_spi;
pub use block::{BlockDevice, Control, ControlResponse, DiskStatus, SECTOR_SIZE};
pub use error::Error;
pub use spi::card::{CardStatus, SdCard};
pub use spi::protocol::commands::CardType;

#[cfg(feature = "ftdi")]
pub use libftd2xx::{Ft4232h, FtdiCommon, BitMode};
