/// Backend abstraction module - hardware-specific implementations
///
/// This module defines the transport traits the card protocol is built on
/// and provides implementations for bit-banged GPIO, a hardware SPI
/// peripheral and an FTDI port in bit-bang mode.

use crate::error::Error;

pub mod bitbang;
pub mod hwspi;

#[cfg(feature = "ftdi")]
pub mod ftdi;

#[cfg(test)]
pub(crate) mod sim;

/// Bus clock used by the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSpeed {
    /// Conservative clock for the power-up handshake (~400 kHz)
    Identification,
    /// Fastest clock the transport can toggle
    Full,
}

impl BusSpeed {
    /// Target frequency, `None` when the transport runs unthrottled
    pub fn frequency_hz(self) -> Option<u32> {
        match self {
            Self::Identification => Some(IDENTIFICATION_CLOCK_HZ),
            Self::Full => None,
        }
    }
}

/// Clock rate for the identification phase
pub const IDENTIFICATION_CLOCK_HZ: u32 = 400_000;

/// Half-bit delay in nanoseconds for the given bus frequency, rounded to
/// the nearest nanosecond.
pub const fn half_bit_delay_ns(bus_hz: u32) -> u32 {
    let period2 = 2 * bus_hz as u64;
    ((1_000_000_000 + bus_hz as u64) / period2) as u32
}

/// Byte level transport
///
/// Shifts whole bytes most-significant bit first. Has no knowledge of
/// commands, tokens or card state.
pub trait BitTransport {
    /// Clock out `bytes` on the data-in line. The line is left high.
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Clock in `buffer.len()` bytes from the data-out line while holding
    /// data-in high.
    fn receive(&mut self, buffer: &mut [u8]) -> Result<(), Error>;

    /// Change the bus clock
    fn set_bus_speed(&mut self, speed: BusSpeed) -> Result<(), Error>;
}

/// Raw line control
pub trait LineControl {
    /// Drive chip select (active low, so asserted = low)
    fn set_chip_select(&mut self, asserted: bool) -> Result<(), Error>;

    /// Put every line in its idle state: select deasserted, clock and
    /// data-in high.
    fn idle_lines(&mut self) -> Result<(), Error>;

    /// Stop driving the lines
    fn release_lines(&mut self) -> Result<(), Error>;
}

/// Everything the card driver needs from a bus
pub trait SdBus: BitTransport + LineControl {}

impl<T: BitTransport + LineControl> SdBus for T {}

/// Pin numbers of the four bus lines on a bit-bang port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinePins {
    pub clock: u8,
    pub select: u8,
    pub data_in: u8,
    pub data_out: u8,
}

impl LinePins {
    /// Number of lines on one bit-bang port
    pub const PORT_WIDTH: u8 = 8;

    /// Validate a line assignment
    ///
    /// Every pin must exist on the port and no pin may serve two lines.
    pub fn configure(clock: u8, select: u8, data_in: u8, data_out: u8) -> Result<Self, Error> {
        let pins = [clock, select, data_in, data_out];
        if pins.iter().any(|&pin| pin >= Self::PORT_WIDTH) {
            return Err(Error::InvalidArgument);
        }
        for (i, a) in pins.iter().enumerate() {
            if pins[i + 1..].contains(a) {
                return Err(Error::InvalidArgument);
            }
        }

        Ok(Self {
            clock,
            select,
            data_in,
            data_out,
        })
    }

    pub fn clock_mask(&self) -> u8 {
        1 << self.clock
    }

    pub fn select_mask(&self) -> u8 {
        1 << self.select
    }

    pub fn data_in_mask(&self) -> u8 {
        1 << self.data_in
    }

    pub fn data_out_mask(&self) -> u8 {
        1 << self.data_out
    }

    /// Lines driven by the host
    pub fn output_mask(&self) -> u8 {
        self.clock_mask() | self.select_mask() | self.data_in_mask()
    }
}
