//! embedded-hal 1.0 SPI peripheral backend
//!
//! Same card protocol, but the bits are shifted by a hardware `SpiBus`.
//! Chip select stays a plain GPIO because the card needs clocks with
//! select deasserted, which `SpiDevice` cannot express.

use embedded_hal::{
    digital::OutputPin,
    spi::SpiBus,
};
use log::debug;

use crate::error::Error;
use super::{BitTransport, BusSpeed, LineControl};

/// Hook that reprograms the peripheral clock
pub type Reclock<SPI> = fn(&mut SPI, BusSpeed);

/// Peripheral-backed SD bus
///
/// * `SPI` – SPI bus in mode 0, MSB first
/// * `CS`  – Chip select pin (active low)
pub struct HwSpiBus<SPI, CS> {
    spi: SPI,
    select: CS,
    reclock: Option<Reclock<SPI>>,
}

impl<SPI, CS> HwSpiBus<SPI, CS>
where
    SPI: SpiBus,
    CS: OutputPin,
{
    /// Create a new bus. The peripheral should already run at or below
    /// 400 kHz unless a reclock hook is installed.
    pub fn new(spi: SPI, select: CS) -> Self {
        Self {
            spi,
            select,
            reclock: None,
        }
    }

    /// Install a hook called whenever the driver changes bus speed
    pub fn with_reclock(mut self, reclock: Reclock<SPI>) -> Self {
        self.reclock = Some(reclock);
        self
    }

    /// Give the peripheral and select pin back
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.select)
    }
}

impl<SPI, CS> BitTransport for HwSpiBus<SPI, CS>
where
    SPI: SpiBus,
    CS: OutputPin,
{
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.spi.write(bytes).map_err(|_| Error::Spi)?;
        self.spi.flush().map_err(|_| Error::Spi)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        // The card must see 0xFF while it talks
        buffer.fill(0xFF);
        self.spi.transfer_in_place(buffer).map_err(|_| Error::Spi)?;
        self.spi.flush().map_err(|_| Error::Spi)
    }

    fn set_bus_speed(&mut self, speed: BusSpeed) -> Result<(), Error> {
        match self.reclock {
            Some(reclock) => reclock(&mut self.spi, speed),
            None => debug!("No reclock hook, staying at current SPI clock"),
        }
        Ok(())
    }
}

impl<SPI, CS> LineControl for HwSpiBus<SPI, CS>
where
    SPI: SpiBus,
    CS: OutputPin,
{
    fn set_chip_select(&mut self, asserted: bool) -> Result<(), Error> {
        if asserted {
            self.select.set_low().map_err(|_| Error::Gpio)
        } else {
            self.select.set_high().map_err(|_| Error::Gpio)
        }
    }

    fn idle_lines(&mut self) -> Result<(), Error> {
        self.select.set_high().map_err(|_| Error::Gpio)
    }

    fn release_lines(&mut self) -> Result<(), Error> {
        self.idle_lines()
    }
}
