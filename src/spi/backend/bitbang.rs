//! Bit-banged bus over embedded-hal 1.0 GPIO
//!
//! Clock idles high. Every bit is one low-then-high clock pulse: data-in
//! changes while the clock is high, data-out is sampled at the end of the
//! low phase, just before the rising edge the card latches on.

use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin},
};
use log::debug;

use crate::error::Error;
use super::{half_bit_delay_ns, BitTransport, BusSpeed, LineControl};

/// Bit-banged SD bus
///
/// * `CLK` – Clock line
/// * `CS`  – Chip select (active low)
/// * `DI`  – Card data-in (host MOSI)
/// * `DO`  – Card data-out (host MISO)
/// * `D`   – Delay provider used for the half-bit delay
///
/// The pins are owned for the lifetime of the bus, which is what keeps
/// another driver from toggling them.
pub struct BitBangBus<CLK, CS, DI, DO, D> {
    clock: CLK,
    select: CS,
    data_in: DI,
    data_out: DO,
    delay: D,
    half_bit_ns: u32,
}

impl<CLK, CS, DI, DO, D> BitBangBus<CLK, CS, DI, DO, D>
where
    CLK: OutputPin,
    CS: OutputPin,
    DI: OutputPin,
    DO: InputPin,
    D: DelayNs,
{
    /// Create a new bus, starting at identification speed
    pub fn new(clock: CLK, select: CS, data_in: DI, data_out: DO, delay: D) -> Self {
        Self {
            clock,
            select,
            data_in,
            data_out,
            delay,
            half_bit_ns: half_bit_delay_ns(super::IDENTIFICATION_CLOCK_HZ),
        }
    }

    /// Give the pins and delay back
    pub fn free(self) -> (CLK, CS, DI, DO, D) {
        (self.clock, self.select, self.data_in, self.data_out, self.delay)
    }

    /// Current half-bit delay in nanoseconds
    pub fn half_bit_ns(&self) -> u32 {
        self.half_bit_ns
    }

    fn settle(&mut self) {
        if self.half_bit_ns != 0 {
            self.delay.delay_ns(self.half_bit_ns);
        }
    }

    fn clock_low(&mut self) -> Result<(), Error> {
        self.clock.set_low().map_err(|_| Error::Gpio)
    }

    fn clock_high(&mut self) -> Result<(), Error> {
        self.clock.set_high().map_err(|_| Error::Gpio)
    }

    fn drive_data(&mut self, high: bool) -> Result<(), Error> {
        if high {
            self.data_in.set_high().map_err(|_| Error::Gpio)
        } else {
            self.data_in.set_low().map_err(|_| Error::Gpio)
        }
    }

    fn shift_out(&mut self, byte: u8) -> Result<(), Error> {
        for bit in (0..8).rev() {
            self.drive_data(byte & (1 << bit) != 0)?;
            self.clock_low()?;
            self.settle();
            self.clock_high()?;
            self.settle();
        }
        Ok(())
    }

    fn shift_in(&mut self) -> Result<u8, Error> {
        let mut byte = 0u8;
        for _ in 0..8 {
            self.clock_low()?;
            self.settle();
            let high = self.data_out.is_high().map_err(|_| Error::Gpio)?;
            byte = (byte << 1) | high as u8;
            self.clock_high()?;
            self.settle();
        }
        Ok(byte)
    }
}

impl<CLK, CS, DI, DO, D> BitTransport for BitBangBus<CLK, CS, DI, DO, D>
where
    CLK: OutputPin,
    CS: OutputPin,
    DI: OutputPin,
    DO: InputPin,
    D: DelayNs,
{
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for &byte in bytes {
            self.shift_out(byte)?;
        }
        // Release data-in to the idle level
        self.drive_data(true)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        self.drive_data(true)?;
        for byte in buffer.iter_mut() {
            *byte = self.shift_in()?;
        }
        Ok(())
    }

    fn set_bus_speed(&mut self, speed: BusSpeed) -> Result<(), Error> {
        self.half_bit_ns = speed.frequency_hz().map(half_bit_delay_ns).unwrap_or(0);
        debug!("Bus speed {speed:?}, half bit {} ns", self.half_bit_ns);
        Ok(())
    }
}

impl<CLK, CS, DI, DO, D> LineControl for BitBangBus<CLK, CS, DI, DO, D>
where
    CLK: OutputPin,
    CS: OutputPin,
    DI: OutputPin,
    DO: InputPin,
    D: DelayNs,
{
    fn set_chip_select(&mut self, asserted: bool) -> Result<(), Error> {
        if asserted {
            self.select.set_low().map_err(|_| Error::Gpio)?;
        } else {
            self.select.set_high().map_err(|_| Error::Gpio)?;
        }
        self.settle();
        Ok(())
    }

    fn idle_lines(&mut self) -> Result<(), Error> {
        self.select.set_high().map_err(|_| Error::Gpio)?;
        self.drive_data(true)?;
        self.clock_high()
    }

    fn release_lines(&mut self) -> Result<(), Error> {
        // Typed output pins cannot float; park them at the idle levels.
        self.idle_lines()
    }
}
