/// FTDI backend implementation using libftd2xx
///
/// Drives the card from one FT4232H port in synchronous bit-bang mode. Any
/// four pins of the port can be used, see [`LinePins`].

use std::time::Duration;

use libftd2xx::{BitMode, Ft4232h, FtdiCommon};
use log::debug;

use crate::error::Error;
use super::{half_bit_delay_ns, BitTransport, BusSpeed, LineControl, LinePins, IDENTIFICATION_CLOCK_HZ};

const BITMODE: BitMode = BitMode::SyncBitbang;

/// Return `state` with the lines in `mask` driven to `high`
fn with_line(state: u8, mask: u8, high: bool) -> u8 {
    if high {
        state | mask
    } else {
        state & !mask
    }
}

/// Port state with the bus parked: clock, select and data-in high
fn idle_state(pins: &LinePins) -> u8 {
    pins.output_mask()
}

/// FTDI bit-bang bus
pub struct FtdiBitBang {
    device: Ft4232h,
    pins: LinePins,
    state: u8,
    half_bit: Duration,
}

impl FtdiBitBang {
    /// Take over `device` and park the bus lines
    pub fn new(device: Ft4232h, pins: LinePins) -> Result<Self, Error> {
        let mut bus = Self {
            device,
            pins,
            state: idle_state(&pins),
            half_bit: Duration::from_nanos(half_bit_delay_ns(IDENTIFICATION_CLOCK_HZ) as u64),
        };
        bus.device.set_bit_mode(pins.output_mask(), BITMODE)?;
        bus.drive(bus.state)?;
        Ok(bus)
    }

    /// Open FTDI device by description
    pub fn open(description: &str, pins: LinePins) -> Result<Self, Error> {
        let device = Ft4232h::with_description(description)?;
        debug!("Opened {description} with {pins:?}");
        Self::new(device, pins)
    }

    pub fn free(self) -> Ft4232h {
        self.device
    }

    fn drive(&mut self, state: u8) -> Result<(), Error> {
        self.state = state;
        self.device.write(&[state])?;
        Ok(())
    }

    fn set_line(&mut self, mask: u8, high: bool) -> Result<(), Error> {
        self.drive(with_line(self.state, mask, high))
    }

    fn sample(&mut self) -> Result<bool, Error> {
        let bits = self.device.bit_mode()?;
        Ok(bits & self.pins.data_out_mask() != 0)
    }

    fn settle(&self) {
        if !self.half_bit.is_zero() {
            std::thread::sleep(self.half_bit);
        }
    }

    fn shift(&mut self, out: u8) -> Result<u8, Error> {
        let mut input = 0u8;
        for bit in (0..8).rev() {
            let state = with_line(self.state, self.pins.data_in_mask(), out & (1 << bit) != 0);
            self.drive(with_line(state, self.pins.clock_mask(), false))?;
            self.settle();
            input = (input << 1) | self.sample()? as u8;
            self.set_line(self.pins.clock_mask(), true)?;
            self.settle();
        }
        Ok(input)
    }
}

impl BitTransport for FtdiBitBang {
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for &byte in bytes {
            self.shift(byte)?;
        }
        self.set_line(self.pins.data_in_mask(), true)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        for byte in buffer.iter_mut() {
            *byte = self.shift(0xFF)?;
        }
        Ok(())
    }

    fn set_bus_speed(&mut self, speed: BusSpeed) -> Result<(), Error> {
        let ns = speed.frequency_hz().map(half_bit_delay_ns).unwrap_or(0);
        self.half_bit = Duration::from_nanos(ns as u64);
        debug!("Bus speed {speed:?}, half bit {:?}", self.half_bit);
        Ok(())
    }
}

impl LineControl for FtdiBitBang {
    fn set_chip_select(&mut self, asserted: bool) -> Result<(), Error> {
        // Active low
        self.set_line(self.pins.select_mask(), !asserted)?;
        self.settle();
        Ok(())
    }

    fn idle_lines(&mut self) -> Result<(), Error> {
        self.device.set_bit_mode(self.pins.output_mask(), BITMODE)?;
        self.drive(idle_state(&self.pins))
    }

    fn release_lines(&mut self) -> Result<(), Error> {
        // All pins back to inputs
        self.device.set_bit_mode(0, BITMODE)?;
        Ok(())
    }
}
