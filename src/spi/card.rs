/// MMC/SD card driver in SPI mode
///
/// Works on any bus implementing [`BitTransport`] + [`LineControl`]. All
/// operations are blocking; the only way out of a wait is its deadline.

use core::time::Duration;

use embedded_hal::delay::DelayNs;
use log::{debug, trace, warn};

use crate::block::{self, BlockDevice, Control, ControlResponse, DiskStatus, ERASE_BLOCK_SECTORS, SECTOR_SIZE};
use crate::error::Error;
use crate::time::{Clock, Delay, Timer};
use super::backend::{BusSpeed, SdBus};
use super::protocol::commands::{
    ocr, token, CardType, Command, CommandFrame, R1, ACMD41_HCS, BLOCK_LEN, IF_COND_ARGUMENT,
    R1_IDLE, R1_NO_RESPONSE, R1_READY,
};
use super::protocol::csd::Csd;

/// Worst-case busy time after a write
const READY_TIMEOUT: Duration = Duration::from_millis(500);

/// Worst-case read access time until the start token
const START_TOKEN_TIMEOUT: Duration = Duration::from_millis(125);

/// Op-cond polls before giving up on the card leaving idle state
const OP_COND_ATTEMPTS: u32 = 1000;

/// Bytes polled for an R1 after a command frame
const RESPONSE_ATTEMPTS: u32 = 10;

/// One burst of 80 clocks
const CLOCK_BURST: usize = 10;

/// Bursts sent at power-up, well above the required 74 clocks
const POWER_UP_BURSTS: usize = 41;

/// Whether the last initialization succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStatus {
    Uninitialized,
    Ready,
    Error,
}

/// SD/MMC card on a 4-wire SPI-mode bus
///
/// * `B` – Bus the card sits on
/// * `C` – Monotonic clock for deadlines and handshake pauses
pub struct SdCard<B, C> {
    bus: B,
    clock: C,
    status: CardStatus,
    card_type: CardType,
}

impl<B, C> SdCard<B, C>
where
    B: SdBus,
    C: Clock,
{
    /// Create a driver that owns `bus` until [`SdCard::free`]
    pub fn new(bus: B, clock: C) -> Self {
        Self {
            bus,
            clock,
            status: CardStatus::Uninitialized,
            card_type: CardType::empty(),
        }
    }

    /// Give the bus and clock back
    pub fn free(self) -> (B, C) {
        (self.bus, self.clock)
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn card_status(&self) -> CardStatus {
        self.status
    }

    /// Card type detected by the last successful initialization
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    fn check_ready(&self) -> Result<(), Error> {
        if self.status != CardStatus::Ready {
            return Err(Error::NotReady);
        }
        Ok(())
    }

    /// Deselect the card, then hand back `result`
    fn finish<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        let deselected = self.deselect();
        let value = result?;
        deselected.map(|_| value)
    }

    fn pause_ms(&self, ms: u32) {
        Delay::new(&self.clock).delay_ms(ms);
    }

    fn clock_bursts(&mut self, bursts: usize) -> Result<(), Error> {
        let mut sink = [0u8; CLOCK_BURST];
        for _ in 0..bursts {
            self.bus.receive(&mut sink)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Line control
    // ---------------------------------------------------------------------

    /// Poll until the card releases data-out (reads 0xFF) or 500 ms pass
    pub fn wait_ready(&mut self) -> Result<bool, Error> {
        let mut timer = Timer::new(&self.clock);
        timer.start(READY_TIMEOUT);
        let mut byte = [0u8; 1];
        loop {
            self.bus.receive(&mut byte)?;
            if byte[0] == 0xFF {
                return Ok(true);
            }
            if timer.is_expired().unwrap_or(true) {
                warn!("Card busy for more than {READY_TIMEOUT:?}");
                return Ok(false);
            }
        }
    }

    /// Assert chip select and wait for the card
    ///
    /// The dummy byte makes the card drive data-out again on a shared bus.
    /// On timeout the card is deselected again.
    pub fn select(&mut self) -> Result<bool, Error> {
        self.bus.set_chip_select(true)?;
        let mut dummy = [0u8; 1];
        self.bus.receive(&mut dummy)?;
        if self.wait_ready()? {
            return Ok(true);
        }
        self.deselect()?;
        Ok(false)
    }

    /// Deassert chip select
    ///
    /// The dummy byte makes the card release data-out on a shared bus.
    pub fn deselect(&mut self) -> Result<(), Error> {
        self.bus.set_chip_select(false)?;
        let mut dummy = [0u8; 1];
        self.bus.receive(&mut dummy)
    }

    // ---------------------------------------------------------------------
    // Command protocol
    // ---------------------------------------------------------------------

    /// Send a command and return its R1 byte
    ///
    /// Application commands are prefixed with APP_CMD; if that fails its
    /// response is returned instead. [`R1_NO_RESPONSE`] means the card
    /// could not be selected or never answered. `Err` is only returned for
    /// bus failures.
    pub fn send_command(&mut self, command: Command, argument: u32) -> Result<u8, Error> {
        if command.is_app() {
            let r1 = self.send_command(Command::AppCmd, 0)?;
            if r1 > R1_IDLE {
                return Ok(r1);
            }
        }

        if command != Command::StopTransmission {
            self.deselect()?;
            if !self.select()? {
                return Ok(R1_NO_RESPONSE);
            }
        }

        let frame = CommandFrame::new(command, argument);
        self.bus.transmit(frame.as_bytes())?;

        let mut response = [R1_NO_RESPONSE; 1];
        if command == Command::StopTransmission {
            // Stuff byte
            self.bus.receive(&mut response)?;
        }
        for _ in 0..RESPONSE_ATTEMPTS {
            self.bus.receive(&mut response)?;
            if R1::from_response(response[0]).is_some() {
                break;
            }
        }

        trace!("CMD{} ({argument:#010X}) -> {:#04X}", command.index(), response[0]);
        Ok(response[0])
    }

    fn rejection(command: Command, response: u8) -> Error {
        match R1::from_response(response) {
            None => Error::NoResponse { command: command.index() },
            Some(_) => Error::CommandRejected {
                command: command.index(),
                response,
            },
        }
    }

    fn command_ok(&mut self, command: Command, argument: u32) -> Result<(), Error> {
        let r1 = self.send_command(command, argument)?;
        if r1 != R1_READY {
            warn!("CMD{} rejected: {:?}", command.index(), R1::from_response(r1));
            return Err(Self::rejection(command, r1));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Data block framing
    // ---------------------------------------------------------------------

    /// Receive one data block into `buffer` (512 bytes for a sector)
    ///
    /// The payload is only valid when `Ok` is returned.
    pub fn receive_data_block(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let mut timer = Timer::new(&self.clock);
        timer.start(START_TOKEN_TIMEOUT);
        let mut start = [0xFFu8; 1];
        loop {
            self.bus.receive(&mut start)?;
            if start[0] != 0xFF || timer.is_expired().unwrap_or(true) {
                break;
            }
        }

        match start[0] {
            token::START_BLOCK => {}
            0xFF => {
                warn!("No start token within {START_TOKEN_TIMEOUT:?}");
                return Err(Error::Timeout);
            }
            other => {
                warn!("Bad start token {other:#04X}");
                return Err(Error::BadStartToken { token: other });
            }
        }

        self.bus.receive(buffer)?;
        let mut crc = [0u8; 2];
        self.bus.receive(&mut crc)
    }

    /// Send one data block led by the `start` token
    ///
    /// For [`token::STOP_TRAN`] only the token goes out and `block` is
    /// ignored.
    pub fn transmit_data_block(&mut self, start: u8, block: &[u8]) -> Result<(), Error> {
        if !self.wait_ready()? {
            return Err(Error::Timeout);
        }

        self.bus.transmit(&[start])?;
        if start == token::STOP_TRAN {
            return Ok(());
        }

        self.bus.transmit(block)?;
        // CRC is not checked in SPI mode
        self.bus.transmit(&[0xFF, 0xFF])?;

        let mut response = [0u8; 1];
        self.bus.receive(&mut response)?;
        if response[0] & token::DATA_RES_MASK != token::DATA_RES_ACCEPTED {
            warn!("Data block rejected: {:#04X}", response[0]);
            return Err(Error::DataRejected { response: response[0] });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Initialization
    // ---------------------------------------------------------------------

    /// Run the power-up handshake and classify the card
    ///
    /// Idempotent; every call starts from scratch.
    pub fn initialize(&mut self) -> DiskStatus {
        self.status = CardStatus::Uninitialized;

        let outcome = self.handshake();
        let outcome = self.finish(outcome).and_then(|card_type| {
            self.bus.set_bus_speed(BusSpeed::Full)?;
            Ok(card_type)
        });

        match outcome {
            Ok(card_type) => {
                debug!("Card ready: {card_type:?}");
                self.card_type = card_type;
                self.status = CardStatus::Ready;
                DiskStatus::Ready
            }
            Err(e) => {
                warn!("Card initialization failed: {e}");
                self.card_type = CardType::empty();
                self.status = CardStatus::Error;
                DiskStatus::NotInitialized
            }
        }
    }

    fn handshake(&mut self) -> Result<CardType, Error> {
        self.pause_ms(1);
        self.bus.idle_lines()?;
        self.bus.set_bus_speed(BusSpeed::Identification)?;
        self.pause_ms(1);
        self.clock_bursts(POWER_UP_BURSTS)?;

        // Knock a card that was left mid-transfer back to idle
        self.send_command(Command::GoIdleState, 0)?;
        self.send_command(Command::SendIfCond, IF_COND_ARGUMENT)?;
        let mut trailer = [0u8; 4];
        self.bus.receive(&mut trailer)?;
        self.deselect()?;
        Delay::new(&self.clock).delay_us(100);
        self.clock_bursts(1)?;

        let r1 = self.send_command(Command::GoIdleState, 0)?;
        if r1 != R1_IDLE {
            warn!("No card: CMD0 -> {r1:#04X}");
            return Err(Self::rejection(Command::GoIdleState, r1));
        }
        self.clock_bursts(1)?;

        if self.send_command(Command::SendIfCond, IF_COND_ARGUMENT)? == R1_IDLE {
            self.init_sd_v2()
        } else {
            self.init_legacy()
        }
    }

    fn init_sd_v2(&mut self) -> Result<CardType, Error> {
        let mut r7 = [0u8; 4];
        self.bus.receive(&mut r7)?;
        debug!("SEND_IF_COND R7 {r7:02X?}");
        if r7[2] != 0x01 || r7[3] != 0xAA {
            warn!("Card does not accept 2.7-3.6 V or echoed a bad pattern");
            return Err(Error::InitializationFailed);
        }

        for _ in 0..OP_COND_ATTEMPTS {
            if self.send_command(Command::SdSendOpCond, ACMD41_HCS)? == R1_READY {
                let r1 = self.send_command(Command::ReadOcr, 0)?;
                let mut ocr = [0u8; 4];
                self.bus.receive(&mut ocr)?;
                if r1 == R1_READY && ocr[0] & ocr::POWER_UP != 0 {
                    debug!("OCR {ocr:02X?}");
                    return Ok(if ocr[0] & ocr::CCS != 0 {
                        CardType::SD2 | CardType::BLOCK
                    } else {
                        CardType::SD2
                    });
                }
            }
            self.pause_ms(1);
        }

        warn!("SDv2 card did not leave idle state");
        Err(Error::Timeout)
    }

    fn init_legacy(&mut self) -> Result<CardType, Error> {
        let (card_type, op_cond) = if self.send_command(Command::SdSendOpCond, 0)? <= R1_IDLE {
            (CardType::SD1, Command::SdSendOpCond)
        } else {
            (CardType::MMC, Command::SendOpCond)
        };
        debug!("Legacy card, probing as {card_type:?}");

        let mut ready = false;
        for _ in 0..OP_COND_ATTEMPTS {
            if self.send_command(op_cond, 0)? == R1_READY {
                ready = true;
                break;
            }
            self.pause_ms(1);
        }
        if !ready {
            warn!("{card_type:?} card did not leave idle state");
            return Err(Error::Timeout);
        }

        self.command_ok(Command::SetBlockLen, BLOCK_LEN)?;
        Ok(card_type)
    }

    /// Forget the card and stop driving the lines
    pub fn deinitialize(&mut self) -> Result<(), Error> {
        self.status = CardStatus::Uninitialized;
        self.card_type = CardType::empty();
        self.bus.release_lines()
    }

    // ---------------------------------------------------------------------
    // Block I/O
    // ---------------------------------------------------------------------

    /// Command argument for a transfer of `count` sectors at `sector`
    ///
    /// Fails when the last sector is out of the card's address range, so a
    /// byte-addressed card never sees a wrapped address.
    fn transfer_address(&self, sector: u32, count: u32) -> Result<u32, Error> {
        let last = sector.checked_add(count - 1).ok_or(Error::InvalidArgument)?;
        self.card_type.address(last).ok_or(Error::InvalidArgument)?;
        self.card_type.address(sector).ok_or(Error::InvalidArgument)
    }

    /// Read `buffer.len() / 512` sectors starting at `sector`
    pub fn read_sectors(&mut self, sector: u32, buffer: &mut [u8]) -> Result<(), Error> {
        self.check_ready()?;
        let count = block::sector_count(buffer.len())?;
        let address = self.transfer_address(sector, count)?;
        trace!("Read {count} sectors @ {sector}");

        let result = self.read_blocks(address, count, buffer);
        let result = self.finish(result);
        if result.is_err() {
            // The card may still be streaming; give it clocks with select
            // deasserted before the next command.
            self.clock_bursts(1)?;
        }
        result
    }

    fn read_blocks(&mut self, address: u32, count: u32, buffer: &mut [u8]) -> Result<(), Error> {
        let command = if count > 1 {
            Command::ReadMultipleBlock
        } else {
            Command::ReadSingleBlock
        };
        self.command_ok(command, address)?;

        let mut received = Ok(());
        for chunk in buffer.chunks_exact_mut(SECTOR_SIZE) {
            received = self.receive_data_block(chunk);
            if received.is_err() {
                break;
            }
        }

        if command == Command::ReadMultipleBlock {
            self.send_command(Command::StopTransmission, 0)?;
        }
        received
    }

    /// Write `buffer.len() / 512` sectors starting at `sector`
    pub fn write_sectors(&mut self, sector: u32, buffer: &[u8]) -> Result<(), Error> {
        self.check_ready()?;
        let count = block::sector_count(buffer.len())?;
        let address = self.transfer_address(sector, count)?;
        trace!("Write {count} sectors @ {sector}");

        let result = if count == 1 {
            self.write_single(address, buffer)
        } else {
            self.write_multiple(address, count, buffer)
        };
        self.finish(result)
    }

    fn write_single(&mut self, address: u32, block: &[u8]) -> Result<(), Error> {
        self.command_ok(Command::WriteBlock, address)?;
        self.transmit_data_block(token::START_BLOCK, block)
    }

    fn write_multiple(&mut self, address: u32, count: u32, buffer: &[u8]) -> Result<(), Error> {
        if self.card_type.is_sd() {
            // Pre-erase hint, result does not matter
            self.send_command(Command::SetWrBlkEraseCount, count)?;
        }
        self.command_ok(Command::WriteMultipleBlock, address)?;

        let mut written = Ok(());
        for block in buffer.chunks_exact(SECTOR_SIZE) {
            written = self.transmit_data_block(token::START_MULTI_WRITE, block);
            if written.is_err() {
                break;
            }
        }

        let stopped = self.transmit_data_block(token::STOP_TRAN, &[]);
        written.and(stopped)
    }

    fn read_csd(&mut self) -> Result<Csd, Error> {
        self.command_ok(Command::SendCsd, 0)?;
        let mut raw = [0u8; Csd::LEN];
        self.receive_data_block(&mut raw)?;
        let csd = Csd::new(raw);
        debug!("CSD {raw:02X?}, version {:?}", csd.version());
        Ok(csd)
    }

    /// Total number of sectors from the CSD register
    pub fn capacity_in_sectors(&mut self) -> Result<u64, Error> {
        self.check_ready()?;
        let result = self.read_csd().and_then(|csd| csd.sector_count());
        self.finish(result)
    }

    /// Wait until no write is pending inside the card
    pub fn sync(&mut self) -> Result<(), Error> {
        self.check_ready()?;
        let result = match self.select() {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Timeout),
            Err(e) => Err(e),
        };
        self.finish(result)
    }
}

impl<B, C> BlockDevice for SdCard<B, C>
where
    B: SdBus,
    C: Clock,
{
    fn status(&self) -> DiskStatus {
        match self.status {
            CardStatus::Ready => DiskStatus::Ready,
            _ => DiskStatus::NotInitialized,
        }
    }

    fn initialize(&mut self) -> DiskStatus {
        SdCard::initialize(self)
    }

    fn read(&mut self, sector: u32, buffer: &mut [u8]) -> Result<(), Error> {
        self.read_sectors(sector, buffer)
    }

    fn write(&mut self, sector: u32, buffer: &[u8]) -> Result<(), Error> {
        self.write_sectors(sector, buffer)
    }

    fn control(&mut self, request: Control) -> Result<ControlResponse, Error> {
        self.check_ready()?;
        match request {
            Control::Sync => self.sync().map(|_| ControlResponse::Done),
            Control::GetSectorCount => self.capacity_in_sectors().map(ControlResponse::SectorCount),
            Control::GetBlockSize => {
                let result = Ok(ControlResponse::BlockSize(ERASE_BLOCK_SECTORS));
                self.finish(result)
            }
        }
    }

    fn deinitialize(&mut self) -> Result<(), Error> {
        SdCard::deinitialize(self)
    }
}
