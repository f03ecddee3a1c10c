//! Simulated SD card on a full-duplex byte bus, for tests
//!
//! Every clocked byte has an input (what the host drives on data-in) and an
//! output (what the card drives on data-out). `transmit` discards the
//! output, `receive` drives 0xFF. The card answers commands with one byte
//! of command-response latency and models the busy period after a write.

use std::collections::VecDeque;

use crate::error::Error;
use super::{BitTransport, BusSpeed, LineControl};

pub const SECTOR: usize = 512;

/// Kind of card in the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// SDv2, high capacity, sector addressed
    SdHc,
    /// SDv2, standard capacity, byte addressed
    SdV2,
    /// SDv1, byte addressed
    SdV1,
    /// MMCv3, byte addressed, no application commands
    Mmc,
    /// Nothing drives data-out
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    ReadMulti { next: u32 },
    WriteSingle { sector: u32 },
    WriteMulti { next: u32 },
}

/// Token a card sends instead of a data block when the read fails
/// (error token with the out-of-range bit)
pub const READ_ERROR_TOKEN: u8 = 0x08;

/// Data response for a block the card refused to write
pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;

pub struct SimCard {
    kind: SimKind,
    selected: bool,
    out: VecDeque<u8>,
    busy: u32,
    frame: Vec<u8>,
    block: Option<Vec<u8>>,
    mode: Mode,
    app: bool,
    idle: bool,
    polls_left: u32,
    op_cond_polls: u32,
    sectors: Vec<[u8; SECTOR]>,
    csd: [u8; 16],

    /// Index (counting every data block received) of a block to refuse
    pub reject_write_at: Option<usize>,
    /// Sector whose read fails with an error token
    pub bad_sector: Option<u32>,
    /// Hold data-out low forever while selected
    pub stuck_busy: bool,
    /// Echo a wrong check pattern to CMD8
    pub bad_check_pattern: bool,
    /// Accept read commands but never send the data block
    pub withhold_data: bool,

    /// Commands seen, application commands carry the 0x80 flag
    pub commands: Vec<(u8, u32)>,
    pub blocks_written: usize,
    pub stop_tokens: usize,
    pub erase_count: Option<u32>,
    pub block_len: Option<u32>,
    pub clocked: usize,
    /// Bytes clocked with select deasserted before the first command
    pub idle_bytes_before_command: usize,
    pub selects: usize,
    pub deselects: usize,
    pub speeds: Vec<BusSpeed>,
    pub idled: usize,
    pub released: usize,
}

impl SimCard {
    pub fn new(kind: SimKind, sectors: usize) -> Self {
        let mut csd = [0u8; 16];
        if kind == SimKind::SdHc {
            // Version 2.00, C_SIZE 0x0F3F
            csd[0] = 0x40;
            csd[8] = 0x0F;
            csd[9] = 0x3F;
        } else {
            // Version 1.00, C_SIZE 3771, C_SIZE_MULT 7, READ_BL_LEN 10
            csd = [
                0x00, 0x26, 0x00, 0x32, 0x5F, 0x5A, 0x83, 0xAE,
                0xFE, 0xFB, 0xCF, 0xFF, 0x92, 0x80, 0x40, 0xDF,
            ];
        }

        Self {
            kind,
            selected: false,
            out: VecDeque::new(),
            busy: 0,
            frame: Vec::new(),
            block: None,
            mode: Mode::Command,
            app: false,
            idle: true,
            polls_left: 3,
            op_cond_polls: 3,
            sectors: vec![[0u8; SECTOR]; sectors],
            csd,
            reject_write_at: None,
            bad_sector: None,
            stuck_busy: false,
            bad_check_pattern: false,
            withhold_data: false,
            commands: Vec::new(),
            blocks_written: 0,
            stop_tokens: 0,
            erase_count: None,
            block_len: None,
            clocked: 0,
            idle_bytes_before_command: 0,
            selects: 0,
            deselects: 0,
            speeds: Vec::new(),
            idled: 0,
            released: 0,
        }
    }

    /// Number of op-cond polls answered with "idle" before the card is ready
    pub fn with_op_cond_polls(mut self, polls: u32) -> Self {
        self.op_cond_polls = polls;
        self.polls_left = polls;
        self
    }

    pub fn with_csd(mut self, csd: [u8; 16]) -> Self {
        self.csd = csd;
        self
    }

    pub fn sector(&self, index: u32) -> &[u8; SECTOR] {
        &self.sectors[index as usize]
    }

    pub fn fill_sector(&mut self, index: u32, data: &[u8; SECTOR]) {
        self.sectors[index as usize] = *data;
    }

    /// Indices of the commands seen, in order
    pub fn command_indices(&self) -> Vec<u8> {
        self.commands.iter().map(|&(cmd, _)| cmd).collect()
    }

    /// How many times `cmd` was seen
    pub fn count(&self, cmd: u8) -> usize {
        self.commands.iter().filter(|&&(c, _)| c == cmd).count()
    }

    /// Bus activity of any kind
    pub fn touched(&self) -> bool {
        self.clocked != 0
            || self.selects != 0
            || self.deselects != 0
            || self.idled != 0
            || self.released != 0
            || !self.speeds.is_empty()
    }

    fn idle_bit(&self) -> u8 {
        self.idle as u8
    }

    fn respond(&mut self, r1: u8, trailer: &[u8]) {
        self.out.clear();
        self.out.push_back(0xFF);
        self.out.push_back(r1);
        self.out.extend(trailer.iter().copied());
    }

    fn push_block(&mut self, sector: u32) -> bool {
        let readable = self.bad_sector != Some(sector) && (sector as usize) < self.sectors.len();
        self.out.push_back(0xFF);
        if readable {
            self.out.push_back(0xFE);
            self.out.extend(self.sectors[sector as usize].iter().copied());
            self.out.extend([0xAB, 0xCD]);
        } else {
            self.out.push_back(READ_ERROR_TOKEN);
        }
        readable
    }

    fn sector_of(&self, argument: u32) -> Option<u32> {
        if self.kind == SimKind::SdHc {
            Some(argument)
        } else if argument % SECTOR as u32 == 0 {
            Some(argument / SECTOR as u32)
        } else {
            None
        }
    }

    fn clock(&mut self, input: u8) -> u8 {
        self.clocked += 1;
        if !self.selected && self.commands.is_empty() {
            self.idle_bytes_before_command += 1;
        }
        if !self.selected || self.kind == SimKind::Dead {
            return 0xFF;
        }
        if self.stuck_busy {
            return 0x00;
        }

        let output = if let Some(byte) = self.out.pop_front() {
            byte
        } else if self.busy > 0 {
            self.busy -= 1;
            0x00
        } else if let Mode::ReadMulti { next } = self.mode {
            if self.push_block(next) {
                self.mode = Mode::ReadMulti { next: next + 1 };
            } else {
                self.mode = Mode::Command;
            }
            self.out.pop_front().unwrap_or(0xFF)
        } else {
            0xFF
        };

        self.accept(input);
        output
    }

    fn accept(&mut self, input: u8) {
        if let Some(block) = self.block.as_mut() {
            block.push(input);
            if block.len() == SECTOR + 2 {
                let block = self.block.take().unwrap_or_default();
                self.finish_block(&block);
            }
            return;
        }

        match self.mode {
            Mode::WriteSingle { .. } if input == 0xFE => {
                self.block = Some(Vec::with_capacity(SECTOR + 2));
                return;
            }
            Mode::WriteMulti { .. } if input == 0xFC => {
                self.block = Some(Vec::with_capacity(SECTOR + 2));
                return;
            }
            Mode::WriteMulti { .. } if input == 0xFD => {
                self.stop_tokens += 1;
                self.mode = Mode::Command;
                self.busy = 2;
                return;
            }
            _ => {}
        }

        if !self.frame.is_empty() {
            self.frame.push(input);
            if self.frame.len() == 6 {
                let frame = std::mem::take(&mut self.frame);
                let argument = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
                self.command(frame[0] & 0x3F, argument);
            }
        } else if input & 0xC0 == 0x40 {
            self.frame.push(input);
        }
    }

    fn finish_block(&mut self, block: &[u8]) {
        let index = self.blocks_written;
        self.blocks_written += 1;

        let sector = match self.mode {
            Mode::WriteSingle { sector } => {
                self.mode = Mode::Command;
                sector
            }
            Mode::WriteMulti { next } => {
                self.mode = Mode::WriteMulti { next: next + 1 };
                next
            }
            _ => return,
        };

        if self.reject_write_at == Some(index) || sector as usize >= self.sectors.len() {
            self.out.push_back(DATA_RES_WRITE_ERROR);
            self.busy = 1;
            return;
        }

        self.sectors[sector as usize].copy_from_slice(&block[..SECTOR]);
        // xxx0_0101: accepted, upper bits undefined
        self.out.push_back(0xE5);
        self.busy = 3;
    }

    fn op_cond_poll(&mut self) {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            self.respond(0x01, &[]);
        } else {
            self.idle = false;
            self.respond(0x00, &[]);
        }
    }

    fn command(&mut self, index: u8, argument: u32) {
        let app = std::mem::take(&mut self.app);
        let tagged = if app { index | 0x80 } else { index };
        self.commands.push((tagged, argument));

        let illegal = 0x04 | self.idle_bit();
        let sd2 = matches!(self.kind, SimKind::SdHc | SimKind::SdV2);
        let data_command = matches!(index, 9 | 17 | 18 | 24 | 25);

        if self.idle && data_command {
            self.respond(illegal, &[]);
            return;
        }

        match index {
            0 => {
                self.idle = true;
                self.polls_left = self.op_cond_polls;
                self.mode = Mode::Command;
                self.respond(0x01, &[]);
            }
            8 if sd2 => {
                let pattern = if self.bad_check_pattern { 0x55 } else { argument as u8 };
                let trailer = [0x00, 0x00, ((argument >> 8) & 0x0F) as u8, pattern];
                self.respond(self.idle_bit(), &trailer);
            }
            55 if self.kind != SimKind::Mmc => {
                self.app = true;
                self.respond(self.idle_bit(), &[]);
            }
            41 if app => self.op_cond_poll(),
            1 if self.kind == SimKind::Mmc => self.op_cond_poll(),
            58 => {
                let mut ocr = 0u8;
                if !self.idle {
                    ocr |= 0x80;
                    if self.kind == SimKind::SdHc {
                        ocr |= 0x40;
                    }
                }
                self.respond(self.idle_bit(), &[ocr, 0xFF, 0x80, 0x00]);
            }
            16 => {
                self.block_len = Some(argument);
                self.respond(self.idle_bit(), &[]);
            }
            9 => {
                let mut trailer = vec![0xFF, 0xFE];
                trailer.extend_from_slice(&self.csd);
                trailer.extend([0x12, 0x34]);
                self.respond(0x00, &trailer);
            }
            12 => {
                self.mode = Mode::Command;
                self.respond(0x00, &[]);
                self.busy = 1;
            }
            23 if app => {
                self.erase_count = Some(argument);
                self.respond(0x00, &[]);
            }
            17 | 18 if self.withhold_data => self.respond(0x00, &[]),
            17 | 18 | 24 | 25 => match self.sector_of(argument) {
                None => self.respond(0x20, &[]),
                Some(sector) => {
                    self.respond(0x00, &[]);
                    match index {
                        17 => {
                            self.out.push_back(0xFF);
                            self.push_block(sector);
                        }
                        18 => self.mode = Mode::ReadMulti { next: sector },
                        24 => self.mode = Mode::WriteSingle { sector },
                        _ => self.mode = Mode::WriteMulti { next: sector },
                    }
                }
            },
            _ => self.respond(illegal, &[]),
        }
    }
}

impl BitTransport for SimCard {
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for &byte in bytes {
            self.clock(byte);
        }
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        for byte in buffer.iter_mut() {
            *byte = self.clock(0xFF);
        }
        Ok(())
    }

    fn set_bus_speed(&mut self, speed: BusSpeed) -> Result<(), Error> {
        self.speeds.push(speed);
        Ok(())
    }
}

impl LineControl for SimCard {
    fn set_chip_select(&mut self, asserted: bool) -> Result<(), Error> {
        if asserted && !self.selected {
            self.selects += 1;
        }
        if !asserted {
            self.deselects += 1;
            self.out.clear();
            self.frame.clear();
            self.block = None;
            if matches!(self.mode, Mode::ReadMulti { .. }) {
                self.mode = Mode::Command;
            }
        }
        self.selected = asserted;
        Ok(())
    }

    fn idle_lines(&mut self) -> Result<(), Error> {
        self.idled += 1;
        self.selected = false;
        Ok(())
    }

    fn release_lines(&mut self) -> Result<(), Error> {
        self.released += 1;
        self.selected = false;
        Ok(())
    }
}
