/// Command, token and register definitions for MMC/SD cards in SPI mode

/// Card commands
///
/// Application commands (ACMD<n>) carry [`Command::APP_FLAG`] in their
/// discriminant and are sent as CMD55 followed by CMD<n>.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// CMD0 GO_IDLE_STATE
    GoIdleState = 0,
    /// CMD1 SEND_OP_COND (MMC)
    SendOpCond = 1,
    /// CMD8 SEND_IF_COND
    SendIfCond = 8,
    /// CMD9 SEND_CSD
    SendCsd = 9,
    /// CMD12 STOP_TRANSMISSION
    StopTransmission = 12,
    /// CMD16 SET_BLOCKLEN
    SetBlockLen = 16,
    /// CMD17 READ_SINGLE_BLOCK
    ReadSingleBlock = 17,
    /// CMD18 READ_MULTIPLE_BLOCK
    ReadMultipleBlock = 18,
    /// CMD24 WRITE_BLOCK
    WriteBlock = 24,
    /// CMD25 WRITE_MULTIPLE_BLOCK
    WriteMultipleBlock = 25,
    /// CMD55 APP_CMD
    AppCmd = 55,
    /// CMD58 READ_OCR
    ReadOcr = 58,
    /// ACMD23 SET_WR_BLK_ERASE_COUNT (SD only)
    SetWrBlkEraseCount = 0x80 | 23,
    /// ACMD41 SD_SEND_OP_COND (SD only)
    SdSendOpCond = 0x80 | 41,
}

impl Command {
    pub const APP_FLAG: u8 = 0x80;

    /// Raw value including the application flag
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Command index as sent on the wire (0..=63)
    pub fn index(self) -> u8 {
        self.bits() & 0x3F
    }

    /// Whether this command needs the APP_CMD prefix
    pub fn is_app(self) -> bool {
        self.bits() & Self::APP_FLAG != 0
    }

    /// CRC/stop byte for this command
    ///
    /// Only CMD0 and CMD8 are sent before the card has switched to SPI mode
    /// and stopped checking CRC. Their arguments are fixed, so the CRC is too.
    pub fn crc(self) -> u8 {
        match self {
            Self::GoIdleState => 0x95,
            Self::SendIfCond => 0x87,
            _ => 0x01,
        }
    }
}

/// A 6-byte command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame([u8; 6]);

impl CommandFrame {
    pub fn new(command: Command, argument: u32) -> Self {
        let mut frame = [0u8; 6];
        frame[0] = 0x40 | command.index();
        frame[1..5].copy_from_slice(&argument.to_be_bytes());
        frame[5] = command.crc();
        Self(frame)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

/// Argument of CMD8: 2.7-3.6 V supply, check pattern 0xAA
pub const IF_COND_ARGUMENT: u32 = 0x1AA;

/// High capacity support bit in the ACMD41 argument
pub const ACMD41_HCS: u32 = 1 << 30;

/// Block length every card is configured for
pub const BLOCK_LEN: u32 = 512;

/// R1 value once the card has left idle state without errors
pub const R1_READY: u8 = 0x00;

/// R1 value while the card is still in idle state
pub const R1_IDLE: u8 = 0x01;

/// Pseudo response meaning the transport failed before the command went out
pub const R1_NO_RESPONSE: u8 = 0xFF;

/// Data tokens
pub mod token {
    /// Start of a single block read/write, or each block of a multi-block read
    pub const START_BLOCK: u8 = 0xFE;
    /// Start of each block of a multi-block write
    pub const START_MULTI_WRITE: u8 = 0xFC;
    /// End of a multi-block write
    pub const STOP_TRAN: u8 = 0xFD;
    /// Mask for the status bits of a data response token
    pub const DATA_RES_MASK: u8 = 0x1F;
    /// Data accepted
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
}

bitflags::bitflags! {
    /// R1 response flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct R1: u8 {
        const IDLE            = 1 << 0;
        const ERASE_RESET     = 1 << 1;
        const ILLEGAL_COMMAND = 1 << 2;
        const CRC_ERROR       = 1 << 3;
        const ERASE_SEQUENCE  = 1 << 4;
        const ADDRESS_ERROR   = 1 << 5;
        const PARAMETER_ERROR = 1 << 6;
    }
}

impl R1 {
    /// Decode a response byte, `None` if the start bit is set (no response)
    pub fn from_response(byte: u8) -> Option<Self> {
        if byte & 0x80 != 0 {
            None
        } else {
            Some(Self::from_bits_truncate(byte))
        }
    }

    /// Check if any error flag is set
    pub fn has_error(&self) -> bool {
        self.intersects(!Self::IDLE)
    }
}

bitflags::bitflags! {
    /// Detected card type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CardType: u8 {
        const MMC   = 1 << 0;
        const SD1   = 1 << 1;
        const SD2   = 1 << 2;
        /// Sector (LBA) addressing instead of byte addressing
        const BLOCK = 1 << 3;
        const SDC   = Self::SD1.bits() | Self::SD2.bits();
    }
}

impl CardType {
    /// Whether the card uses sector addresses
    pub fn is_block_addressed(&self) -> bool {
        self.contains(Self::BLOCK)
    }

    /// Whether the card is any SD variant
    pub fn is_sd(&self) -> bool {
        self.intersects(Self::SDC)
    }

    /// Translate a sector number into a command argument
    ///
    /// `None` when a byte-addressed card cannot reach the sector.
    pub fn address(&self, sector: u32) -> Option<u32> {
        if self.is_block_addressed() {
            Some(sector)
        } else {
            sector.checked_mul(BLOCK_LEN)
        }
    }
}

/// OCR register bits (first byte of the 4-byte R3 trailer)
pub mod ocr {
    /// Card power up status, set once initialization completed
    pub const POWER_UP: u8 = 0x80;
    /// Card capacity status
    pub const CCS: u8 = 0x40;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_bits() {
        assert_eq!(Command::SdSendOpCond.index(), 41);
        assert!(Command::SdSendOpCond.is_app());
        assert_eq!(Command::SetWrBlkEraseCount.index(), 23);
        assert!(!Command::ReadOcr.is_app());
        assert_eq!(Command::AppCmd.index(), 55);
    }

    #[test]
    fn test_go_idle_frame() {
        let frame = CommandFrame::new(Command::GoIdleState, 0);
        assert_eq!(frame.as_bytes(), &[0x40, 0x00, 0x00, 0x00, 0x00, 0x95]);
    }

    #[test]
    fn test_if_cond_frame() {
        let frame = CommandFrame::new(Command::SendIfCond, IF_COND_ARGUMENT);
        assert_eq!(frame.as_bytes(), &[0x48, 0x00, 0x00, 0x01, 0xAA, 0x87]);
    }

    #[test]
    fn test_frame_argument_big_endian() {
        let frame = CommandFrame::new(Command::ReadSingleBlock, 0x1234_5678);
        assert_eq!(frame.as_bytes(), &[0x51, 0x12, 0x34, 0x56, 0x78, 0x01]);

        let frame = CommandFrame::new(Command::SdSendOpCond, ACMD41_HCS);
        assert_eq!(frame.as_bytes(), &[0x69, 0x40, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_r1_decode() {
        assert_eq!(R1::from_response(0xFF), None);
        assert_eq!(R1::from_response(0x01), Some(R1::IDLE));
        assert!(!R1::IDLE.has_error());
        assert!(R1::from_response(0x05).unwrap().has_error());
    }

    #[test]
    fn test_card_type_addressing() {
        let sdhc = CardType::SD2 | CardType::BLOCK;
        assert_eq!(sdhc.address(100), Some(100));
        assert_eq!(sdhc.address(0x0080_0000), Some(0x0080_0000));
        assert!(sdhc.is_sd());

        let mmc = CardType::MMC;
        assert_eq!(mmc.address(100), Some(51_200));
        assert_eq!(mmc.address(0x007F_FFFF), Some(0xFFFF_FE00));
        assert_eq!(mmc.address(0x0080_0000), None);
        assert!(!mmc.is_sd());
    }
}
