/// Card-Specific Data register decoding
///
/// Only the fields needed for the capacity are extracted. The two layouts
/// share the version field in the top two bits of byte 0 and place the
/// device size inside the big-endian word at bytes 6..10.

use crate::error::Error;

/// CSD structure version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsdVersion {
    /// Version 1.00: standard capacity SD and MMC
    V1,
    /// Version 2.00: high capacity SD
    V2,
}

/// Raw 16-byte CSD register as read from the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csd {
    raw: [u8; 16],
}

impl Csd {
    pub const LEN: usize = 16;

    pub fn new(raw: [u8; 16]) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &[u8; 16] {
        &self.raw
    }

    /// Structure version from bits 127:126
    pub fn version(&self) -> Result<CsdVersion, Error> {
        match self.raw[0] >> 6 {
            0 => Ok(CsdVersion::V1),
            1 => Ok(CsdVersion::V2),
            version => Err(Error::UnknownCsdVersion { version }),
        }
    }

    fn size_word(&self) -> u32 {
        u32::from_be_bytes([self.raw[6], self.raw[7], self.raw[8], self.raw[9]])
    }

    /// C_SIZE field: 22 bits for version 2.00, 12 bits for version 1.00
    pub fn device_size(&self) -> Result<u32, Error> {
        Ok(match self.version()? {
            CsdVersion::V2 => self.size_word() & 0x003F_FFFF,
            CsdVersion::V1 => (self.size_word() >> 14) & 0x0FFF,
        })
    }

    /// READ_BL_LEN, log2 of the maximum read block length (version 1.00)
    pub fn read_block_len_exp(&self) -> u8 {
        self.raw[5] & 0x0F
    }

    /// C_SIZE_MULT, log2 of the size multiplier minus 2 (version 1.00)
    pub fn size_multiplier(&self) -> u8 {
        ((u16::from_be_bytes([self.raw[9], self.raw[10]]) >> 7) & 0x7) as u8
    }

    /// Total number of 512-byte sectors
    pub fn sector_count(&self) -> Result<u64, Error> {
        let blocks = self.device_size()? as u64 + 1;
        match self.version()? {
            // 512 KiB units
            CsdVersion::V2 => Ok(blocks << 10),
            CsdVersion::V1 => {
                // bytes = blocks * 2^(C_SIZE_MULT + 2) * 2^READ_BL_LEN
                let shift = self.size_multiplier() as u32 + 2 + self.read_block_len_exp() as u32;
                Ok(if shift >= 9 {
                    blocks << (shift - 9)
                } else {
                    blocks >> (9 - shift)
                })
            }
        }
    }
}
