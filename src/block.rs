//! Block device surface consumed by a filesystem layer

use crate::error::Error;

/// Size of one sector in bytes
pub const SECTOR_SIZE: usize = 512;

/// Erase block size reported to the filesystem, in sectors
pub const ERASE_BLOCK_SECTORS: u32 = 128;

/// Device status as seen by the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    NotInitialized,
    Ready,
}

/// Control requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Wait until no write is pending inside the card
    Sync,
    /// Total number of sectors
    GetSectorCount,
    /// Erase block size in sectors
    GetBlockSize,
}

impl Control {
    /// Map a raw FatFs `disk_ioctl` code
    pub fn from_code(code: u8) -> Result<Self, Error> {
        match code {
            0 => Ok(Self::Sync),
            1 => Ok(Self::GetSectorCount),
            3 => Ok(Self::GetBlockSize),
            code => Err(Error::UnsupportedControl { code }),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Sync => 0,
            Self::GetSectorCount => 1,
            Self::GetBlockSize => 3,
        }
    }
}

/// Result of a successful control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResponse {
    Done,
    SectorCount(u64),
    BlockSize(u32),
}

/// Sector-addressed storage device
///
/// Buffers passed to `read` and `write` hold whole sectors; the sector
/// count is `buffer.len() / SECTOR_SIZE`.
pub trait BlockDevice {
    /// Current status, never touches the bus
    fn status(&self) -> DiskStatus;

    /// Run the power-up handshake. Safe to call again after a failure.
    fn initialize(&mut self) -> DiskStatus;

    /// Read consecutive sectors starting at `sector`
    fn read(&mut self, sector: u32, buffer: &mut [u8]) -> Result<(), Error>;

    /// Write consecutive sectors starting at `sector`
    fn write(&mut self, sector: u32, buffer: &[u8]) -> Result<(), Error>;

    /// Miscellaneous requests
    fn control(&mut self, request: Control) -> Result<ControlResponse, Error>;

    /// Stop driving the bus lines
    fn deinitialize(&mut self) -> Result<(), Error>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn status(&self) -> DiskStatus {
        (**self).status()
    }

    fn initialize(&mut self) -> DiskStatus {
        (**self).initialize()
    }

    fn read(&mut self, sector: u32, buffer: &mut [u8]) -> Result<(), Error> {
        (**self).read(sector, buffer)
    }

    fn write(&mut self, sector: u32, buffer: &[u8]) -> Result<(), Error> {
        (**self).write(sector, buffer)
    }

    fn control(&mut self, request: Control) -> Result<ControlResponse, Error> {
        (**self).control(request)
    }

    fn deinitialize(&mut self) -> Result<(), Error> {
        (**self).deinitialize()
    }
}

/// Number of whole sectors in `len` bytes, rejecting empty or ragged buffers
pub fn sector_count(len: usize) -> Result<u32, Error> {
    if len == 0 || len % SECTOR_SIZE != 0 {
        return Err(Error::InvalidArgument);
    }
    u32::try_from(len / SECTOR_SIZE).map_err(|_| Error::InvalidArgument)
}
