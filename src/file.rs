//! Sector-aligned `std::io` adapter over a [`BlockDevice`]
//!
//! Only whole sectors move: the position must sit on a sector boundary and
//! every non-empty buffer must hold at least one sector. Longer buffers are
//! cut down to whole sectors and the returned byte count says how much
//! moved. Empty buffers move nothing and always succeed.

use std::io::{self, Read, Seek, SeekFrom, Write};

use log::{debug, warn};

use crate::block::{BlockDevice, Control, ControlResponse, DiskStatus, SECTOR_SIZE};
use crate::error::Error;

const SECTOR: u64 = SECTOR_SIZE as u64;

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::UnalignedAccess => io::ErrorKind::Unsupported,
            Error::InvalidArgument | Error::UnsupportedControl { .. } => io::ErrorKind::InvalidInput,
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::NotReady => io::ErrorKind::NotConnected,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

/// Open handle on a block device
pub struct SdFile<D: BlockDevice> {
    device: D,
    position: u64,
    open: bool,
}

impl<D: BlockDevice> SdFile<D> {
    /// Initialize `device` and open it at position 0
    pub fn open(mut device: D) -> Result<Self, Error> {
        if device.initialize() != DiskStatus::Ready {
            warn!("Cannot open device: initialization failed");
            return Err(Error::InitializationFailed);
        }
        Ok(Self {
            device,
            position: 0,
            open: true,
        })
    }

    /// Byte position of the next transfer
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn device(&mut self) -> &mut D {
        &mut self.device
    }

    /// Forward a control request to the device
    pub fn ioctl(&mut self, request: Control) -> Result<ControlResponse, Error> {
        self.device.control(request)
    }

    /// Capacity in bytes
    pub fn len(&mut self) -> Result<u64, Error> {
        match self.device.control(Control::GetSectorCount)? {
            ControlResponse::SectorCount(sectors) => Ok(sectors * SECTOR),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Deinitialize the device
    pub fn close(mut self) -> Result<(), Error> {
        self.open = false;
        self.device.deinitialize()
    }

    /// First sector and byte length of a transfer of up to `len` bytes
    fn span(&self, len: usize) -> Result<(u32, usize), Error> {
        if self.position % SECTOR != 0 {
            return Err(Error::UnalignedAccess);
        }
        if len < SECTOR_SIZE {
            return Err(Error::UnalignedAccess);
        }
        let sector = u32::try_from(self.position / SECTOR).map_err(|_| Error::InvalidArgument)?;
        Ok((sector, len - len % SECTOR_SIZE))
    }
}

impl<D: BlockDevice> Read for SdFile<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (sector, len) = self.span(buf.len())?;
        self.device.read(sector, &mut buf[..len])?;
        self.position += len as u64;
        Ok(len)
    }
}

impl<D: BlockDevice> Write for SdFile<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (sector, len) = self.span(buf.len())?;
        self.device.write(sector, &buf[..len])?;
        self.position += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.device.control(Control::Sync)?;
        Ok(())
    }
}

impl<D: BlockDevice> Seek for SdFile<D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(offset) => {
                self.position = offset;
                return Ok(offset);
            }
            SeekFrom::Current(offset) => (self.position, offset),
            SeekFrom::End(offset) => (self.len()?, offset),
        };

        let position = base
            .checked_add_signed(offset)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        self.position = position;
        Ok(position)
    }
}

impl<D: BlockDevice> Drop for SdFile<D> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.device.deinitialize() {
                debug!("Deinitialize on drop failed: {e}");
            }
        }
    }
}
