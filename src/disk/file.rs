//! DOS 2 family files
//!
//! A file is a chain of data sectors, each carrying `sector_size - 3` payload
//! bytes and a trailer linking to the next.  Reads and writes address the
//! current sector by number through the sector cache on every byte, so no
//! sector contents are held across calls.

use std::collections::HashSet;
use std::io;

use log::{debug, warn};

use crate::disk::chain::{file_number, ChainFormat, Trailer};
use crate::disk::directory::{read_entry, write_entry, EntryLocation, FLAG_DOS2, FLAG_IN_USE};
use crate::disk::dos2::Volume;
use crate::disk::error::DiskError;
use crate::disk::vtoc::RESERVED_SECTOR;
use crate::disk::{FileOps, SectorNum};

enum Mode {
    Reading {
        visited_sectors: HashSet<SectorNum>,
    },
    Writing {
        entry: EntryLocation,
        sector_count: usize,
        dos2_compatible: bool,
    },
    Closed,
}

/// An open file.  Files created for output finalize their directory entry
/// when closed or dropped.
pub struct Dos2File {
    volume: Volume,
    first_sector: SectorNum,
    /// Current sector, 0 before the first byte of an empty file.
    sector: SectorNum,
    /// Payload bytes consumed (reading) or filled (writing) in `sector`.
    pos: usize,
    mode: Mode,
}

impl Dos2File {
    /// Open an existing chain for reading.
    pub(crate) fn open(volume: Volume, first_sector: SectorNum) -> Dos2File {
        let mut visited_sectors = HashSet::new();
        visited_sectors.insert(first_sector);
        Dos2File {
            volume,
            first_sector,
            sector: first_sector,
            pos: 0,
            mode: Mode::Reading { visited_sectors },
        }
    }

    /// Start writing a new file whose entry has already been claimed.  The
    /// first sector is allocated with the first byte.
    pub(crate) fn create(volume: Volume, entry: EntryLocation) -> Dos2File {
        Dos2File {
            volume,
            first_sector: 0,
            sector: 0,
            pos: 0,
            mode: Mode::Writing {
                entry,
                sector_count: 0,
                dos2_compatible: true,
            },
        }
    }

    fn payload_size(&self) -> usize {
        ChainFormat::payload_size(self.volume.disk.borrow().sector_size())
    }

    fn trailer(&self, sector: SectorNum) -> io::Result<Trailer> {
        self.volume
            .chain
            .read_trailer(&mut self.volume.disk.borrow_mut(), sector)
    }

    fn file_no(&self) -> Option<u8> {
        match self.mode {
            Mode::Writing { entry, .. } => Some(file_number(entry.index)),
            _ => None,
        }
    }

    /// Follow the current sector's link.  Returns false at the end of the
    /// chain.
    fn next_sector(&mut self) -> io::Result<bool> {
        let next = self.trailer(self.sector)?.next;
        if next == 0 {
            return Ok(false);
        }
        if next > self.volume.disk.borrow().sector_count() {
            warn!(
                "file: sector {} links to {} beyond the disk",
                self.sector, next
            );
            return Ok(false);
        }
        if let Mode::Reading {
            ref mut visited_sectors,
        } = self.mode
        {
            if !visited_sectors.insert(next) {
                return Err(DiskError::ChainLoop.into());
            }
        }
        self.sector = next;
        self.pos = 0;
        Ok(true)
    }

    /// Allocate a zeroed sector and make it current, linking the previous
    /// one to it.
    fn append_sector(&mut self) -> io::Result<()> {
        let next = self.volume.allocator.borrow_mut().alloc_sector()?;
        let file_no = self.file_no();
        {
            let mut disk = self.volume.disk.borrow_mut();
            if self.sector != 0 {
                let trailer = Trailer {
                    file_no,
                    next,
                    used: self.pos,
                };
                self.volume.chain.write_trailer(&mut disk, self.sector, &trailer)?;
            }
            disk.cache().init(next)?;
        }
        if self.first_sector == 0 {
            self.first_sector = next;
        }
        if let Mode::Writing {
            ref mut sector_count,
            ref mut dos2_compatible,
            ..
        } = self.mode
        {
            *sector_count += 1;
            if next >= RESERVED_SECTOR {
                *dos2_compatible = false;
            }
        }
        self.sector = next;
        self.pos = 0;
        Ok(())
    }
}

impl FileOps for Dos2File {
    fn eof(&mut self) -> io::Result<bool> {
        if let Mode::Reading { .. } = self.mode {
            if self.sector == 0 {
                return Ok(true);
            }
            let payload = self.payload_size();
            loop {
                if self.pos < self.trailer(self.sector)?.used.min(payload) {
                    return Ok(false);
                }
                if !self.next_sector()? {
                    return Ok(true);
                }
            }
        }
        Ok(true)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        if self.eof()? {
            return Err(DiskError::EndOfFile.into());
        }
        let byte = self
            .volume
            .disk
            .borrow_mut()
            .read_byte(self.sector, self.pos)?;
        self.pos += 1;
        Ok(byte)
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        match self.mode {
            Mode::Writing { .. } => {}
            _ => return Err(DiskError::UnsupportedOperation.into()),
        }
        if self.sector == 0 || self.pos == self.payload_size() {
            self.append_sector()?;
        }
        self.volume
            .disk
            .borrow_mut()
            .write_byte(self.sector, self.pos, byte)?;
        self.pos += 1;
        Ok(())
    }

    fn first_sector(&self) -> SectorNum {
        self.first_sector
    }

    fn close(&mut self) -> io::Result<()> {
        let (entry, sector_count, dos2_compatible) = match self.mode {
            Mode::Writing {
                entry,
                sector_count,
                dos2_compatible,
            } => (entry, sector_count, dos2_compatible),
            _ => return Ok(()),
        };
        self.mode = Mode::Closed;

        let mut disk = self.volume.disk.borrow_mut();
        if self.sector != 0 {
            let trailer = Trailer {
                file_no: Some(file_number(entry.index)),
                next: 0,
                used: self.pos,
            };
            self.volume.chain.write_trailer(&mut disk, self.sector, &trailer)?;
        }
        let mut record = read_entry(&mut disk, entry)?;
        record.flags = FLAG_IN_USE;
        if dos2_compatible || self.volume.force_dos2_flag {
            record.flags |= FLAG_DOS2;
        }
        record.sector_count = sector_count as u16;
        record.first_sector = self.first_sector as u16;
        write_entry(&mut disk, entry, &record)?;
        debug!(
            "file: closed {:?}, {} sectors from {}",
            record.name, sector_count, self.first_sector
        );
        Ok(())
    }
}

impl Drop for Dos2File {
    fn drop(&mut self) {
        let _result = self.close();
    }
}
