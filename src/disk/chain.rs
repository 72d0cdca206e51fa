use std::collections::HashSet;
use std::io;

use log::{trace, warn};

use crate::disk::container::Disk;
use crate::disk::error::DiskError;
use crate::disk::{DiskRef, SectorNum};

/// Every data sector ends with a three-byte trailer: the high link byte, the
/// low link byte, and the number of payload bytes used.
pub const TRAILER_SIZE: usize = 3;

const FILE_NUMBER_SHIFT: u8 = 2;
const FILE_NUMBER_LINK_MASK: u8 = 0x03;
const FILE_NUMBER_MASK: u8 = 0x3F;

/// The file number stamped in the trailers of the file at directory index
/// `index`.  Only six bits fit, so double density directories past entry 63
/// wrap around.
pub fn file_number(index: usize) -> u8 {
    index as u8 & FILE_NUMBER_MASK
}

/// How the high trailer byte is split between the next-sector link and the
/// owning file's directory index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainFormat {
    /// Six bits of directory index and two bits of link, so chains can only
    /// reach sector 1023.  DOS uses the index to detect lost chains.
    FileNumbered,
    /// The whole byte is the high half of the link.
    WideLink,
}

/// A decoded sector trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trailer {
    pub file_no: Option<u8>,
    /// Next sector of the chain, 0 at the end.
    pub next: SectorNum,
    pub used: usize,
}

impl ChainFormat {
    /// Payload bytes per data sector.
    #[inline]
    pub fn payload_size(sector_size: usize) -> usize {
        sector_size - TRAILER_SIZE
    }

    pub fn decode(&self, bytes: &[u8; TRAILER_SIZE]) -> Trailer {
        let (file_no, link_hi) = match self {
            ChainFormat::FileNumbered => (
                Some(bytes[0] >> FILE_NUMBER_SHIFT),
                bytes[0] & FILE_NUMBER_LINK_MASK,
            ),
            ChainFormat::WideLink => (None, bytes[0]),
        };
        Trailer {
            file_no,
            next: bytes[1] as SectorNum | (link_hi as SectorNum) << 8,
            used: bytes[2] as usize,
        }
    }

    pub fn encode(&self, trailer: &Trailer) -> [u8; TRAILER_SIZE] {
        let link_hi = (trailer.next >> 8) as u8;
        let hi = match self {
            ChainFormat::FileNumbered => {
                (trailer.file_no.unwrap_or(0) & FILE_NUMBER_MASK) << FILE_NUMBER_SHIFT
                    | link_hi & FILE_NUMBER_LINK_MASK
            }
            ChainFormat::WideLink => link_hi,
        };
        [hi, trailer.next as u8, trailer.used as u8]
    }

    /// The highest sector a link can reach.
    pub fn max_link(&self) -> SectorNum {
        match self {
            ChainFormat::FileNumbered => 0x3FF,
            ChainFormat::WideLink => 0xFFFF,
        }
    }

    pub fn read_trailer(&self, disk: &mut Disk, sector: SectorNum) -> io::Result<Trailer> {
        let offset = disk.sector_size() - TRAILER_SIZE;
        let handle = disk.cache().get(sector)?;
        let mut bytes = [0u8; TRAILER_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = disk.cache().peek(handle, offset + i)?;
        }
        Ok(self.decode(&bytes))
    }

    pub fn write_trailer(
        &self,
        disk: &mut Disk,
        sector: SectorNum,
        trailer: &Trailer,
    ) -> io::Result<()> {
        if trailer.next > self.max_link() {
            return Err(DiskError::InvalidSector.into());
        }
        let offset = disk.sector_size() - TRAILER_SIZE;
        let handle = disk.cache().get(sector)?;
        for (i, &b) in self.encode(trailer).iter().enumerate() {
            disk.cache().poke(handle, offset + i, b)?;
        }
        Ok(())
    }
}

/// One step of a chain walk: the sector visited and its trailer.
#[derive(Clone, Copy, Debug)]
pub struct ChainSector {
    pub sector: SectorNum,
    pub trailer: Trailer,
}

/// Walks a file chain from its first sector.  A link of 0, or one past the
/// end of the disk, ends the chain; revisiting a sector is an error.
pub struct ChainIterator {
    disk: DiskRef,
    format: ChainFormat,
    next_sector: Option<SectorNum>,
    visited_sectors: HashSet<SectorNum>,
}

impl ChainIterator {
    /// Create a new chain iterator starting at the specified sector.  A first
    /// sector of 0 is an empty chain.
    pub fn new(disk: DiskRef, format: ChainFormat, first_sector: SectorNum) -> ChainIterator {
        ChainIterator {
            disk,
            format,
            next_sector: if first_sector == 0 {
                None
            } else {
                Some(first_sector)
            },
            visited_sectors: HashSet::new(),
        }
    }

    /// Read the entire chain and return its sector numbers.
    pub fn sectors(self) -> io::Result<Vec<SectorNum>> {
        self.map(|r| r.map(|cs| cs.sector)).collect()
    }
}

impl Iterator for ChainIterator {
    type Item = io::Result<ChainSector>;

    fn next(&mut self) -> Option<io::Result<ChainSector>> {
        let sector = self.next_sector.take()?;

        if !self.visited_sectors.insert(sector) {
            return Some(Err(DiskError::ChainLoop.into()));
        }

        let mut disk = self.disk.borrow_mut();
        let trailer = match self.format.read_trailer(&mut disk, sector) {
            Ok(trailer) => trailer,
            Err(e) => return Some(Err(e)),
        };
        trace!("chain: sector {} -> {}", sector, trailer.next);
        if trailer.next > disk.sector_count() {
            warn!(
                "chain: sector {} links to {} beyond the disk",
                sector, trailer.next
            );
        } else if trailer.next != 0 {
            self.next_sector = Some(trailer.next);
        }

        Some(Ok(ChainSector { sector, trailer }))
    }
}

/// The byte size of a file, summed over its chain.
pub fn chain_size(
    disk: DiskRef,
    format: ChainFormat,
    first_sector: SectorNum,
) -> io::Result<usize> {
    let payload = ChainFormat::payload_size(disk.borrow().sector_size());
    ChainIterator::new(disk, format, first_sector)
        .map(|r| r.map(|cs| cs.trailer.used.min(payload)))
        .sum()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn disk() -> DiskRef {
        Rc::new(RefCell::new(Disk::new(128, 1040).unwrap()))
    }

    fn link(disk: &DiskRef, format: ChainFormat, sector: SectorNum, next: SectorNum, used: usize) {
        let trailer = Trailer {
            file_no: Some(5),
            next,
            used,
        };
        format
            .write_trailer(&mut disk.borrow_mut(), sector, &trailer)
            .unwrap();
    }

    #[test]
    fn test_trailer_layout() {
        let trailer = Trailer {
            file_no: Some(0x3F),
            next: 0x2D5,
            used: 125,
        };
        let bytes = ChainFormat::FileNumbered.encode(&trailer);
        assert_eq!(bytes, [0xFE, 0xD5, 125]);
        assert_eq!(ChainFormat::FileNumbered.decode(&bytes), trailer);

        let trailer = Trailer {
            file_no: None,
            next: 0x1234,
            used: 7,
        };
        let bytes = ChainFormat::WideLink.encode(&trailer);
        assert_eq!(bytes, [0x12, 0x34, 7]);
        assert_eq!(ChainFormat::WideLink.decode(&bytes), trailer);
    }

    #[test]
    fn test_file_number_wraps() {
        assert_eq!(file_number(5), 5);
        assert_eq!(file_number(63), 63);
        assert_eq!(file_number(64), 0);
        assert_eq!(file_number(127), 63);
        let trailer = Trailer {
            file_no: Some(0x41),
            next: 0x105,
            used: 1,
        };
        assert_eq!(ChainFormat::FileNumbered.encode(&trailer), [0x05, 0x05, 1]);
    }

    #[test]
    fn test_link_out_of_reach() {
        let disk = disk();
        let trailer = Trailer {
            file_no: Some(1),
            next: 1030,
            used: 125,
        };
        let error = ChainFormat::FileNumbered
            .write_trailer(&mut disk.borrow_mut(), 10, &trailer)
            .unwrap_err();
        assert!(error == DiskError::InvalidSector);
        ChainFormat::WideLink
            .write_trailer(&mut disk.borrow_mut(), 10, &trailer)
            .unwrap();
    }

    #[test]
    fn test_chain_walk() {
        let disk = disk();
        let format = ChainFormat::FileNumbered;
        link(&disk, format, 10, 20, 125);
        link(&disk, format, 20, 900, 125);
        link(&disk, format, 900, 0, 17);
        let sectors = ChainIterator::new(disk.clone(), format, 10)
            .sectors()
            .unwrap();
        assert_eq!(sectors, vec![10, 20, 900]);
        assert_eq!(chain_size(disk.clone(), format, 10).unwrap(), 267);
        assert_eq!(chain_size(disk, format, 0).unwrap(), 0);
    }

    #[test]
    fn test_chain_loop() {
        let disk = disk();
        let format = ChainFormat::WideLink;
        link(&disk, format, 10, 11, 125);
        link(&disk, format, 11, 10, 125);
        let error = ChainIterator::new(disk, format, 10).sectors().unwrap_err();
        assert!(error == DiskError::ChainLoop);
    }

    #[test]
    fn test_link_beyond_disk_ends_chain() {
        let disk = disk();
        let format = ChainFormat::WideLink;
        link(&disk, format, 10, 2000, 40);
        let sectors = ChainIterator::new(disk.clone(), format, 10)
            .sectors()
            .unwrap();
        assert_eq!(sectors, vec![10]);
        assert_eq!(chain_size(disk, format, 10).unwrap(), 40);
    }
}
