//! SpartaDOS, read only.
//!
//! Files are described by sector maps rather than chains: each map sector
//! holds the next and previous map sector numbers followed by the data sector
//! numbers, all as little-endian words.  Directories are files of 23-byte
//! entries whose first entry is a header giving the directory's byte length.

use std::collections::HashSet;
use std::io;

use log::debug;

use crate::atascii::{AtariName, FILENAME_SIZE};
use crate::disk::error::DiskError;
use crate::disk::{Directory, DiskRef, FileOps, Filesystem, Property, SectorNum};

const VOLUME_SECTOR: SectorNum = 1;
const VOLUME_DIRECTORY_MAP_OFFSET: usize = 0x09;
const VOLUME_TOTAL_OFFSET: usize = 0x0B;
const VOLUME_FREE_OFFSET: usize = 0x0D;
const VOLUME_AUTOEXEC_OFFSET: usize = 0x28;

const MAP_NEXT_OFFSET: usize = 0;
const MAP_DATA_OFFSET: usize = 4;

pub const ENTRY_SIZE: usize = 23;
const ENTRY_FLAGS_OFFSET: usize = 0;
const ENTRY_MAP_OFFSET: usize = 1;
const ENTRY_SIZE_OFFSET: usize = 3;
const ENTRY_NAME_OFFSET: usize = 6;
const ENTRY_DATE_OFFSET: usize = 17;
const ENTRY_TIME_OFFSET: usize = 20;

const FLAG_END: u8 = 0x00;
const FLAG_IN_USE: u8 = 0x08;
const FLAG_DELETED: u8 = 0x10;
const FLAG_DIRECTORY: u8 = 0x20;

static PROPERTIES: [Property; 1] = [Property {
    name: "NAME",
    sector: VOLUME_SECTOR,
    offset: 0x16,
    size: 8,
}];

pub struct SpartaDos {
    disk: DiskRef,
    directory_map: SectorNum,
}

impl SpartaDos {
    pub fn new(disk: DiskRef) -> io::Result<SpartaDos> {
        let (directory_map, total) = {
            let mut d = disk.borrow_mut();
            (
                d.read_word(VOLUME_SECTOR, VOLUME_DIRECTORY_MAP_OFFSET)? as SectorNum,
                d.read_word(VOLUME_SECTOR, VOLUME_TOTAL_OFFSET)?,
            )
        };
        debug!(
            "sparta: {} sectors, root directory map at {}",
            total, directory_map
        );
        Ok(SpartaDos {
            disk,
            directory_map,
        })
    }

    /// Total sectors as recorded in the volume header.
    pub fn total_sector_count(&self) -> io::Result<usize> {
        Ok(self
            .disk
            .borrow_mut()
            .read_word(VOLUME_SECTOR, VOLUME_TOTAL_OFFSET)? as usize)
    }
}

impl Filesystem for SpartaDos {
    fn name(&self) -> &str {
        "sparta"
    }

    fn disk(&self) -> DiskRef {
        self.disk.clone()
    }

    fn properties(&self) -> &'static [Property] {
        &PROPERTIES
    }

    fn free_sector_count(&self) -> io::Result<usize> {
        Ok(self
            .disk
            .borrow_mut()
            .read_word(VOLUME_SECTOR, VOLUME_FREE_OFFSET)? as usize)
    }

    fn get_dos_first_sector(&self) -> io::Result<SectorNum> {
        Ok(self
            .disk
            .borrow_mut()
            .read_word(VOLUME_SECTOR, VOLUME_AUTOEXEC_OFFSET)? as SectorNum)
    }

    fn set_dos_first_sector(&mut self, sector: SectorNum) -> io::Result<()> {
        self.disk
            .borrow_mut()
            .write_word(VOLUME_SECTOR, VOLUME_AUTOEXEC_OFFSET, sector as u16)
    }

    fn root_dir(&self) -> io::Result<Box<dyn Directory>> {
        Ok(Box::new(SpartaDir::open(
            self.disk.clone(),
            self.directory_map,
        )?))
    }

    fn create_file(&mut self, _name: &AtariName) -> io::Result<Box<dyn FileOps>> {
        Err(DiskError::UnsupportedOperation.into())
    }
}

/// A file read through its sector maps.  The length comes from the
/// directory entry, since data sectors carry no byte counts.
pub struct SpartaFile {
    disk: DiskRef,
    first_map: SectorNum,
    map: SectorNum,
    map_offset: usize,
    visited_maps: HashSet<SectorNum>,
    sector: SectorNum,
    pos: usize,
    size: usize,
    byte_pos: usize,
}

impl SpartaFile {
    fn new(disk: DiskRef, first_map: SectorNum, size: usize) -> SpartaFile {
        let sector_size = disk.borrow().sector_size();
        let mut visited_maps = HashSet::new();
        visited_maps.insert(first_map);
        SpartaFile {
            disk,
            first_map,
            map: first_map,
            // The first advance moves to the first data word.
            map_offset: MAP_DATA_OFFSET - 2,
            visited_maps,
            sector: 0,
            pos: sector_size,
            size,
            byte_pos: 0,
        }
    }

    /// The next data sector from the maps, or 0 when they run out.
    fn next_sector(&mut self) -> io::Result<SectorNum> {
        if self.map == 0 {
            return Ok(0);
        }
        let mut disk = self.disk.borrow_mut();
        self.map_offset += 2;
        if self.map_offset >= disk.sector_size() {
            let next_map = disk.read_word(self.map, MAP_NEXT_OFFSET)? as SectorNum;
            if next_map == 0 {
                self.map = 0;
                return Ok(0);
            }
            if !self.visited_maps.insert(next_map) {
                return Err(DiskError::ChainLoop.into());
            }
            self.map = next_map;
            self.map_offset = MAP_DATA_OFFSET;
        }
        Ok(disk.read_word(self.map, self.map_offset)? as SectorNum)
    }
}

impl FileOps for SpartaFile {
    fn eof(&mut self) -> io::Result<bool> {
        Ok(self.byte_pos >= self.size)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        if self.byte_pos >= self.size {
            return Err(DiskError::EndOfFile.into());
        }
        let sector_size = self.disk.borrow().sector_size();
        if self.pos == sector_size {
            let next = self.next_sector()?;
            if next == 0 {
                return Err(DiskError::EndOfFile.into());
            }
            self.sector = next;
            self.pos = 0;
        }
        let byte = self.disk.borrow_mut().read_byte(self.sector, self.pos)?;
        self.pos += 1;
        self.byte_pos += 1;
        Ok(byte)
    }

    fn write_byte(&mut self, _byte: u8) -> io::Result<()> {
        Err(DiskError::UnsupportedOperation.into())
    }

    fn first_sector(&self) -> SectorNum {
        self.first_map
    }
}

/// A cursor over a SpartaDOS directory.
pub struct SpartaDir {
    disk: DiskRef,
    file: SpartaFile,
    entry: [u8; ENTRY_SIZE],
    at_end: bool,
}

impl SpartaDir {
    fn open(disk: DiskRef, map: SectorNum) -> io::Result<SpartaDir> {
        let mut dir = SpartaDir {
            disk: disk.clone(),
            file: SpartaFile::new(disk, map, usize::MAX),
            entry: [0u8; ENTRY_SIZE],
            at_end: false,
        };
        // The header entry's size bounds the rest.
        dir.load()?;
        if !dir.at_end {
            dir.file.size = entry_size(&dir.entry);
            dir.load()?;
        }
        Ok(dir)
    }

    fn load(&mut self) -> io::Result<()> {
        if self.file.eof()? {
            self.at_end = true;
            return Ok(());
        }
        match self.file.read_bytes(&mut self.entry) {
            Ok(()) => {}
            Err(ref e) if *e == DiskError::EndOfFile => {
                self.at_end = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if self.entry[ENTRY_FLAGS_OFFSET] == FLAG_END {
            self.at_end = true;
        }
        Ok(())
    }

    fn flags(&self) -> u8 {
        self.entry[ENTRY_FLAGS_OFFSET]
    }

    pub fn is_in_use(&self) -> bool {
        self.flags() & FLAG_IN_USE != 0
    }

    /// Day, month, year.
    pub fn date(&self) -> (u8, u8, u8) {
        let d = &self.entry[ENTRY_DATE_OFFSET..ENTRY_DATE_OFFSET + 3];
        (d[0], d[1], d[2])
    }

    /// Hour, minute, second.
    pub fn time(&self) -> (u8, u8, u8) {
        let t = &self.entry[ENTRY_TIME_OFFSET..ENTRY_TIME_OFFSET + 3];
        (t[0], t[1], t[2])
    }
}

fn entry_size(entry: &[u8; ENTRY_SIZE]) -> usize {
    entry[ENTRY_SIZE_OFFSET] as usize
        | (entry[ENTRY_SIZE_OFFSET + 1] as usize) << 8
        | (entry[ENTRY_SIZE_OFFSET + 2] as usize) << 16
}

impl Directory for SpartaDir {
    fn at_end(&self) -> bool {
        self.at_end
    }

    fn next(&mut self) -> io::Result<()> {
        if !self.at_end {
            self.load()?;
        }
        Ok(())
    }

    fn raw_name(&self) -> AtariName {
        AtariName::from_bytes(&self.entry[ENTRY_NAME_OFFSET..ENTRY_NAME_OFFSET + FILENAME_SIZE])
    }

    fn sec_size(&self) -> usize {
        let sector_size = self.disk.borrow().sector_size();
        (entry_size(&self.entry) + sector_size - 1) / sector_size
    }

    fn size(&self) -> io::Result<usize> {
        Ok(entry_size(&self.entry))
    }

    fn first_sector(&self) -> SectorNum {
        self.entry[ENTRY_MAP_OFFSET] as SectorNum
            | (self.entry[ENTRY_MAP_OFFSET + 1] as SectorNum) << 8
    }

    fn open_file(&self) -> io::Result<Box<dyn FileOps>> {
        if self.at_end || self.is_dir() {
            return Err(DiskError::MissingFile.into());
        }
        Ok(Box::new(SpartaFile::new(
            self.disk.clone(),
            self.first_sector(),
            entry_size(&self.entry),
        )))
    }

    fn create_file(&mut self, _name: &AtariName) -> io::Result<Box<dyn FileOps>> {
        Err(DiskError::UnsupportedOperation.into())
    }

    fn is_deleted(&self) -> bool {
        self.flags() & FLAG_DELETED != 0
    }

    fn is_dir(&self) -> bool {
        self.flags() & FLAG_DIRECTORY != 0
    }

    fn open_dir(&self) -> io::Result<Box<dyn Directory>> {
        if self.at_end || !self.is_dir() {
            return Err(DiskError::NotADirectory.into());
        }
        Ok(Box::new(SpartaDir::open(
            self.disk.clone(),
            self.first_sector(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::disk::{detect, Disk};

    const ROOT_MAP: SectorNum = 10;
    const ROOT_DATA: SectorNum = 11;
    const SUB_MAP: SectorNum = 20;
    const SUB_DATA: SectorNum = 21;
    const BIG_MAPS: [SectorNum; 2] = [30, 31];
    const BIG_FIRST_DATA: SectorNum = 100;
    const BIG_SECTORS: usize = 64;
    const BIG_SIZE: usize = 63 * 128 + 5;

    fn put_entry(
        disk: &mut Disk,
        sector: SectorNum,
        index: usize,
        flags: u8,
        map: u16,
        size: usize,
        name: &[u8],
    ) {
        let offset = index * ENTRY_SIZE;
        let mut entry = [0u8; ENTRY_SIZE];
        entry[ENTRY_FLAGS_OFFSET] = flags;
        entry[ENTRY_MAP_OFFSET] = map as u8;
        entry[ENTRY_MAP_OFFSET + 1] = (map >> 8) as u8;
        entry[ENTRY_SIZE_OFFSET] = size as u8;
        entry[ENTRY_SIZE_OFFSET + 1] = (size >> 8) as u8;
        entry[ENTRY_SIZE_OFFSET + 2] = (size >> 16) as u8;
        entry[ENTRY_NAME_OFFSET..ENTRY_NAME_OFFSET + FILENAME_SIZE]
            .copy_from_slice(AtariName::from_bytes(name).as_bytes());
        entry[ENTRY_DATE_OFFSET..ENTRY_DATE_OFFSET + 3].copy_from_slice(&[24, 12, 88]);
        entry[ENTRY_TIME_OFFSET..ENTRY_TIME_OFFSET + 3].copy_from_slice(&[13, 45, 0]);
        for (i, &b) in entry.iter().enumerate() {
            disk.write_byte(sector, offset + i, b).unwrap();
        }
    }

    fn big_byte(i: usize) -> u8 {
        (i % 253) as u8
    }

    /// A small volume: a root directory holding a file that spans two
    /// sector maps, a deleted entry, and a subdirectory with one empty file.
    fn sample() -> DiskRef {
        let mut disk = Disk::new(128, 720).unwrap();
        for &(offset, value) in &[(0x06, 0x4C), (0x07, 0x80), (0x08, 0x30)] {
            disk.write_byte(1, offset, value).unwrap();
        }
        disk.write_word(1, VOLUME_DIRECTORY_MAP_OFFSET, ROOT_MAP as u16).unwrap();
        disk.write_word(1, VOLUME_TOTAL_OFFSET, 720).unwrap();
        disk.write_word(1, VOLUME_FREE_OFFSET, 555).unwrap();

        disk.write_word(ROOT_MAP, MAP_DATA_OFFSET, ROOT_DATA as u16).unwrap();
        put_entry(&mut disk, ROOT_DATA, 0, 0x28, 0, 4 * ENTRY_SIZE, b"MAIN");
        put_entry(
            &mut disk,
            ROOT_DATA,
            1,
            FLAG_IN_USE,
            BIG_MAPS[0] as u16,
            BIG_SIZE,
            b"BIG     DAT",
        );
        put_entry(&mut disk, ROOT_DATA, 2, FLAG_DELETED, 0, 0, b"GONE");
        put_entry(
            &mut disk,
            ROOT_DATA,
            3,
            FLAG_IN_USE | FLAG_DIRECTORY,
            SUB_MAP as u16,
            2 * ENTRY_SIZE,
            b"SUB",
        );
        // Past the header's size; never visible.
        put_entry(&mut disk, ROOT_DATA, 4, FLAG_IN_USE, 0, 0, b"HIDDEN");

        disk.write_word(SUB_MAP, MAP_DATA_OFFSET, SUB_DATA as u16).unwrap();
        put_entry(
            &mut disk,
            SUB_DATA,
            0,
            0x28,
            ROOT_MAP as u16,
            2 * ENTRY_SIZE,
            b"SUB",
        );
        put_entry(&mut disk, SUB_DATA, 1, FLAG_IN_USE, 0, 0, b"EMPTY");

        // 62 data words fit in the first map; the rest go in the second.
        disk.write_word(BIG_MAPS[0], MAP_NEXT_OFFSET, BIG_MAPS[1] as u16).unwrap();
        disk.write_word(BIG_MAPS[1], 2, BIG_MAPS[0] as u16).unwrap();
        for n in 0..BIG_SECTORS {
            let (map, slot) = if n < 62 {
                (BIG_MAPS[0], n)
            } else {
                (BIG_MAPS[1], n - 62)
            };
            let sector = BIG_FIRST_DATA + n;
            disk.write_word(map, MAP_DATA_OFFSET + 2 * slot, sector as u16).unwrap();
            for pos in 0..128 {
                disk.write_byte(sector, pos, big_byte(n * 128 + pos)).unwrap();
            }
        }
        Rc::new(RefCell::new(disk))
    }

    #[test]
    fn test_volume() {
        let mut fs = detect(sample()).unwrap();
        assert_eq!(fs.name(), "sparta");
        assert_eq!(fs.free_sector_count().unwrap(), 555);
        let name = fs.find_property("NAME").unwrap();
        fs.set_property(name, "ARCHIVE").unwrap();
        assert_eq!(fs.get_property(name).unwrap(), "ARCHIVE ");
        fs.set_dos_first_sector(0x1234).unwrap();
        assert_eq!(fs.get_dos_first_sector().unwrap(), 0x1234);
        let error = fs.create_file(&"NEW".parse().unwrap()).err().unwrap();
        assert!(error == DiskError::UnsupportedOperation);
    }

    #[test]
    fn test_directory_listing() {
        let fs = SpartaDos::new(sample()).unwrap();
        assert_eq!(fs.total_sector_count().unwrap(), 720);
        let mut root = fs.root_dir().unwrap();
        assert_eq!(root.name(), "BIG.DAT");
        assert_eq!(root.size().unwrap(), BIG_SIZE);
        assert_eq!(root.sec_size(), BIG_SECTORS);
        assert_eq!(root.first_sector(), BIG_MAPS[0]);
        root.next().unwrap();
        assert!(root.is_deleted());
        root.next().unwrap();
        assert!(root.is_dir());
        let mut sub = root.open_dir().unwrap();
        assert_eq!(sub.names().unwrap(), vec!["EMPTY"]);
        root.next().unwrap();
        assert!(root.at_end());

        let mut root = fs.root_dir().unwrap();
        assert_eq!(root.names().unwrap(), vec!["BIG.DAT", "SUB"]);
    }

    #[test]
    fn test_entry_timestamp() {
        let fs = SpartaDos::new(sample()).unwrap();
        let dir = SpartaDir::open(fs.disk(), ROOT_MAP).unwrap();
        assert!(dir.is_in_use());
        assert_eq!(dir.date(), (24, 12, 88));
        assert_eq!(dir.time(), (13, 45, 0));
    }

    #[test]
    fn test_read_across_maps() {
        let fs = SpartaDos::new(sample()).unwrap();
        let root = fs.root_dir().unwrap();
        let mut file = root.open_file().unwrap();
        let data = file.read_to_vec().unwrap();
        assert_eq!(data.len(), BIG_SIZE);
        assert!(data.iter().enumerate().all(|(i, &b)| b == big_byte(i)));
        assert!(file.read_byte().unwrap_err() == DiskError::EndOfFile);
        assert!(file.write_byte(0).unwrap_err() == DiskError::UnsupportedOperation);
    }

    #[test]
    fn test_truncated_map() {
        let disk = sample();
        // Cut the second map out of the chain.
        disk.borrow_mut()
            .write_word(BIG_MAPS[0], MAP_NEXT_OFFSET, 0)
            .unwrap();
        let fs = SpartaDos::new(disk).unwrap();
        let mut file = fs.root_dir().unwrap().open_file().unwrap();
        let error = file.read_to_vec().unwrap_err();
        assert!(error == DiskError::EndOfFile);
    }
}
