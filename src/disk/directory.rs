//! DOS 2 family directories
//!
//! A directory is a run of eight sectors packed with 16-byte entries: eight
//! to a single density sector and sixteen to a double density one, so a
//! directory holds 64 or 128 entries.  The scan stops at the first never-used
//! entry.

use std::fmt;
use std::io;

use log::debug;

use crate::atascii::{AtariName, FILENAME_SIZE};
use crate::disk::chain::chain_size;
use crate::disk::container::Disk;
use crate::disk::dos2::Volume;
use crate::disk::error::DiskError;
use crate::disk::file::Dos2File;
use crate::disk::{Directory, FileOps, SectorNum};

pub const FIRST_DIRECTORY_SECTOR: SectorNum = 361;
pub const DIRECTORY_SECTOR_COUNT: usize = 8;
pub const ENTRY_SIZE: usize = 16;

/// Entries in one directory sector.
#[inline]
pub fn entries_per_sector(sector_size: usize) -> usize {
    sector_size / ENTRY_SIZE
}

/// Entries in a whole directory.
#[inline]
pub fn entry_count(sector_size: usize) -> usize {
    DIRECTORY_SECTOR_COUNT * entries_per_sector(sector_size)
}

pub const FLAG_NEVER_USED: u8 = 0x00;
pub const FLAG_DELETED: u8 = 0x80;
pub const FLAG_IN_USE: u8 = 0x40;
pub const FLAG_LOCKED: u8 = 0x20;
/// MyDOS subdirectory.
pub const FLAG_DIRECTORY: u8 = 0x10;
/// The file was written by DOS 2 (or could have been: no sector above 719).
pub const FLAG_DOS2: u8 = 0x02;
/// Open for output; cleared when the file is closed.
pub const FLAG_OPENED: u8 = 0x01;

const ENTRY_FLAGS_OFFSET: usize = 0x00;
const ENTRY_SECTOR_COUNT_OFFSET: usize = 0x01;
const ENTRY_FIRST_SECTOR_OFFSET: usize = 0x03;
const ENTRY_NAME_OFFSET: usize = 0x05;

/// A DOS 2 directory entry.
#[derive(Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub flags: u8,
    pub sector_count: u16,
    pub first_sector: u16,
    pub name: AtariName,
}

impl DirectoryEntry {
    pub fn new(name: &AtariName, flags: u8) -> DirectoryEntry {
        DirectoryEntry {
            flags,
            sector_count: 0,
            first_sector: 0,
            name: *name,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> DirectoryEntry {
        assert_eq!(bytes.len(), ENTRY_SIZE);
        let word = |offset: usize| bytes[offset] as u16 | (bytes[offset + 1] as u16) << 8;
        DirectoryEntry {
            flags: bytes[ENTRY_FLAGS_OFFSET],
            sector_count: word(ENTRY_SECTOR_COUNT_OFFSET),
            first_sector: word(ENTRY_FIRST_SECTOR_OFFSET),
            name: AtariName::from_bytes(
                &bytes[ENTRY_NAME_OFFSET..ENTRY_NAME_OFFSET + FILENAME_SIZE],
            ),
        }
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut bytes = [0u8; ENTRY_SIZE];
        bytes[ENTRY_FLAGS_OFFSET] = self.flags;
        bytes[ENTRY_SECTOR_COUNT_OFFSET] = self.sector_count as u8;
        bytes[ENTRY_SECTOR_COUNT_OFFSET + 1] = (self.sector_count >> 8) as u8;
        bytes[ENTRY_FIRST_SECTOR_OFFSET] = self.first_sector as u8;
        bytes[ENTRY_FIRST_SECTOR_OFFSET + 1] = (self.first_sector >> 8) as u8;
        bytes[ENTRY_NAME_OFFSET..].copy_from_slice(self.name.as_bytes());
        bytes
    }

    #[inline]
    pub fn is_never_used(&self) -> bool {
        self.flags == FLAG_NEVER_USED
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    /// True if the slot may be claimed by a new file.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.is_never_used() || self.is_deleted()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.flags & FLAG_LOCKED != 0
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    #[inline]
    pub fn is_dos2(&self) -> bool {
        self.flags & FLAG_DOS2 != 0
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.flags & FLAG_OPENED != 0
    }
}

impl fmt::Display for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{:<14} {:03}",
            if self.is_locked() { '*' } else { ' ' },
            self.name,
            self.sector_count
        )?;
        if self.is_dir() {
            f.write_str(" <DIR>")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} flags={:02x} sectors={} first={}",
            self.name, self.flags, self.sector_count, self.first_sector
        )
    }
}

/// The position of an entry: its directory sector, the byte offset within
/// that sector, and its index in the directory (the file number).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryLocation {
    pub sector: SectorNum,
    pub offset: usize,
    pub index: usize,
}

impl EntryLocation {
    pub fn new(first_sector: SectorNum, index: usize, sector_size: usize) -> EntryLocation {
        let per_sector = entries_per_sector(sector_size);
        EntryLocation {
            sector: first_sector + index / per_sector,
            offset: (index % per_sector) * ENTRY_SIZE,
            index,
        }
    }
}

pub fn read_entry(disk: &mut Disk, location: EntryLocation) -> io::Result<DirectoryEntry> {
    let handle = disk.cache().get(location.sector)?;
    let buffer = disk.cache().buffer(handle)?;
    match buffer.get(location.offset..location.offset + ENTRY_SIZE) {
        Some(bytes) => Ok(DirectoryEntry::from_bytes(bytes)),
        None => Err(DiskError::InvalidOffset.into()),
    }
}

pub fn write_entry(
    disk: &mut Disk,
    location: EntryLocation,
    entry: &DirectoryEntry,
) -> io::Result<()> {
    let handle = disk.cache().get(location.sector)?;
    let buffer = disk.cache().buffer_mut(handle)?;
    match buffer.get_mut(location.offset..location.offset + ENTRY_SIZE) {
        Some(bytes) => {
            bytes.copy_from_slice(&entry.to_bytes());
            Ok(())
        }
        None => Err(DiskError::InvalidOffset.into()),
    }
}

/// Zero the sectors of a directory starting at `first_sector`.
pub fn format_directory(disk: &mut Disk, first_sector: SectorNum) -> io::Result<()> {
    for sector in first_sector..first_sector + DIRECTORY_SECTOR_COUNT {
        disk.cache().init(sector)?;
    }
    Ok(())
}

/// Find the first never-used or deleted entry of a directory.
pub fn find_free_entry(disk: &mut Disk, first_sector: SectorNum) -> io::Result<EntryLocation> {
    let sector_size = disk.sector_size();
    for index in 0..entry_count(sector_size) {
        let location = EntryLocation::new(first_sector, index, sector_size);
        if read_entry(disk, location)?.is_free() {
            return Ok(location);
        }
    }
    Err(DiskError::DirectoryFull.into())
}

/// Claim a free entry for `entry`, returning where it was written.
pub fn alloc_entry(
    disk: &mut Disk,
    first_sector: SectorNum,
    entry: &DirectoryEntry,
) -> io::Result<EntryLocation> {
    let location = find_free_entry(disk, first_sector)?;
    write_entry(disk, location, entry)?;
    debug!(
        "directory: {:?} claimed entry {} of directory at {}",
        entry.name, location.index, first_sector
    );
    Ok(location)
}

/// A cursor over a DOS 2 family directory.
pub struct Dos2Dir {
    volume: Volume,
    first_sector: SectorNum,
    sector_size: usize,
    index: usize,
    entry: DirectoryEntry,
    at_end: bool,
}

impl Dos2Dir {
    pub(crate) fn open(volume: Volume, first_sector: SectorNum) -> io::Result<Dos2Dir> {
        let sector_size = volume.disk.borrow().sector_size();
        let mut dir = Dos2Dir {
            volume,
            first_sector,
            sector_size,
            index: 0,
            entry: DirectoryEntry::from_bytes(&[0u8; ENTRY_SIZE]),
            at_end: false,
        };
        dir.load()?;
        Ok(dir)
    }

    fn load(&mut self) -> io::Result<()> {
        if self.index >= entry_count(self.sector_size) {
            self.at_end = true;
            return Ok(());
        }
        let location = self.location();
        self.entry = read_entry(&mut self.volume.disk.borrow_mut(), location)?;
        if self.entry.is_never_used() {
            self.at_end = true;
        }
        Ok(())
    }

    /// Where the current entry is stored.
    pub fn location(&self) -> EntryLocation {
        EntryLocation::new(self.first_sector, self.index, self.sector_size)
    }

    /// The decoded current entry.
    pub fn entry(&self) -> &DirectoryEntry {
        &self.entry
    }
}

impl Directory for Dos2Dir {
    fn at_end(&self) -> bool {
        self.at_end
    }

    fn next(&mut self) -> io::Result<()> {
        if !self.at_end {
            self.index += 1;
            self.load()?;
        }
        Ok(())
    }

    fn raw_name(&self) -> AtariName {
        self.entry.name
    }

    fn sec_size(&self) -> usize {
        self.entry.sector_count as usize
    }

    fn size(&self) -> io::Result<usize> {
        if self.is_dir() {
            return Ok(0);
        }
        chain_size(
            self.volume.disk.clone(),
            self.volume.chain,
            self.entry.first_sector as SectorNum,
        )
    }

    fn first_sector(&self) -> SectorNum {
        self.entry.first_sector as SectorNum
    }

    fn is_deleted(&self) -> bool {
        self.entry.is_deleted()
    }

    fn is_dir(&self) -> bool {
        self.volume.subdirectories && self.entry.is_dir()
    }

    fn open_file(&self) -> io::Result<Box<dyn FileOps>> {
        if self.at_end || self.is_dir() {
            return Err(DiskError::MissingFile.into());
        }
        Ok(Box::new(Dos2File::open(
            self.volume.clone(),
            self.entry.first_sector as SectorNum,
        )))
    }

    fn open_dir(&self) -> io::Result<Box<dyn Directory>> {
        if self.at_end || !self.is_dir() {
            return Err(DiskError::NotADirectory.into());
        }
        Ok(Box::new(Dos2Dir::open(
            self.volume.clone(),
            self.entry.first_sector as SectorNum,
        )?))
    }

    fn create_file(&mut self, name: &AtariName) -> io::Result<Box<dyn FileOps>> {
        let entry = DirectoryEntry::new(name, FLAG_IN_USE | FLAG_OPENED);
        let location = alloc_entry(&mut self.volume.disk.borrow_mut(), self.first_sector, &entry)?;
        Ok(Box::new(Dos2File::create(self.volume.clone(), location)))
    }

    fn create_dir(&mut self, name: &AtariName) -> io::Result<Box<dyn Directory>> {
        if !self.volume.subdirectories {
            return Err(DiskError::UnsupportedOperation.into());
        }
        let location = find_free_entry(&mut self.volume.disk.borrow_mut(), self.first_sector)?;
        let first = self
            .volume
            .allocator
            .borrow_mut()
            .alloc_run(DIRECTORY_SECTOR_COUNT)?;
        let mut disk = self.volume.disk.borrow_mut();
        format_directory(&mut disk, first)?;
        let mut entry = DirectoryEntry::new(name, FLAG_DIRECTORY);
        entry.sector_count = DIRECTORY_SECTOR_COUNT as u16;
        entry.first_sector = first as u16;
        write_entry(&mut disk, location, &entry)?;
        debug!("directory: created {:?} at sector {}", name, first);
        drop(disk);
        Ok(Box::new(Dos2Dir::open(self.volume.clone(), first)?))
    }
}
