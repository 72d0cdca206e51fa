//! RK-DOS
//!
//! Files are runs of contiguous sectors called clusters.  A directory entry
//! gives the first cluster and the file's byte length; when a file outgrows a
//! cluster and the next free sector is not adjacent, the last three bytes of
//! the cluster become a link (next cluster start word, next cluster size) and
//! the displaced data moves to the new cluster.  A cluster is the last one
//! when the bytes remaining from its start fit in it.
//!
//! Free space is one run of sectors recorded in sector 1, and allocation
//! takes sectors from its front.  Directories are files of variable-length
//! entries; the root directory's own entry sits in sector 1.

use std::collections::HashSet;
use std::io;
use std::rc::Rc;

use log::{debug, info};

use crate::atascii::{AtariName, FILENAME_SIZE};
use crate::disk::container::Disk;
use crate::disk::error::DiskError;
use crate::disk::{Directory, DiskRef, FileOps, Filesystem, Property, SectorNum};

const ROOT_SECTOR: SectorNum = 1;
const ROOT_ID_OFFSET: usize = 6;
const ROOT_ID: [u8; 2] = [b'R', b'K'];
const ROOT_FREE_START_OFFSET: usize = 8;
const ROOT_FREE_SIZE_OFFSET: usize = 10;
const ROOT_ENTRY_OFFSET: usize = 12;
const FIRST_FREE_SECTOR: SectorNum = 4;

const ENTRY_LENGTH_OFFSET: usize = 0;
const ENTRY_FLAGS_OFFSET: usize = 1;
const ENTRY_CLUSTER_START_OFFSET: usize = 2;
const ENTRY_CLUSTER_SIZE_OFFSET: usize = 4;
const ENTRY_FILE_SIZE_OFFSET: usize = 5;
/// Fixed part of an entry; the name follows.
pub const ENTRY_HEADER_SIZE: usize = 12;

pub const FLAG_DIRECTORY: u8 = 0x01;
pub const FLAG_PROTECTED: u8 = 0x02;
pub const FLAG_DELETED: u8 = 0x04;

/// Next cluster start (word) and size, at the end of a cluster that is
/// continued elsewhere.
const LINK_SIZE: usize = 3;
const MAX_CLUSTER_SIZE: usize = 0xFF;
const MAX_FILE_SIZE: usize = 0xFF_FFFF;

/// A run of contiguous sectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cluster {
    start: SectorNum,
    size: usize,
}

impl Cluster {
    const EMPTY: Cluster = Cluster { start: 0, size: 0 };

    fn last(&self) -> SectorNum {
        self.start + self.size - 1
    }
}

/// The decoded fixed part of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct EntryHeader {
    flags: u8,
    cluster: Cluster,
    file_size: usize,
}

impl EntryHeader {
    fn from_bytes(bytes: &[u8]) -> EntryHeader {
        EntryHeader {
            flags: bytes[ENTRY_FLAGS_OFFSET],
            cluster: Cluster {
                start: bytes[ENTRY_CLUSTER_START_OFFSET] as SectorNum
                    | (bytes[ENTRY_CLUSTER_START_OFFSET + 1] as SectorNum) << 8,
                size: bytes[ENTRY_CLUSTER_SIZE_OFFSET] as usize,
            },
            file_size: bytes[ENTRY_FILE_SIZE_OFFSET] as usize
                | (bytes[ENTRY_FILE_SIZE_OFFSET + 1] as usize) << 8
                | (bytes[ENTRY_FILE_SIZE_OFFSET + 2] as usize) << 16,
        }
    }
}

/// The cluster and size fields of an entry, as rewritten when a file is
/// closed.
fn placement_bytes(cluster: Cluster, file_size: usize) -> [u8; 6] {
    [
        cluster.start as u8,
        (cluster.start >> 8) as u8,
        cluster.size as u8,
        file_size as u8,
        (file_size >> 8) as u8,
        (file_size >> 16) as u8,
    ]
}

/// A new entry with an empty file and the name with trailing spaces cut.
fn new_entry(name: &AtariName, flags: u8) -> Vec<u8> {
    let raw = name.as_bytes();
    let length = raw.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    let mut entry = vec![0u8; ENTRY_HEADER_SIZE];
    entry[ENTRY_LENGTH_OFFSET] = (ENTRY_HEADER_SIZE + length - 1) as u8;
    entry[ENTRY_FLAGS_OFFSET] = flags;
    entry.extend_from_slice(&raw[..length]);
    entry
}

/// Where a directory entry lives: the root entry in sector 1, or a byte
/// offset into a parent directory.
#[derive(Debug)]
enum EntryPos {
    Root,
    Child { parent: Rc<EntryPos>, offset: usize },
}

fn read_header(disk: &mut Disk, pos: &EntryPos) -> io::Result<EntryHeader> {
    let mut bytes = [0u8; ENTRY_HEADER_SIZE];
    read_entry_bytes(disk, pos, 0, &mut bytes)?;
    Ok(EntryHeader::from_bytes(&bytes))
}

fn read_entry_bytes(
    disk: &mut Disk,
    pos: &EntryPos,
    at: usize,
    buf: &mut [u8],
) -> io::Result<()> {
    match pos {
        EntryPos::Root => {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = disk.read_byte(ROOT_SECTOR, ROOT_ENTRY_OFFSET + at + i)?;
            }
        }
        EntryPos::Child { parent, offset } => {
            let header = read_header(disk, parent)?;
            let mut cursor = Cursor::new(header.cluster);
            for (i, b) in buf.iter_mut().enumerate() {
                let (sector, byte) = cursor.locate(disk, header.file_size, offset + at + i)?;
                *b = disk.read_byte(sector, byte)?;
            }
        }
    }
    Ok(())
}

fn write_entry_bytes(
    disk: &mut Disk,
    pos: &EntryPos,
    at: usize,
    data: &[u8],
) -> io::Result<()> {
    match pos {
        EntryPos::Root => {
            for (i, &b) in data.iter().enumerate() {
                disk.write_byte(ROOT_SECTOR, ROOT_ENTRY_OFFSET + at + i, b)?;
            }
        }
        EntryPos::Child { parent, offset } => {
            let header = read_header(disk, parent)?;
            let mut cursor = Cursor::new(header.cluster);
            for (i, &b) in data.iter().enumerate() {
                let (sector, byte) = cursor.locate(disk, header.file_size, offset + at + i)?;
                disk.write_byte(sector, byte, b)?;
            }
        }
    }
    Ok(())
}

fn read_link(disk: &mut Disk, cluster: Cluster) -> io::Result<Cluster> {
    let offset = disk.sector_size() - LINK_SIZE;
    let last = cluster.last();
    Ok(Cluster {
        start: disk.read_word(last, offset)? as SectorNum,
        size: disk.read_byte(last, offset + 2)? as usize,
    })
}

/// Maps file positions to sectors, following cluster links forward.
struct Cursor {
    first: Cluster,
    cluster: Cluster,
    /// File position of the first byte of `cluster`.
    base: usize,
    visited: HashSet<SectorNum>,
}

impl Cursor {
    fn new(first: Cluster) -> Cursor {
        let mut cursor = Cursor {
            first,
            cluster: first,
            base: 0,
            visited: HashSet::new(),
        };
        cursor.rewind();
        cursor
    }

    fn rewind(&mut self) {
        self.cluster = self.first;
        self.base = 0;
        self.visited.clear();
        self.visited.insert(self.first.start);
    }

    fn locate(
        &mut self,
        disk: &mut Disk,
        file_size: usize,
        pos: usize,
    ) -> io::Result<(SectorNum, usize)> {
        if pos >= file_size {
            return Err(DiskError::EndOfFile.into());
        }
        if pos < self.base {
            self.rewind();
        }
        let sector_size = disk.sector_size();
        loop {
            if self.cluster.start == 0 || self.cluster.size == 0 {
                return Err(DiskError::FormatError.into());
            }
            let capacity = self.cluster.size * sector_size;
            if file_size - self.base <= capacity || pos < self.base + capacity - LINK_SIZE {
                break;
            }
            let next = read_link(disk, self.cluster)?;
            if !self.visited.insert(next.start) {
                return Err(DiskError::ChainLoop.into());
            }
            debug!(
                "rkdos: cluster {}+{} continues at {}+{}",
                self.cluster.start, self.cluster.size, next.start, next.size
            );
            self.base += capacity - LINK_SIZE;
            self.cluster = next;
        }
        let relative = pos - self.base;
        Ok((
            self.cluster.start + relative / sector_size,
            relative % sector_size,
        ))
    }
}

/// Take the first sector of the free run.
fn alloc_sector(disk: &mut Disk) -> io::Result<SectorNum> {
    let start = disk.read_word(ROOT_SECTOR, ROOT_FREE_START_OFFSET)?;
    let size = disk.read_word(ROOT_SECTOR, ROOT_FREE_SIZE_OFFSET)?;
    if size == 0 {
        return Err(DiskError::DiskFull.into());
    }
    disk.write_word(ROOT_SECTOR, ROOT_FREE_START_OFFSET, start.wrapping_add(1))?;
    disk.write_word(ROOT_SECTOR, ROOT_FREE_SIZE_OFFSET, size - 1)?;
    disk.cache().init(start as SectorNum)?;
    Ok(start as SectorNum)
}

pub struct RkDos {
    disk: DiskRef,
}

impl RkDos {
    pub fn new(disk: DiskRef) -> io::Result<RkDos> {
        let header = read_header(&mut disk.borrow_mut(), &EntryPos::Root)?;
        debug!(
            "rkdos: root directory at {}, {} bytes",
            header.cluster.start, header.file_size
        );
        Ok(RkDos { disk })
    }

    /// Mark sector 1 and record every sector after the boot sectors as free.
    /// The rest of the boot sectors is left alone.
    pub fn format(disk: DiskRef) -> io::Result<RkDos> {
        {
            let mut d = disk.borrow_mut();
            let free = d.sector_count().saturating_sub(FIRST_FREE_SECTOR - 1);
            if free == 0 || d.sector_count() > 0xFFFF {
                return Err(DiskError::FormatError.into());
            }
            for (i, &b) in ROOT_ID.iter().enumerate() {
                d.write_byte(ROOT_SECTOR, ROOT_ID_OFFSET + i, b)?;
            }
            d.write_word(ROOT_SECTOR, ROOT_FREE_START_OFFSET, FIRST_FREE_SECTOR as u16)?;
            d.write_word(ROOT_SECTOR, ROOT_FREE_SIZE_OFFSET, free as u16)?;
            let mut root = [0u8; ENTRY_HEADER_SIZE];
            root[ENTRY_LENGTH_OFFSET] = (ENTRY_HEADER_SIZE - 1) as u8;
            root[ENTRY_FLAGS_OFFSET] = FLAG_DIRECTORY;
            write_entry_bytes(&mut d, &EntryPos::Root, 0, &root)?;
            info!("rkdos: formatted {} free sectors", free);
        }
        RkDos::new(disk)
    }

    /// First sector of the free run.
    pub fn first_free_sector(&self) -> io::Result<SectorNum> {
        Ok(self
            .disk
            .borrow_mut()
            .read_word(ROOT_SECTOR, ROOT_FREE_START_OFFSET)? as SectorNum)
    }
}

impl Filesystem for RkDos {
    fn name(&self) -> &str {
        "rkdos"
    }

    fn disk(&self) -> DiskRef {
        self.disk.clone()
    }

    fn properties(&self) -> &'static [Property] {
        &[]
    }

    fn free_sector_count(&self) -> io::Result<usize> {
        Ok(self
            .disk
            .borrow_mut()
            .read_word(ROOT_SECTOR, ROOT_FREE_SIZE_OFFSET)? as usize)
    }

    /// RK-DOS keeps no DOS.SYS pointer.
    fn get_dos_first_sector(&self) -> io::Result<SectorNum> {
        Ok(0)
    }

    fn set_dos_first_sector(&mut self, _sector: SectorNum) -> io::Result<()> {
        Err(DiskError::UnsupportedOperation.into())
    }

    fn root_dir(&self) -> io::Result<Box<dyn Directory>> {
        Ok(Box::new(RkDir::open(self.disk.clone(), Rc::new(EntryPos::Root))?))
    }

    fn create_file(&mut self, name: &AtariName) -> io::Result<Box<dyn FileOps>> {
        RkDir::open(self.disk.clone(), Rc::new(EntryPos::Root))?.create_file(name)
    }
}

/// Where the size of the cluster being written is recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SizeField {
    /// The directory entry, rewritten on close.
    Entry,
    /// The link at the end of the previous cluster's last sector.
    Link(SectorNum),
}

struct Writer {
    entry: Rc<EntryPos>,
    first: Cluster,
    current: Cluster,
    size_field: SizeField,
    sector: SectorNum,
    /// Bytes filled in `sector`.
    offset: usize,
}

impl Writer {
    /// Continue a file after its last byte.
    fn append(disk: &mut Disk, entry: Rc<EntryPos>) -> io::Result<(Writer, usize)> {
        let header = read_header(disk, &entry)?;
        let mut writer = Writer {
            entry,
            first: header.cluster,
            current: header.cluster,
            size_field: SizeField::Entry,
            sector: 0,
            offset: 0,
        };
        if header.file_size == 0 {
            writer.first = Cluster::EMPTY;
            writer.current = Cluster::EMPTY;
            return Ok((writer, 0));
        }
        let mut cursor = Cursor::new(header.cluster);
        let (sector, byte) = cursor.locate(disk, header.file_size, header.file_size - 1)?;
        if cursor.cluster != header.cluster {
            let mut previous = header.cluster;
            let mut visited = HashSet::new();
            loop {
                let next = read_link(disk, previous)?;
                if next == cursor.cluster {
                    break;
                }
                if !visited.insert(next.start) {
                    return Err(DiskError::ChainLoop.into());
                }
                previous = next;
            }
            writer.size_field = SizeField::Link(previous.last());
        }
        writer.current = cursor.cluster;
        writer.sector = sector;
        writer.offset = byte + 1;
        Ok((writer, header.file_size))
    }

    fn create(entry: Rc<EntryPos>) -> Writer {
        Writer {
            entry,
            first: Cluster::EMPTY,
            current: Cluster::EMPTY,
            size_field: SizeField::Entry,
            sector: 0,
            offset: 0,
        }
    }

    /// Make room for one more byte at `sector`/`offset`.
    fn advance(&mut self, disk: &mut Disk) -> io::Result<()> {
        let sector_size = disk.sector_size();
        if self.current.size == 0 {
            let start = alloc_sector(disk)?;
            self.current = Cluster { start, size: 1 };
            self.first = self.current;
            self.sector = start;
            self.offset = 0;
            return Ok(());
        }
        if self.offset < sector_size {
            return Ok(());
        }
        let next = alloc_sector(disk)?;
        if next == self.current.start + self.current.size
            && self.current.size < MAX_CLUSTER_SIZE
        {
            self.current.size += 1;
            match self.size_field {
                SizeField::Entry => self.first = self.current,
                SizeField::Link(sector) => {
                    disk.write_byte(sector, sector_size - 1, self.current.size as u8)?
                }
            }
            self.sector = next;
            self.offset = 0;
            return Ok(());
        }

        // The tail of the full sector moves to the new cluster to make room
        // for the link.
        let tail = sector_size - LINK_SIZE;
        for i in 0..LINK_SIZE {
            let b = disk.read_byte(self.sector, tail + i)?;
            disk.write_byte(next, i, b)?;
        }
        disk.write_word(self.sector, tail, next as u16)?;
        disk.write_byte(self.sector, tail + 2, 1)?;
        debug!(
            "rkdos: cluster {}+{} linked to {}",
            self.current.start, self.current.size, next
        );
        self.size_field = SizeField::Link(self.sector);
        self.current = Cluster {
            start: next,
            size: 1,
        };
        self.sector = next;
        self.offset = LINK_SIZE;
        Ok(())
    }

    fn close(&self, disk: &mut Disk, file_size: usize) -> io::Result<()> {
        write_entry_bytes(
            disk,
            &self.entry,
            ENTRY_CLUSTER_START_OFFSET,
            &placement_bytes(self.first, file_size),
        )
    }
}

enum Mode {
    Reading(Cursor),
    Writing(Writer),
    Closed,
}

/// An open RK-DOS file.  Files created for output record their clusters and
/// size in the directory entry when closed or dropped.
pub struct RkFile {
    disk: DiskRef,
    first_sector: SectorNum,
    pos: usize,
    size: usize,
    mode: Mode,
}

impl RkFile {
    fn open(disk: DiskRef, header: &EntryHeader) -> RkFile {
        RkFile {
            disk,
            first_sector: header.cluster.start,
            pos: 0,
            size: header.file_size,
            mode: Mode::Reading(Cursor::new(header.cluster)),
        }
    }

    fn create(disk: DiskRef, entry: Rc<EntryPos>) -> RkFile {
        RkFile {
            disk,
            first_sector: 0,
            pos: 0,
            size: 0,
            mode: Mode::Writing(Writer::create(entry)),
        }
    }

    fn append(disk: DiskRef, entry: Rc<EntryPos>) -> io::Result<RkFile> {
        let (writer, size) = Writer::append(&mut disk.borrow_mut(), entry)?;
        Ok(RkFile {
            disk,
            first_sector: writer.first.start,
            pos: size,
            size,
            mode: Mode::Writing(writer),
        })
    }
}

impl FileOps for RkFile {
    fn eof(&mut self) -> io::Result<bool> {
        Ok(self.pos >= self.size)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let cursor = match self.mode {
            Mode::Reading(ref mut cursor) => cursor,
            _ => return Err(DiskError::UnsupportedOperation.into()),
        };
        let mut disk = self.disk.borrow_mut();
        let (sector, offset) = cursor.locate(&mut disk, self.size, self.pos)?;
        let byte = disk.read_byte(sector, offset)?;
        self.pos += 1;
        Ok(byte)
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        let writer = match self.mode {
            Mode::Writing(ref mut writer) => writer,
            _ => return Err(DiskError::UnsupportedOperation.into()),
        };
        if self.size == MAX_FILE_SIZE {
            return Err(DiskError::DiskFull.into());
        }
        let mut disk = self.disk.borrow_mut();
        writer.advance(&mut disk)?;
        disk.write_byte(writer.sector, writer.offset, byte)?;
        writer.offset += 1;
        self.first_sector = writer.first.start;
        self.pos += 1;
        self.size = self.pos;
        Ok(())
    }

    fn first_sector(&self) -> SectorNum {
        self.first_sector
    }

    fn close(&mut self) -> io::Result<()> {
        let writer = match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Writing(writer) => writer,
            _ => return Ok(()),
        };
        writer.close(&mut self.disk.borrow_mut(), self.size)?;
        debug!(
            "rkdos: closed file of {} bytes from {}",
            self.size, writer.first.start
        );
        Ok(())
    }
}

impl Drop for RkFile {
    fn drop(&mut self) {
        let _result = self.close();
    }
}

/// A cursor over an RK-DOS directory.
pub struct RkDir {
    disk: DiskRef,
    /// This directory's own entry.
    pos: Rc<EntryPos>,
    file: RkFile,
    /// Offset of the current entry in the directory file.
    offset: usize,
    entry: Vec<u8>,
    at_end: bool,
}

impl RkDir {
    fn open(disk: DiskRef, pos: Rc<EntryPos>) -> io::Result<RkDir> {
        let header = read_header(&mut disk.borrow_mut(), &pos)?;
        let mut dir = RkDir {
            disk: disk.clone(),
            pos,
            file: RkFile::open(disk, &header),
            offset: 0,
            entry: vec![],
            at_end: false,
        };
        dir.load()?;
        Ok(dir)
    }

    fn load(&mut self) -> io::Result<()> {
        self.entry.clear();
        if self.file.eof()? {
            self.at_end = true;
            return Ok(());
        }
        let length = self.file.read_byte()? as usize + 1;
        if length < ENTRY_HEADER_SIZE {
            return Err(DiskError::FormatError.into());
        }
        self.entry.resize(length, 0);
        self.entry[ENTRY_LENGTH_OFFSET] = (length - 1) as u8;
        self.file.read_bytes(&mut self.entry[1..])?;
        Ok(())
    }

    fn header(&self) -> EntryHeader {
        EntryHeader::from_bytes(&self.entry[..ENTRY_HEADER_SIZE])
    }

    pub fn is_protected(&self) -> bool {
        !self.at_end && self.header().flags & FLAG_PROTECTED != 0
    }

    /// Size of the current entry's first cluster in sectors.
    pub fn cluster_size(&self) -> usize {
        if self.at_end {
            return 0;
        }
        self.header().cluster.size
    }

    /// Append an entry to this directory, returning where it went.
    fn add_entry(&mut self, name: &AtariName, flags: u8) -> io::Result<Rc<EntryPos>> {
        let entry = new_entry(name, flags);
        let mut file = RkFile::append(self.disk.clone(), self.pos.clone())?;
        let offset = file.pos;
        if let Err(e) = file.write_bytes(&entry) {
            // Leave the recorded directory size as it was.
            file.mode = Mode::Closed;
            return Err(e);
        }
        file.close()?;
        debug!("rkdos: added {:?} at offset {}", name, offset);
        Ok(Rc::new(EntryPos::Child {
            parent: self.pos.clone(),
            offset,
        }))
    }
}

impl Directory for RkDir {
    fn at_end(&self) -> bool {
        self.at_end
    }

    fn next(&mut self) -> io::Result<()> {
        if !self.at_end {
            self.offset += self.entry.len();
            self.load()?;
        }
        Ok(())
    }

    fn raw_name(&self) -> AtariName {
        match self.entry.get(ENTRY_HEADER_SIZE..) {
            Some(name) => AtariName::from_bytes(&name[..name.len().min(FILENAME_SIZE)]),
            None => AtariName::from_bytes(&[]),
        }
    }

    fn sec_size(&self) -> usize {
        if self.at_end {
            return 0;
        }
        let sector_size = self.disk.borrow().sector_size();
        (self.header().file_size + sector_size - 1) / sector_size
    }

    fn size(&self) -> io::Result<usize> {
        if self.at_end {
            return Ok(0);
        }
        Ok(self.header().file_size)
    }

    fn first_sector(&self) -> SectorNum {
        if self.at_end {
            return 0;
        }
        self.header().cluster.start
    }

    fn open_file(&self) -> io::Result<Box<dyn FileOps>> {
        if self.at_end || self.is_dir() {
            return Err(DiskError::MissingFile.into());
        }
        Ok(Box::new(RkFile::open(self.disk.clone(), &self.header())))
    }

    fn create_file(&mut self, name: &AtariName) -> io::Result<Box<dyn FileOps>> {
        let entry = self.add_entry(name, 0)?;
        Ok(Box::new(RkFile::create(self.disk.clone(), entry)))
    }

    fn is_deleted(&self) -> bool {
        !self.at_end && self.header().flags & FLAG_DELETED != 0
    }

    fn is_dir(&self) -> bool {
        !self.at_end && self.header().flags & FLAG_DIRECTORY != 0
    }

    fn open_dir(&self) -> io::Result<Box<dyn Directory>> {
        if self.at_end || !self.is_dir() {
            return Err(DiskError::NotADirectory.into());
        }
        let pos = Rc::new(EntryPos::Child {
            parent: self.pos.clone(),
            offset: self.offset,
        });
        Ok(Box::new(RkDir::open(self.disk.clone(), pos)?))
    }

    fn create_dir(&mut self, name: &AtariName) -> io::Result<Box<dyn Directory>> {
        let entry = self.add_entry(name, FLAG_DIRECTORY)?;
        Ok(Box::new(RkDir::open(self.disk.clone(), entry)?))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::disk::{detect, install, DosType};

    fn blank(sector_size: usize, sector_count: usize) -> DiskRef {
        Rc::new(RefCell::new(Disk::new(sector_size, sector_count).unwrap()))
    }

    fn name(text: &str) -> AtariName {
        text.parse().unwrap()
    }

    fn pattern(length: usize, seed: usize) -> Vec<u8> {
        (0..length).map(|i| (i * 13 + seed + i / 241) as u8).collect()
    }

    #[test]
    fn test_format() {
        let disk = blank(128, 720);
        let fs = RkDos::format(disk.clone()).unwrap();
        assert_eq!(fs.free_sector_count().unwrap(), 717);
        assert_eq!(fs.first_free_sector().unwrap(), 4);
        assert!(fs.root_dir().unwrap().at_end());
        let mut d = disk.borrow_mut();
        assert_eq!(d.read_byte(1, 6).unwrap(), b'R');
        assert_eq!(d.read_byte(1, 7).unwrap(), b'K');
        assert_eq!(DosType::detect(&mut d).unwrap(), DosType::RkDos);
        assert_eq!(d.read_byte(1, 12).unwrap(), 11);
        assert_eq!(d.read_byte(1, 13).unwrap(), FLAG_DIRECTORY);
    }

    #[test]
    fn test_entry_layout() {
        let disk = blank(128, 720);
        let mut fs = RkDos::format(disk.clone()).unwrap();
        {
            let mut file = fs.create_file(&name("AB.C")).unwrap();
            file.write_bytes(&pattern(300, 0)).unwrap();
        }
        let dir = RkDir::open(disk.clone(), Rc::new(EntryPos::Root)).unwrap();
        assert_eq!(dir.name(), "AB.C");
        assert_eq!(dir.cluster_size(), 3);
        assert!(!dir.is_protected());
        drop(dir);
        let mut d = disk.borrow_mut();
        // The root directory took sector 4 and the file 5 to 7.
        assert_eq!(d.read_word(1, 14).unwrap(), 4);
        assert_eq!(d.read_byte(1, 16).unwrap(), 1);
        assert_eq!(d.read_byte(1, 17).unwrap(), 21);
        let entry: Vec<u8> = (0..21).map(|i| d.read_byte(4, i).unwrap()).collect();
        assert_eq!(
            entry,
            vec![
                20, 0, 5, 0, 3, 0x2C, 0x01, 0, 0, 0, 0, 0, b'A', b'B', b' ', b' ', b' ', b' ',
                b' ', b' ', b'C'
            ]
        );
        assert_eq!(d.read_word(1, 8).unwrap(), 8);
    }

    #[test]
    fn test_write_and_read_back() {
        let disk = blank(256, 720);
        let mut fs = install(disk.clone(), "rkdos").unwrap();
        let files: Vec<(String, Vec<u8>)> = (0..12)
            .map(|n| (format!("FILE{}.DAT", n), pattern(n * 700 + 1, n)))
            .collect();
        for (text, data) in &files {
            let mut file = fs.create_file(&name(text)).unwrap();
            file.write_bytes(data).unwrap();
            file.close().unwrap();
        }

        let fs = detect(disk).unwrap();
        assert_eq!(fs.name(), "rkdos");
        let mut dir = fs.root_dir().unwrap();
        for (text, data) in &files {
            assert_eq!(&dir.name(), text);
            assert_eq!(dir.size().unwrap(), data.len());
            assert_eq!(dir.sec_size(), (data.len() + 255) / 256);
            assert_eq!(&dir.open_file().unwrap().read_to_vec().unwrap(), data);
            dir.next().unwrap();
        }
        assert!(dir.at_end());
    }

    #[test]
    fn test_interleaved_writes_link_clusters() {
        let disk = blank(128, 720);
        let mut fs = RkDos::format(disk.clone()).unwrap();
        let first = pattern(500, 1);
        let second = pattern(400, 2);
        {
            let mut a = fs.create_file(&name("A")).unwrap();
            let mut b = fs.create_file(&name("B")).unwrap();
            for chunk in 0..5 {
                a.write_bytes(&first[chunk * 100..(chunk + 1) * 100]).unwrap();
                if chunk < 4 {
                    b.write_bytes(&second[chunk * 100..(chunk + 1) * 100]).unwrap();
                }
            }
        }
        // A starts in sector 5 and B in sector 6, so both are split.
        let mut dir = fs.root_dir().unwrap();
        assert_eq!(dir.first_sector(), 5);
        assert_eq!(dir.open_file().unwrap().read_to_vec().unwrap(), first);
        dir.next().unwrap();
        assert_eq!(dir.first_sector(), 6);
        assert_eq!(dir.open_file().unwrap().read_to_vec().unwrap(), second);
        // The first cluster of A is one sector long and links onward.
        let mut d = disk.borrow_mut();
        assert_eq!(d.read_byte(4, 4).unwrap(), 1);
        assert_eq!(d.read_word(5, 125).unwrap(), 7);
        // One directory sector and four sectors each for A and B.
        assert_eq!(d.read_word(1, 10).unwrap(), 717 - 1 - 4 - 4);
    }

    #[test]
    fn test_subdirectories() {
        let fs = RkDos::format(blank(128, 720)).unwrap();
        let mut root = fs.root_dir().unwrap();
        let mut games = root.create_dir(&name("GAMES")).unwrap();
        {
            let mut file = games.create_file(&name("PONG.COM")).unwrap();
            file.write_bytes(&pattern(1000, 3)).unwrap();
        }
        fs.root_dir()
            .unwrap()
            .create_file(&name("README"))
            .unwrap()
            .write_bytes(b"hi")
            .unwrap();

        let mut root = fs.root_dir().unwrap();
        assert!(root.is_dir());
        assert_eq!(root.size().unwrap(), ENTRY_HEADER_SIZE + FILENAME_SIZE);
        assert!(root.open_file().err().unwrap() == DiskError::MissingFile);
        let mut games = root.open_dir().unwrap();
        assert_eq!(games.name(), "PONG.COM");
        assert_eq!(
            games.open_file().unwrap().read_to_vec().unwrap(),
            pattern(1000, 3)
        );
        games.next().unwrap();
        assert!(games.at_end());
        root.next().unwrap();
        assert!(root.open_dir().err().unwrap() == DiskError::NotADirectory);
        assert_eq!(root.names().unwrap(), vec!["README"]);
    }

    #[test]
    fn test_disk_full() {
        let mut fs = RkDos::format(blank(128, 20)).unwrap();
        let mut file = fs.create_file(&name("BIG")).unwrap();
        // One sector holds the directory and 16 the data.
        let error = file.write_bytes(&pattern(20 * 128, 0)).unwrap_err();
        assert!(error == DiskError::DiskFull);
        file.close().unwrap();
        assert_eq!(fs.free_sector_count().unwrap(), 0);
        let dir = fs.root_dir().unwrap();
        assert_eq!(dir.size().unwrap(), 16 * 128);
        assert_eq!(dir.sec_size(), 16);
        assert_eq!(
            dir.open_file().unwrap().read_to_vec().unwrap(),
            pattern(16 * 128, 0)
        );
    }

    #[test]
    fn test_no_dos_pointer() {
        let mut fs = RkDos::format(blank(128, 720)).unwrap();
        assert!(fs.properties().is_empty());
        assert_eq!(fs.get_dos_first_sector().unwrap(), 0);
        let error = fs.set_dos_first_sector(10).unwrap_err();
        assert!(error == DiskError::UnsupportedOperation);
        let mut file = fs.create_file(&name("X")).unwrap();
        assert!(file.read_byte().unwrap_err() == DiskError::UnsupportedOperation);
    }

    #[test]
    fn test_link_loop() {
        let disk = blank(128, 720);
        let mut fs = RkDos::format(disk.clone()).unwrap();
        {
            let mut a = fs.create_file(&name("A")).unwrap();
            let mut b = fs.create_file(&name("B")).unwrap();
            a.write_bytes(&pattern(128, 0)).unwrap();
            b.write_byte(0).unwrap();
            a.write_bytes(&pattern(100, 0)).unwrap();
        }
        // Point the link at the end of A's first cluster back at itself.
        {
            let mut d = disk.borrow_mut();
            assert_eq!(d.read_word(5, 125).unwrap(), 7);
            d.write_word(5, 125, 5).unwrap();
        }
        let mut file = fs.root_dir().unwrap().open_file().unwrap();
        let error = file.read_to_vec().unwrap_err();
        assert!(error == DiskError::ChainLoop);
    }

    #[test]
    fn test_disk_full_while_adding_entry() {
        let mut fs = RkDos::format(blank(128, 5)).unwrap();
        // Sector 4 takes the directory and sector 5 the file.
        for n in 0..7 {
            let mut file = fs.create_file(&name(&format!("NAME{}", n))).unwrap();
            if n == 0 {
                file.write_byte(1).unwrap();
            }
        }
        assert_eq!(fs.free_sector_count().unwrap(), 0);
        // Seven entries of 17 bytes fill 119 bytes of the directory sector,
        // so the eighth needs another one.
        let error = fs.create_file(&name("NAME7")).err().unwrap();
        assert!(error == DiskError::DiskFull);
        let mut root = fs.root_dir().unwrap();
        assert_eq!(root.size().unwrap(), 1);
        let names = root.names().unwrap();
        assert_eq!(names.len(), 7);
        assert_eq!(names[6], "NAME6");
    }
}
