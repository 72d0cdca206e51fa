//! The ATR container: a 16-byte header followed by raw sector bytes.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use log::{debug, warn};

use crate::disk::cache::{SectorCache, DEFAULT_CACHE_CAPACITY};
use crate::disk::error::DiskError;
use crate::disk::image::Image;
use crate::disk::{Geometry, SectorNum, BOOT_SECTOR_COUNT, BOOT_SECTOR_SIZE};
use crate::util;

pub const HEADER_SIZE: usize = 16;
const MAGIC: [u8; 2] = [0x96, 0x02];
const PARAGRAPH_SIZE: usize = 16;

const HEADER_MAGIC_OFFSET: usize = 0x00;
const HEADER_SIZE_LO_OFFSET: usize = 0x02;
const HEADER_SECTOR_SIZE_OFFSET: usize = 0x04;
const HEADER_SIZE_HI_OFFSET: usize = 0x06;
const HEADER_FLAGS_OFFSET: usize = 0x08;
const HEADER_BAD_SECTOR_OFFSET: usize = 0x09;

const FLAG_BAD_SECTORS: u8 = 0x10;
const FLAG_WRITE_PROTECTED: u8 = 0x20;

#[inline]
fn word(bytes: &[u8], offset: usize) -> u16 {
    bytes[offset] as u16 | (bytes[offset + 1] as u16) << 8
}

#[inline]
fn put_word(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset] = value as u8;
    bytes[offset + 1] = (value >> 8) as u8;
}

/// The fixed container header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Payload size in 16-byte paragraphs (low and high words combined).
    pub paragraphs: u32,
    pub sector_size: u16,
    pub flags: u8,
    pub first_bad_sector: u16,
}

impl Header {
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Header> {
        if bytes.len() < HEADER_SIZE || bytes[HEADER_MAGIC_OFFSET..HEADER_MAGIC_OFFSET + 2] != MAGIC
        {
            return Err(DiskError::FormatError.into());
        }
        Ok(Header {
            paragraphs: word(bytes, HEADER_SIZE_LO_OFFSET) as u32
                | (word(bytes, HEADER_SIZE_HI_OFFSET) as u32) << 16,
            sector_size: word(bytes, HEADER_SECTOR_SIZE_OFFSET),
            flags: bytes[HEADER_FLAGS_OFFSET],
            first_bad_sector: word(bytes, HEADER_BAD_SECTOR_OFFSET),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[HEADER_MAGIC_OFFSET..HEADER_MAGIC_OFFSET + 2].copy_from_slice(&MAGIC);
        put_word(&mut bytes, HEADER_SIZE_LO_OFFSET, self.paragraphs as u16);
        put_word(&mut bytes, HEADER_SECTOR_SIZE_OFFSET, self.sector_size);
        put_word(&mut bytes, HEADER_SIZE_HI_OFFSET, (self.paragraphs >> 16) as u16);
        bytes[HEADER_FLAGS_OFFSET] = self.flags;
        put_word(&mut bytes, HEADER_BAD_SECTOR_OFFSET, self.first_bad_sector);
        bytes
    }

    /// Payload size in bytes.
    pub fn byte_size(&self) -> usize {
        self.paragraphs as usize * PARAGRAPH_SIZE
    }
}

/// A virtual disk: geometry, container header details, and the sector cache
/// through which all sector reads and writes pass.
pub struct Disk {
    cache: SectorCache,
    flags: u8,
    first_bad_sector: u16,
    /// Size of each boot sector's slot in the container.  Always 128 except
    /// for images that store the boot sectors in full-size slots.
    boot_slot_size: usize,
}

impl Disk {
    /// Create a blank disk of the given geometry.
    pub fn new(sector_size: usize, sector_count: SectorNum) -> io::Result<Disk> {
        Self::with_cache_capacity(sector_size, sector_count, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(
        sector_size: usize,
        sector_count: SectorNum,
        capacity: usize,
    ) -> io::Result<Disk> {
        let geometry = Geometry::checked(sector_size, sector_count)?;
        let image = Image::open_memory(geometry.byte_size())?;
        Ok(Disk {
            cache: SectorCache::new(image, geometry, capacity),
            flags: 0,
            first_bad_sector: 0,
            boot_slot_size: BOOT_SECTOR_SIZE,
        })
    }

    /// Load an ATR file.
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Disk> {
        let image = Image::open_read_only(path)?;
        Self::from_bytes(image.slice(0, image.len())?)
    }

    /// Parse ATR container bytes.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Disk> {
        let header = Header::from_bytes(bytes)?;
        let size = header.byte_size();
        let sector_size = header.sector_size as usize;
        let boot_slot_size = if sector_size >= 256 && size & 0xff == 0 {
            sector_size
        } else {
            BOOT_SECTOR_SIZE
        };
        if size < BOOT_SECTOR_COUNT * boot_slot_size || sector_size == 0 {
            return Err(DiskError::FormatError.into());
        }
        let data_size = size - BOOT_SECTOR_COUNT * boot_slot_size;
        if data_size % sector_size != 0 {
            warn!(
                "container size {} leaves {} trailing bytes",
                size,
                data_size % sector_size
            );
        }
        let sector_count = BOOT_SECTOR_COUNT + data_size / sector_size;
        if bytes.len() < HEADER_SIZE + size {
            warn!(
                "container declares {} bytes but holds {}",
                size,
                bytes.len() - HEADER_SIZE
            );
            return Err(DiskError::FormatError.into());
        }
        debug!(
            "container: {} sectors of {} bytes, boot slots of {} bytes",
            sector_count, sector_size, boot_slot_size
        );

        let geometry = Geometry::checked(sector_size, sector_count)?;
        let mut image = Image::open_memory(geometry.byte_size())?;
        let mut source = HEADER_SIZE;
        for num in 1..=sector_count {
            let length = geometry.sector_len(num);
            let slot = if num <= BOOT_SECTOR_COUNT {
                boot_slot_size
            } else {
                sector_size
            };
            image
                .slice_mut(geometry.offset(num)?, length)?
                .copy_from_slice(&bytes[source..source + length]);
            source += slot;
        }

        Ok(Disk {
            cache: SectorCache::new(image, geometry, DEFAULT_CACHE_CAPACITY),
            flags: header.flags,
            first_bad_sector: header.first_bad_sector,
            boot_slot_size,
        })
    }

    /// Serialize the disk as ATR container bytes, flushing the cache first.
    pub fn to_bytes(&mut self) -> io::Result<Vec<u8>> {
        let geometry = self.geometry();
        let payload = BOOT_SECTOR_COUNT * self.boot_slot_size
            + (geometry.sector_count - BOOT_SECTOR_COUNT) * geometry.sector_size;
        let header = Header {
            paragraphs: (payload / PARAGRAPH_SIZE) as u32,
            sector_size: geometry.sector_size as u16,
            flags: self.flags,
            first_bad_sector: self.first_bad_sector,
        };

        let boot_slot_size = self.boot_slot_size;
        let image = self.cache.image()?;
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload);
        bytes.extend_from_slice(&header.to_bytes());
        for num in 1..=geometry.sector_count {
            let length = geometry.sector_len(num);
            bytes.extend_from_slice(image.slice(geometry.offset(num)?, length)?);
            if num <= BOOT_SECTOR_COUNT && boot_slot_size > length {
                bytes.resize(bytes.len() + boot_slot_size - length, 0);
            }
        }
        Ok(bytes)
    }

    /// Write the disk to an ATR file.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let bytes = self.to_bytes()?;
        let mut image = Image::create(path, bytes.len())?;
        image.slice_mut(0, bytes.len())?.copy_from_slice(&bytes);
        image.flush()
    }

    /// Copy three 128-byte boot sectors from a file.  A short file leaves the
    /// remainder zeroed.
    pub fn install_boot<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DiskError::MissingFile.into())
            }
            Err(e) => return Err(e),
        };
        for num in 1..=BOOT_SECTOR_COUNT {
            let handle = self.cache.init(num)?;
            let start = ((num - 1) * BOOT_SECTOR_SIZE).min(data.len());
            let end = (num * BOOT_SECTOR_SIZE).min(data.len());
            self.cache.buffer_mut(handle)?[..end - start].copy_from_slice(&data[start..end]);
        }
        Ok(())
    }

    /// Write the three boot sectors to a file.
    pub fn save_boot<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let mut data = Vec::with_capacity(BOOT_SECTOR_COUNT * BOOT_SECTOR_SIZE);
        for num in 1..=BOOT_SECTOR_COUNT {
            data.extend_from_slice(&self.cache.read_sector(num)?);
        }
        fs::write(path, data)
    }

    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.cache.geometry()
    }

    #[inline]
    pub fn sector_size(&self) -> usize {
        self.geometry().sector_size
    }

    #[inline]
    pub fn sector_count(&self) -> SectorNum {
        self.geometry().sector_count
    }

    pub fn has_bad_sectors(&self) -> bool {
        self.flags & FLAG_BAD_SECTORS != 0
    }

    pub fn is_write_protected(&self) -> bool {
        self.flags & FLAG_WRITE_PROTECTED != 0
    }

    #[inline]
    pub fn cache(&mut self) -> &mut SectorCache {
        &mut self.cache
    }

    pub fn read_byte(&mut self, num: SectorNum, offset: usize) -> io::Result<u8> {
        self.cache.read_byte(num, offset)
    }

    pub fn write_byte(&mut self, num: SectorNum, offset: usize, value: u8) -> io::Result<()> {
        self.cache.write_byte(num, offset, value)
    }

    pub fn read_word(&mut self, num: SectorNum, offset: usize) -> io::Result<u16> {
        self.cache.read_word(num, offset)
    }

    pub fn write_word(&mut self, num: SectorNum, offset: usize, value: u16) -> io::Result<()> {
        self.cache.write_word(num, offset, value)
    }

    pub fn read_sector(&mut self, num: SectorNum) -> io::Result<Vec<u8>> {
        self.cache.read_sector(num)
    }

    pub fn write_sector(&mut self, num: SectorNum, data: &[u8]) -> io::Result<()> {
        self.cache.write_sector(num, data)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.cache.flush_all()
    }

    /// Write a hex dump of every sector to the provided writer, numbering
    /// bytes by their position in the sector data.
    pub fn dump(&mut self, writer: &mut dyn Write) -> io::Result<()> {
        for num in 1..=self.sector_count() {
            writeln!(writer)?;
            writeln!(writer, "sector {}", num)?;
            let offset = self.geometry().offset(num)?;
            let sector = self.read_sector(num)?;
            writeln!(writer, "{}", util::hex_at(&sector, offset))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_density_bytes() -> Vec<u8> {
        let mut disk = Disk::new(128, 720).unwrap();
        for num in 1..=720 {
            disk.write_word(num, 0, num as u16).unwrap();
        }
        disk.to_bytes().unwrap()
    }

    #[test]
    fn test_header() {
        let bytes = single_density_bytes();
        assert_eq!(bytes.len(), 16 + 720 * 128);
        assert_eq!(&bytes[0..8], &[0x96, 0x02, 0x80, 0x16, 0x80, 0x00, 0x00, 0x00]);
        let header = Header::from_bytes(&bytes).unwrap();
        assert_eq!(header.byte_size(), 720 * 128);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = single_density_bytes();
        bytes[0] = 0x00;
        assert!(Disk::from_bytes(&bytes).err().unwrap() == DiskError::FormatError);
        assert!(Disk::from_bytes(&[0x96]).err().unwrap() == DiskError::FormatError);
    }

    #[test]
    fn test_truncated() {
        let bytes = single_density_bytes();
        let error = Disk::from_bytes(&bytes[..bytes.len() - 1]).err().unwrap();
        assert!(error == DiskError::FormatError);
    }

    #[test]
    fn test_round_trip() {
        let bytes = single_density_bytes();
        let mut disk = Disk::from_bytes(&bytes).unwrap();
        assert_eq!(disk.sector_count(), 720);
        assert_eq!(disk.read_word(719, 0).unwrap(), 719);
        assert_eq!(disk.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_double_density_layout() {
        let mut disk = Disk::new(256, 720).unwrap();
        disk.write_byte(3, 127, 0x33).unwrap();
        disk.write_byte(4, 255, 0x44).unwrap();
        let bytes = disk.to_bytes().unwrap();
        assert_eq!(bytes.len(), 16 + 3 * 128 + 717 * 256);
        assert_eq!(bytes[16 + 3 * 128 - 1], 0x33);
        assert_eq!(bytes[16 + 3 * 128 + 255], 0x44);
        let mut reloaded = Disk::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.sector_count(), 720);
        assert_eq!(reloaded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_full_size_boot_slots() {
        // Boot sectors stored in 256-byte slots: the size is a multiple of 256.
        let size = 720 * 256;
        let mut bytes = vec![0u8; HEADER_SIZE + size];
        bytes[..HEADER_SIZE].copy_from_slice(
            &Header {
                paragraphs: (size / 16) as u32,
                sector_size: 256,
                flags: 0x20,
                first_bad_sector: 0,
            }
            .to_bytes(),
        );
        bytes[HEADER_SIZE + 256] = 0x02; // sector 2, first byte
        bytes[HEADER_SIZE + 3 * 256] = 0x04; // sector 4, first byte
        let mut disk = Disk::from_bytes(&bytes).unwrap();
        assert_eq!(disk.sector_count(), 720);
        assert!(disk.is_write_protected());
        assert_eq!(disk.read_byte(2, 0).unwrap(), 0x02);
        assert_eq!(disk.read_byte(4, 0).unwrap(), 0x04);
        assert_eq!(disk.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_high_size_word() {
        // 65535 sectors of 256 bytes exceed the 16-bit paragraph count.
        let mut disk = Disk::new(256, 0x2000).unwrap();
        let bytes = disk.to_bytes().unwrap();
        let header = Header::from_bytes(&bytes).unwrap();
        assert!(header.paragraphs > 0xffff);
        assert_eq!(bytes[6], (header.paragraphs >> 16) as u8);
        let reloaded = Disk::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.sector_count(), 0x2000);
    }

    #[test]
    fn test_save_load_and_boot() {
        let dir = tempfile::tempdir().unwrap();
        let boot_path = dir.path().join("boot.bin");
        let atr_path = dir.path().join("disk.atr");
        let boot: Vec<u8> = (0..384).map(|i| i as u8).collect();
        fs::write(&boot_path, &boot).unwrap();

        let mut disk = Disk::new(128, 720).unwrap();
        disk.install_boot(&boot_path).unwrap();
        disk.save(&atr_path).unwrap();

        let mut loaded = Disk::load(&atr_path).unwrap();
        assert_eq!(loaded.read_byte(3, 127).unwrap(), 0x7f);
        let copy_path = dir.path().join("boot2.bin");
        loaded.save_boot(&copy_path).unwrap();
        assert_eq!(fs::read(&copy_path).unwrap(), boot);

        let missing = loaded.install_boot(dir.path().join("missing.bin"));
        assert!(missing.err().unwrap() == DiskError::MissingFile);
    }

    #[test]
    fn test_dump() {
        let mut disk = Disk::new(256, 4).unwrap();
        disk.write_byte(4, 1, b'A').unwrap();
        let mut out = vec![];
        disk.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("\nsector 1\n0000: 00"));
        // Sector 4 follows the three 128-byte boot sectors.
        assert!(text.contains("\nsector 4\n0180: 00 41 00"));
        assert_eq!(text.matches("sector ").count(), 4);
    }
}
