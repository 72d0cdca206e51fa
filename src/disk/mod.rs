//! Traits, structs, and functions relating to disk images.

mod cache;
mod chain;
mod container;
mod dos2;
mod error;
mod format;
mod image;
mod rkdos;
mod sparta;
mod validation;
mod vtoc;

pub mod directory;
pub mod file;

use std::cell::RefCell;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::rc::Rc;

use crate::atascii::AtariName;
use crate::util;

pub use self::cache::{SectorCache, SectorHandle, DEFAULT_CACHE_CAPACITY};
pub use self::chain::ChainFormat;
pub use self::container::{Disk, Header};
pub use self::dos2::{
    AllocatorKind, Dos2, Dos2Config, FileNumbers, Volume, DOS2_CONFIG, DOS_II_PLUS_CONFIG,
    MYDOS_CONFIG, XDOS_CONFIG,
};
pub use self::error::DiskError;
pub use self::format::{detect, install, DosType};
pub use self::rkdos::{RkDir, RkDos, RkFile};
pub use self::sparta::{SpartaDir, SpartaDos, SpartaFile};
pub use self::validation::ValidationError;
pub use self::vtoc::{Allocator, AllocatorRef, ExpandedVtoc, SimpleVtoc};

/// Sector numbers are 1-based.
pub type SectorNum = usize;

/// Shared handle to a virtual disk.  Filesystems, directories, and open
/// files each hold one, so several can be alive at once.
pub type DiskRef = Rc<RefCell<Disk>>;

/// The first three sectors are boot sectors and always hold 128 bytes.
pub const BOOT_SECTOR_COUNT: usize = 3;
pub const BOOT_SECTOR_SIZE: usize = 128;

/// The sector layout of a disk image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: usize,
    pub sector_count: SectorNum,
}

impl Geometry {
    pub fn new(sector_size: usize, sector_count: SectorNum) -> Geometry {
        Geometry {
            sector_size,
            sector_count,
        }
    }

    /// Like `new`, but only for sector sizes the platform uses and disks with
    /// at least the boot sectors.
    pub fn checked(sector_size: usize, sector_count: SectorNum) -> io::Result<Geometry> {
        match sector_size {
            128 | 256 | 512 if sector_count >= BOOT_SECTOR_COUNT => {
                Ok(Geometry::new(sector_size, sector_count))
            }
            _ => Err(DiskError::FormatError.into()),
        }
    }

    /// Length of sector `num`.
    #[inline]
    pub fn sector_len(&self, num: SectorNum) -> usize {
        if num <= BOOT_SECTOR_COUNT {
            BOOT_SECTOR_SIZE
        } else {
            self.sector_size
        }
    }

    /// Offset of sector `num` in the flat sector space.
    pub fn offset(&self, num: SectorNum) -> io::Result<usize> {
        if num < 1 || num > self.sector_count {
            return Err(DiskError::InvalidSector.into());
        }
        Ok(if num <= BOOT_SECTOR_COUNT {
            (num - 1) * BOOT_SECTOR_SIZE
        } else {
            BOOT_SECTOR_COUNT * BOOT_SECTOR_SIZE + (num - 1 - BOOT_SECTOR_COUNT) * self.sector_size
        })
    }

    /// Size of the flat sector space in bytes.
    pub fn byte_size(&self) -> usize {
        let boot = self.sector_count.min(BOOT_SECTOR_COUNT);
        boot * BOOT_SECTOR_SIZE + (self.sector_count - boot) * self.sector_size
    }
}

/// A named configuration field in the boot sectors, such as the number of
/// DOS buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Property {
    pub name: &'static str,
    pub sector: SectorNum,
    pub offset: usize,
    pub size: usize,
}

impl Property {
    /// Render the current value: `$xx` style hex for one- and two-byte
    /// fields, the raw characters for longer ones.
    pub fn read(&self, disk: &mut Disk) -> io::Result<String> {
        let mut bytes = Vec::with_capacity(self.size);
        for i in 0..self.size {
            bytes.push(disk.read_byte(self.sector, self.offset + i)?);
        }
        Ok(match self.size {
            1 => format!("${:02x}", bytes[0]),
            2 => format!("${:04x}", bytes[0] as u16 | (bytes[1] as u16) << 8),
            _ => bytes.iter().map(|&b| b as char).collect(),
        })
    }

    /// Store a value given as `$hex` or decimal for numeric fields, or as
    /// text (space padded) for longer ones.
    pub fn write(&self, disk: &mut Disk, value: &str) -> io::Result<()> {
        let value = value.trim_start();
        if self.size > 2 {
            let text = value.trim_end().as_bytes();
            if text.len() > self.size {
                return Err(DiskError::InvalidProperty.into());
            }
            for i in 0..self.size {
                let b = text.get(i).cloned().unwrap_or(b' ');
                disk.write_byte(self.sector, self.offset + i, b)?;
            }
            return Ok(());
        }

        let number = match value.strip_prefix('$') {
            Some(hex) => u32::from_str_radix(hex.trim_end(), 16),
            None => value.trim_end().parse::<u32>(),
        }
        .map_err(|_| DiskError::InvalidProperty.to_io_error())?;
        if number >> (8 * self.size) != 0 {
            return Err(DiskError::InvalidProperty.into());
        }
        for i in 0..self.size {
            disk.write_byte(self.sector, self.offset + i, (number >> (8 * i)) as u8)?;
        }
        Ok(())
    }
}

/// All filesystem variants implement the `Filesystem` trait, and most
/// operations can be performed polymorphically using it as a trait object.
pub trait Filesystem {
    /// Short variant name, as accepted by `install`.
    fn name(&self) -> &str;
    fn disk(&self) -> DiskRef;
    fn properties(&self) -> &'static [Property];
    fn free_sector_count(&self) -> io::Result<usize>;
    /// First sector of the DOS.SYS file as recorded in the boot sector.
    fn get_dos_first_sector(&self) -> io::Result<SectorNum>;
    fn set_dos_first_sector(&mut self, sector: SectorNum) -> io::Result<()>;
    fn root_dir(&self) -> io::Result<Box<dyn Directory>>;
    fn create_file(&mut self, name: &AtariName) -> io::Result<Box<dyn FileOps>>;

    /// Check the consistency of the disk image.  This is a read-only
    /// operation and does not attempt any repairs.
    fn validate(&self) -> io::Result<Vec<ValidationError>> {
        Ok(vec![])
    }

    fn find_property(&self, name: &str) -> Option<&'static Property> {
        self.properties().iter().find(|p| p.name == name)
    }

    fn get_property(&self, property: &Property) -> io::Result<String> {
        property.read(&mut self.disk().borrow_mut())
    }

    fn set_property(&mut self, property: &Property, value: &str) -> io::Result<()> {
        property.write(&mut self.disk().borrow_mut(), value)
    }
}

/// A cursor over the entries of one directory.  It moves forward only and
/// cannot be restarted; ask the filesystem for a new one instead.
pub trait Directory {
    fn at_end(&self) -> bool;
    fn next(&mut self) -> io::Result<()>;
    /// The raw name of the current entry.
    fn raw_name(&self) -> AtariName;
    /// Size of the current entry in sectors.
    fn sec_size(&self) -> usize;
    /// Size of the current entry in bytes.
    fn size(&self) -> io::Result<usize>;
    fn first_sector(&self) -> SectorNum;
    fn open_file(&self) -> io::Result<Box<dyn FileOps>>;
    /// Create a file in this directory.  The returned file is in write mode
    /// and its entry is finalized when it is closed.
    fn create_file(&mut self, name: &AtariName) -> io::Result<Box<dyn FileOps>>;

    /// The escaped name of the current entry.
    fn name(&self) -> String {
        self.raw_name().to_escaped_string()
    }

    fn is_deleted(&self) -> bool {
        false
    }

    fn is_dir(&self) -> bool {
        false
    }

    fn open_dir(&self) -> io::Result<Box<dyn Directory>> {
        Err(DiskError::NotADirectory.into())
    }

    fn create_dir(&mut self, _name: &AtariName) -> io::Result<Box<dyn Directory>> {
        Err(DiskError::UnsupportedOperation.into())
    }

    /// Consume the cursor, returning the escaped names of the live
    /// (non-deleted) entries in directory order.
    fn names(&mut self) -> io::Result<Vec<String>> {
        let mut names = vec![];
        while !self.at_end() {
            if !self.is_deleted() {
                names.push(self.name());
            }
            self.next()?;
        }
        Ok(names)
    }
}

/// Byte-oriented access to a file.  Bulk operations are built on the
/// single-byte primitives.
pub trait FileOps {
    fn eof(&mut self) -> io::Result<bool>;
    /// Read one byte, failing with `EndOfFile` past the end.
    fn read_byte(&mut self) -> io::Result<u8>;
    fn write_byte(&mut self, byte: u8) -> io::Result<()>;
    fn first_sector(&self) -> SectorNum;

    /// Finish writing: stamp the last sector and finalize the directory
    /// entry.  Dropping a file closes it too, but swallows errors.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        for b in buf.iter_mut() {
            *b = self.read_byte()?;
        }
        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        data.iter().try_for_each(|&b| self.write_byte(b))
    }

    /// Read everything up to the end of the file.
    fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut data = vec![];
        while !self.eof()? {
            data.push(self.read_byte()?);
        }
        Ok(data)
    }

    /// Copy the file's contents to a host file.
    fn save(&mut self, path: &Path) -> io::Result<()> {
        let data = self.read_to_vec()?;
        fs::write(path, data)
    }

    /// Write a hex dump of the file's contents.
    fn dump(&mut self, writer: &mut dyn Write) -> io::Result<()> {
        let data = self.read_to_vec()?;
        writeln!(writer, "{}", util::hex(&data))
    }

    /// Append a host file's contents to this file.
    fn import(&mut self, path: &Path) -> io::Result<()> {
        let mut source = match fs::File::open(path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DiskError::MissingFile.into())
            }
            Err(e) => return Err(e),
        };
        let mut data = vec![];
        source.read_to_end(&mut data)?;
        self.write_bytes(&data)
    }
}

impl<'a> Read for dyn FileOps + 'a {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut count = 0;
        while count < buf.len() && !self.eof()? {
            buf[count] = self.read_byte()?;
            count += 1;
        }
        Ok(count)
    }
}

impl<'a> Write for dyn FileOps + 'a {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Load an ATR file and detect its filesystem.
pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn Filesystem>> {
    let disk = Rc::new(RefCell::new(Disk::load(path)?));
    detect(disk)
}

/// Create a blank disk and format it with the named DOS.
pub fn create(
    sector_size: usize,
    sector_count: SectorNum,
    dos: &str,
) -> io::Result<Box<dyn Filesystem>> {
    let disk = Rc::new(RefCell::new(Disk::new(sector_size, sector_count)?));
    install(disk, dos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let geometry = Geometry::new(256, 720);
        assert_eq!(geometry.offset(1).unwrap(), 0);
        assert_eq!(geometry.offset(3).unwrap(), 256);
        assert_eq!(geometry.offset(4).unwrap(), 384);
        assert_eq!(geometry.offset(5).unwrap(), 640);
        assert_eq!(geometry.byte_size(), 384 + 717 * 256);
        assert!(geometry.offset(0).is_err());
        assert!(geometry.offset(721).is_err());
        assert!(Geometry::checked(100, 720).is_err());
    }

    #[test]
    fn test_property_values() {
        let mut disk = Disk::new(128, 720).unwrap();
        let buffers = Property {
            name: "BUFFERS",
            sector: 1,
            offset: 0x09,
            size: 1,
        };
        buffers.write(&mut disk, "$0a").unwrap();
        assert_eq!(buffers.read(&mut disk).unwrap(), "$0a");
        buffers.write(&mut disk, " 7").unwrap();
        assert_eq!(disk.read_byte(1, 0x09).unwrap(), 7);
        assert!(buffers.write(&mut disk, "256").unwrap_err() == DiskError::InvalidProperty);
        assert!(buffers.write(&mut disk, "$zz").unwrap_err() == DiskError::InvalidProperty);

        let name = Property {
            name: "NAME",
            sector: 1,
            offset: 0x16,
            size: 8,
        };
        name.write(&mut disk, "GAMES").unwrap();
        assert_eq!(name.read(&mut disk).unwrap(), "GAMES   ");
        assert!(name.write(&mut disk, "TOO LONG!").unwrap_err() == DiskError::InvalidProperty);
    }
}
