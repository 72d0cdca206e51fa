use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use log::{debug, info};

use crate::atascii::AtariName;
use crate::disk::chain::ChainFormat;
use crate::disk::directory::{
    format_directory, Dos2Dir, DIRECTORY_SECTOR_COUNT, FIRST_DIRECTORY_SECTOR,
};
use crate::disk::error::DiskError;
use crate::disk::validation::{self, ValidationError};
use crate::disk::vtoc::{AllocatorRef, ExpandedVtoc, SimpleVtoc};
use crate::disk::{Directory, DiskRef, FileOps, Filesystem, Property, SectorNum};

/// Boot sector fields shared by all DOS 2 family variants.
const BOOT_SECTOR: SectorNum = 1;
const BUFFERS: Property = Property {
    name: "BUFFERS",
    sector: BOOT_SECTOR,
    offset: 0x09,
    size: 1,
};

/// Which bitmap layout a variant uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorKind {
    /// DOS 2.0, or DOS 2.5 with its second bitmap sector on enhanced
    /// density disks.
    Simple,
    /// A bitmap growing downward from sector 360 as the disk requires.
    Expanded {
        max_disk_size: SectorNum,
        reserve_720: bool,
    },
}

impl AllocatorKind {
    fn create(&self, disk: DiskRef) -> AllocatorRef {
        match *self {
            AllocatorKind::Simple => Rc::new(RefCell::new(SimpleVtoc::new(disk))),
            AllocatorKind::Expanded {
                max_disk_size,
                reserve_720,
            } => Rc::new(RefCell::new(ExpandedVtoc::new(
                disk,
                max_disk_size,
                reserve_720,
            ))),
        }
    }
}

/// Whether chain trailers carry the owning file's directory index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileNumbers {
    Always,
    /// Only on disks whose VTOC is version 2, i.e. those small enough for
    /// ten-bit links.
    Version2Only,
}

/// Everything that distinguishes one DOS 2 family variant from another.
#[derive(Clone, Copy, Debug)]
pub struct Dos2Config {
    pub name: &'static str,
    pub properties: &'static [Property],
    /// Offsets of the low and high bytes of the DOS.SYS first sector in the
    /// boot sector.
    pub dos_pointer: (usize, usize),
    pub allocator: AllocatorKind,
    pub file_numbers: FileNumbers,
    /// Mark every file DOS 2 compatible regardless of where its sectors lie.
    pub force_dos2_flag: bool,
    pub subdirectories: bool,
}

static DOS2_PROPERTIES: [Property; 2] = [
    Property {
        name: "DRIVES",
        sector: BOOT_SECTOR,
        offset: 0x0A,
        size: 1,
    },
    BUFFERS,
];

static MYDOS_PROPERTIES: [Property; 3] = [
    BUFFERS,
    Property {
        name: "RAMDISK_UNIT",
        sector: BOOT_SECTOR,
        offset: 0x0A,
        size: 1,
    },
    Property {
        name: "DEFAULT_UNIT",
        sector: BOOT_SECTOR,
        offset: 0x0B,
        size: 1,
    },
];

static DOS_II_PLUS_PROPERTIES: [Property; 2] = [
    BUFFERS,
    Property {
        name: "RAMDISK",
        sector: BOOT_SECTOR,
        offset: 0x0E,
        size: 1,
    },
];

static XDOS_PROPERTIES: [Property; 3] = [
    BUFFERS,
    Property {
        name: "RAMDISK",
        sector: BOOT_SECTOR,
        offset: 0x0B,
        size: 1,
    },
    Property {
        name: "COLOR",
        sector: BOOT_SECTOR,
        offset: 0x10,
        size: 1,
    },
];

/// Atari DOS 2.0, and DOS 2.5 on enhanced density disks.
pub static DOS2_CONFIG: Dos2Config = Dos2Config {
    name: "2",
    properties: &DOS2_PROPERTIES,
    dos_pointer: (0x0F, 0x10),
    allocator: AllocatorKind::Simple,
    file_numbers: FileNumbers::Always,
    force_dos2_flag: false,
    subdirectories: false,
};

pub static MYDOS_CONFIG: Dos2Config = Dos2Config {
    name: "mydos",
    properties: &MYDOS_PROPERTIES,
    dos_pointer: (0x10, 0x11),
    allocator: AllocatorKind::Expanded {
        max_disk_size: 65535,
        reserve_720: false,
    },
    file_numbers: FileNumbers::Version2Only,
    force_dos2_flag: false,
    subdirectories: true,
};

pub static DOS_II_PLUS_CONFIG: Dos2Config = Dos2Config {
    name: "II+",
    properties: &DOS_II_PLUS_PROPERTIES,
    dos_pointer: (0x3D, 0x3F),
    allocator: AllocatorKind::Expanded {
        max_disk_size: 1023,
        reserve_720: true,
    },
    file_numbers: FileNumbers::Always,
    force_dos2_flag: true,
    subdirectories: false,
};

pub static XDOS_CONFIG: Dos2Config = Dos2Config {
    name: "xdos",
    properties: &XDOS_PROPERTIES,
    dos_pointer: (0x32, 0x34),
    allocator: AllocatorKind::Expanded {
        max_disk_size: 1023,
        reserve_720: true,
    },
    file_numbers: FileNumbers::Always,
    force_dos2_flag: true,
    subdirectories: false,
};

/// The parts of a mounted filesystem that directories and open files share.
#[derive(Clone)]
pub struct Volume {
    pub disk: DiskRef,
    pub allocator: AllocatorRef,
    pub chain: ChainFormat,
    pub subdirectories: bool,
    pub force_dos2_flag: bool,
}

/// A DOS 2 family filesystem: one bitmap allocator, one 64-entry root
/// directory at sector 361, and files as sector chains.
pub struct Dos2 {
    volume: Volume,
    config: Dos2Config,
    name: &'static str,
}

impl Dos2 {
    /// Mount an already formatted disk.
    pub fn new(disk: DiskRef, config: &Dos2Config) -> io::Result<Dos2> {
        let allocator = config.allocator.create(disk.clone());
        let chain = match config.file_numbers {
            FileNumbers::Always => ChainFormat::FileNumbered,
            FileNumbers::Version2Only => match allocator.borrow().version()? {
                2 => ChainFormat::FileNumbered,
                _ => ChainFormat::WideLink,
            },
        };
        let name = match config.allocator {
            AllocatorKind::Simple if SimpleVtoc::new(disk.clone()).is_enhanced() => "2.5",
            _ => config.name,
        };
        debug!("dos2: mounted DOS {} with {:?} chains", name, chain);
        Ok(Dos2 {
            volume: Volume {
                disk,
                allocator,
                chain,
                subdirectories: config.subdirectories,
                force_dos2_flag: config.force_dos2_flag,
            },
            config: *config,
            name,
        })
    }

    /// Write an empty bitmap and root directory, then mount the result.
    pub fn format(disk: DiskRef, config: &Dos2Config) -> io::Result<Dos2> {
        let sector_count = disk.borrow().sector_count();
        if sector_count < FIRST_DIRECTORY_SECTOR + DIRECTORY_SECTOR_COUNT - 1 {
            return Err(DiskError::FormatError.into());
        }
        config.allocator.create(disk.clone()).borrow_mut().format()?;
        format_directory(&mut disk.borrow_mut(), FIRST_DIRECTORY_SECTOR)?;
        let dos2 = Dos2::new(disk, config)?;
        info!(
            "dos2: formatted {} sectors as DOS {}",
            sector_count, dos2.name
        );
        Ok(dos2)
    }

    pub fn config(&self) -> &Dos2Config {
        &self.config
    }

    pub fn allocator(&self) -> AllocatorRef {
        self.volume.allocator.clone()
    }

    pub fn chain_format(&self) -> ChainFormat {
        self.volume.chain
    }
}

impl Filesystem for Dos2 {
    fn name(&self) -> &str {
        self.name
    }

    fn disk(&self) -> DiskRef {
        self.volume.disk.clone()
    }

    fn properties(&self) -> &'static [Property] {
        self.config.properties
    }

    fn free_sector_count(&self) -> io::Result<usize> {
        self.volume.allocator.borrow().free_sector_count()
    }

    fn get_dos_first_sector(&self) -> io::Result<SectorNum> {
        let (lo, hi) = self.config.dos_pointer;
        let mut disk = self.volume.disk.borrow_mut();
        let lo = disk.read_byte(BOOT_SECTOR, lo)? as SectorNum;
        let hi = disk.read_byte(BOOT_SECTOR, hi)? as SectorNum;
        Ok(lo | hi << 8)
    }

    fn set_dos_first_sector(&mut self, sector: SectorNum) -> io::Result<()> {
        let (lo, hi) = self.config.dos_pointer;
        let mut disk = self.volume.disk.borrow_mut();
        disk.write_byte(BOOT_SECTOR, lo, sector as u8)?;
        disk.write_byte(BOOT_SECTOR, hi, (sector >> 8) as u8)
    }

    fn root_dir(&self) -> io::Result<Box<dyn Directory>> {
        Ok(Box::new(Dos2Dir::open(
            self.volume.clone(),
            FIRST_DIRECTORY_SECTOR,
        )?))
    }

    fn create_file(&mut self, name: &AtariName) -> io::Result<Box<dyn FileOps>> {
        Dos2Dir::open(self.volume.clone(), FIRST_DIRECTORY_SECTOR)?.create_file(name)
    }

    fn validate(&self) -> io::Result<Vec<ValidationError>> {
        validation::validate(&self.volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Disk;

    fn disk(sector_size: usize, sector_count: SectorNum) -> DiskRef {
        Rc::new(RefCell::new(Disk::new(sector_size, sector_count).unwrap()))
    }

    fn name(text: &str) -> AtariName {
        text.parse().unwrap()
    }

    #[test]
    fn test_format_names() {
        let dos2 = Dos2::format(disk(128, 720), &DOS2_CONFIG).unwrap();
        assert_eq!(dos2.name(), "2");
        assert_eq!(dos2.free_sector_count().unwrap(), 707);
        let dos25 = Dos2::format(disk(128, 1040), &DOS2_CONFIG).unwrap();
        assert_eq!(dos25.name(), "2.5");
        assert_eq!(dos25.free_sector_count().unwrap(), 1010);
        let double = Dos2::format(disk(256, 720), &DOS2_CONFIG).unwrap();
        assert_eq!(double.name(), "2");
        let error = Dos2::format(disk(128, 360), &DOS2_CONFIG).err().unwrap();
        assert!(error == DiskError::FormatError);
    }

    #[test]
    fn test_chain_format_follows_vtoc_version() {
        let small = Dos2::format(disk(128, 720), &MYDOS_CONFIG).unwrap();
        assert_eq!(small.chain_format(), ChainFormat::FileNumbered);
        let large = Dos2::format(disk(256, 2880), &MYDOS_CONFIG).unwrap();
        assert_eq!(large.chain_format(), ChainFormat::WideLink);
        let xdos = Dos2::format(disk(128, 1040), &XDOS_CONFIG).unwrap();
        assert_eq!(xdos.chain_format(), ChainFormat::FileNumbered);
    }

    #[test]
    fn test_dos_first_sector() {
        let disk = disk(128, 720);
        let mut fs = Dos2::format(disk.clone(), &DOS_II_PLUS_CONFIG).unwrap();
        fs.set_dos_first_sector(0x123).unwrap();
        assert_eq!(fs.get_dos_first_sector().unwrap(), 0x123);
        assert_eq!(disk.borrow_mut().read_byte(1, 0x3D).unwrap(), 0x23);
        assert_eq!(disk.borrow_mut().read_byte(1, 0x3E).unwrap(), 0);
        assert_eq!(disk.borrow_mut().read_byte(1, 0x3F).unwrap(), 0x01);
    }

    #[test]
    fn test_properties() {
        let mut fs = Dos2::format(disk(128, 720), &XDOS_CONFIG).unwrap();
        let color = fs.find_property("COLOR").unwrap();
        fs.set_property(color, "$94").unwrap();
        assert_eq!(fs.get_property(color).unwrap(), "$94");
        assert!(fs.find_property("DRIVES").is_none());
    }

    #[test]
    fn test_remount() {
        let disk = disk(128, 1040);
        {
            let mut fs = Dos2::format(disk.clone(), &MYDOS_CONFIG).unwrap();
            let mut file = fs.create_file(&name("KEEP.ME")).unwrap();
            file.write_bytes(b"persistent").unwrap();
        }
        let fs = Dos2::new(disk, &MYDOS_CONFIG).unwrap();
        assert_eq!(fs.chain_format(), ChainFormat::WideLink);
        let dir = fs.root_dir().unwrap();
        assert_eq!(dir.name(), "KEEP.ME");
        assert_eq!(dir.open_file().unwrap().read_to_vec().unwrap(), b"persistent");
        assert_eq!(fs.free_sector_count().unwrap(), 1026);
    }

    #[test]
    fn test_subdirectories() {
        let mut fs = Dos2::format(disk(128, 720), &MYDOS_CONFIG).unwrap();
        {
            let mut root = fs.root_dir().unwrap();
            let mut sub = root.create_dir(&name("GAMES")).unwrap();
            assert!(sub.at_end());
            let mut file = sub.create_file(&name("PACMAN.COM")).unwrap();
            file.write_bytes(&[0xFF, 0xFF, 0x00, 0x20]).unwrap();
        }
        fs.create_file(&name("README")).unwrap().close().unwrap();
        assert_eq!(fs.free_sector_count().unwrap(), 708 - 9);

        let mut root = fs.root_dir().unwrap();
        assert!(root.is_dir());
        assert_eq!(root.sec_size(), 8);
        assert_eq!(root.size().unwrap(), 0);
        assert!(root.open_file().err().unwrap() == DiskError::MissingFile);
        let mut sub = root.open_dir().unwrap();
        assert_eq!(sub.names().unwrap(), vec!["PACMAN.COM"]);
        root.next().unwrap();
        assert!(!root.is_dir());
        assert!(root.open_dir().err().unwrap() == DiskError::NotADirectory);
        assert!(fs.validate().unwrap().is_empty());
    }

    #[test]
    fn test_no_subdirectories_on_dos2() {
        let fs = Dos2::format(disk(128, 720), &DOS2_CONFIG).unwrap();
        let mut root = fs.root_dir().unwrap();
        let error = root.create_dir(&name("GAMES")).err().unwrap();
        assert!(error == DiskError::UnsupportedOperation);
    }

    #[test]
    fn test_forced_dos2_flag() {
        let mut fs = Dos2::format(disk(128, 1040), &DOS_II_PLUS_CONFIG).unwrap();
        {
            let mut file = fs.create_file(&name("BIG")).unwrap();
            file.write_bytes(&vec![0x55; 125 * 720]).unwrap();
        }
        let dir = fs.root_dir().unwrap();
        let flags = Dos2Dir::open(fs.volume.clone(), FIRST_DIRECTORY_SECTOR)
            .unwrap()
            .entry()
            .flags;
        assert_eq!(flags & crate::disk::directory::FLAG_DOS2, 0x02);
        assert_eq!(dir.sec_size(), 720);
    }
}
