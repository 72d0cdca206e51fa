//! Filesystem variant detection and installation.

use std::fmt;
use std::io;

use log::{debug, info};

use crate::disk::container::Disk;
use crate::disk::dos2::{Dos2, DOS2_CONFIG, DOS_II_PLUS_CONFIG, MYDOS_CONFIG, XDOS_CONFIG};
use crate::disk::error::DiskError;
use crate::disk::rkdos::RkDos;
use crate::disk::sparta::SpartaDos;
use crate::disk::{DiskRef, Filesystem};

/// The filesystem variants this crate knows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DosType {
    Dos2,
    MyDos,
    DosIIPlus,
    XDos,
    RkDos,
    Sparta,
}

/// Boot sector bytes at fixed offsets that identify a variant.
struct Signature {
    dos: DosType,
    bytes: &'static [(usize, u8)],
}

/// Checked in order; the first match wins.
static SIGNATURES: [Signature; 5] = [
    Signature {
        dos: DosType::XDos,
        bytes: &[(0x00, 0x58), (0x31, 0xA0), (0x33, 0xA2)],
    },
    Signature {
        dos: DosType::DosIIPlus,
        bytes: &[(0x00, 0xC4), (0x3C, 0xA0), (0x3E, 0xA9)],
    },
    Signature {
        dos: DosType::RkDos,
        bytes: &[(0x06, b'R'), (0x07, b'K')],
    },
    Signature {
        dos: DosType::Sparta,
        bytes: &[(0x06, 0x4C), (0x07, 0x80), (0x08, 0x30)],
    },
    Signature {
        dos: DosType::Sparta,
        bytes: &[(0x06, 0x4C), (0x07, 0x40), (0x08, 0x04)],
    },
];

const MYDOS_SIGNATURE: u8 = b'M';

impl DosType {
    /// Identify the variant from the boot sector.  Disks matching no
    /// signature are taken to be DOS 2.
    pub fn detect(disk: &mut Disk) -> io::Result<DosType> {
        let boot = disk.read_sector(1)?;
        let matches = |signature: &Signature| {
            signature
                .bytes
                .iter()
                .all(|&(offset, value)| boot.get(offset) == Some(&value))
        };
        let dos = match SIGNATURES.iter().find(|s| matches(*s)) {
            Some(signature) => signature.dos,
            None if boot[0] == MYDOS_SIGNATURE => DosType::MyDos,
            None => DosType::Dos2,
        };
        debug!("format: boot sector identifies {}", dos);
        Ok(dos)
    }

    /// Look up a variant by the name `install` accepts.
    pub fn from_name(name: &str) -> io::Result<DosType> {
        match name.to_ascii_lowercase().as_str() {
            "2" | "2.0" | "2.5" => Ok(DosType::Dos2),
            "mydos" => Ok(DosType::MyDos),
            "ii+" => Ok(DosType::DosIIPlus),
            "xdos" => Ok(DosType::XDos),
            "rkdos" => Ok(DosType::RkDos),
            "sparta" => Ok(DosType::Sparta),
            _ => Err(DiskError::UnknownDos.into()),
        }
    }

    /// Mount a disk already formatted with this variant.
    pub fn mount(&self, disk: DiskRef) -> io::Result<Box<dyn Filesystem>> {
        Ok(match self {
            DosType::Dos2 => Box::new(Dos2::new(disk, &DOS2_CONFIG)?),
            DosType::MyDos => Box::new(Dos2::new(disk, &MYDOS_CONFIG)?),
            DosType::DosIIPlus => Box::new(Dos2::new(disk, &DOS_II_PLUS_CONFIG)?),
            DosType::XDos => Box::new(Dos2::new(disk, &XDOS_CONFIG)?),
            DosType::RkDos => Box::new(RkDos::new(disk)?),
            DosType::Sparta => Box::new(SpartaDos::new(disk)?),
        })
    }

    /// Write an empty filesystem of this variant.
    pub fn format(&self, disk: DiskRef) -> io::Result<Box<dyn Filesystem>> {
        Ok(match self {
            DosType::Dos2 => Box::new(Dos2::format(disk, &DOS2_CONFIG)?),
            DosType::MyDos => Box::new(Dos2::format(disk, &MYDOS_CONFIG)?),
            DosType::DosIIPlus => Box::new(Dos2::format(disk, &DOS_II_PLUS_CONFIG)?),
            DosType::XDos => Box::new(Dos2::format(disk, &XDOS_CONFIG)?),
            DosType::RkDos => Box::new(RkDos::format(disk)?),
            DosType::Sparta => return Err(DiskError::UnsupportedOperation.into()),
        })
    }
}

impl fmt::Display for DosType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DosType::Dos2 => "DOS 2",
            DosType::MyDos => "MyDOS",
            DosType::DosIIPlus => "DOS II+",
            DosType::XDos => "XDOS",
            DosType::RkDos => "RK-DOS",
            DosType::Sparta => "SpartaDOS",
        };
        f.write_str(name)
    }
}

/// Identify the filesystem on a disk and mount it.
pub fn detect(disk: DiskRef) -> io::Result<Box<dyn Filesystem>> {
    let dos = DosType::detect(&mut disk.borrow_mut())?;
    dos.mount(disk)
}

/// Format a disk with the named variant.  Names are matched without regard
/// to case: `2`, `2.0`, `2.5`, `mydos`, `II+`, `xdos`, `rkdos`.  SpartaDOS
/// disks can be read but not created.
pub fn install(disk: DiskRef, name: &str) -> io::Result<Box<dyn Filesystem>> {
    let dos = DosType::from_name(name)?;
    let fs = dos.format(disk)?;
    info!("format: installed {} ({})", dos, fs.name());
    Ok(fs)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn blank(sector_size: usize, sector_count: usize) -> DiskRef {
        Rc::new(RefCell::new(Disk::new(sector_size, sector_count).unwrap()))
    }

    fn with_boot(bytes: &[(usize, u8)]) -> Disk {
        let mut disk = Disk::new(128, 720).unwrap();
        for &(offset, value) in bytes {
            disk.write_byte(1, offset, value).unwrap();
        }
        disk
    }

    #[test]
    fn test_detect_signatures() {
        let cases: &[(&[(usize, u8)], DosType)] = &[
            (&[], DosType::Dos2),
            (&[(0x00, b'M')], DosType::MyDos),
            (&[(0x00, 0x58), (0x31, 0xA0), (0x33, 0xA2)], DosType::XDos),
            (&[(0x00, 0x58), (0x31, 0xA0)], DosType::Dos2),
            (&[(0x00, 0xC4), (0x3C, 0xA0), (0x3E, 0xA9)], DosType::DosIIPlus),
            (&[(0x06, 0x4C), (0x07, 0x80), (0x08, 0x30)], DosType::Sparta),
            (&[(0x06, 0x4C), (0x07, 0x40), (0x08, 0x04)], DosType::Sparta),
            (&[(0x06, 0x4C), (0x07, 0x40), (0x08, 0x30)], DosType::Dos2),
            (&[(0x06, b'R'), (0x07, b'K')], DosType::RkDos),
            (&[(0x06, b'R')], DosType::Dos2),
            // RK-DOS is checked before MyDOS.
            (&[(0x00, b'M'), (0x06, b'R'), (0x07, b'K')], DosType::RkDos),
            // DOS II+ is checked before RK-DOS.
            (
                &[(0x00, 0xC4), (0x3C, 0xA0), (0x3E, 0xA9), (0x06, b'R'), (0x07, b'K')],
                DosType::DosIIPlus,
            ),
            // The SpartaDOS signature wins over a leading 'M'.
            (
                &[(0x00, b'M'), (0x06, 0x4C), (0x07, 0x80), (0x08, 0x30)],
                DosType::Sparta,
            ),
        ];
        for (bytes, expected) in cases {
            let mut disk = with_boot(bytes);
            assert_eq!(DosType::detect(&mut disk).unwrap(), *expected);
        }
    }

    #[test]
    fn test_install_names() {
        assert_eq!(install(blank(128, 720), "2").unwrap().name(), "2");
        assert_eq!(install(blank(128, 1040), "2.5").unwrap().name(), "2.5");
        assert_eq!(install(blank(128, 720), "2.0").unwrap().name(), "2");
        assert_eq!(install(blank(128, 720), "MyDOS").unwrap().name(), "mydos");
        assert_eq!(install(blank(128, 720), "II+").unwrap().name(), "II+");
        assert_eq!(install(blank(128, 720), "xdos").unwrap().name(), "xdos");
        assert_eq!(install(blank(128, 720), "RKDOS").unwrap().name(), "rkdos");
        let error = install(blank(128, 720), "sparta").err().unwrap();
        assert!(error == DiskError::UnsupportedOperation);
        let error = install(blank(128, 720), "cp/m").err().unwrap();
        assert!(error == DiskError::UnknownDos);
    }

    #[test]
    fn test_install_then_detect() {
        // A freshly formatted disk has a blank boot sector, so only the
        // default variant is detected until boot code is installed.
        let disk = blank(128, 720);
        install(disk.clone(), "2").unwrap();
        let fs = detect(disk).unwrap();
        assert_eq!(fs.name(), "2");
        assert_eq!(fs.free_sector_count().unwrap(), 707);

        let disk = blank(128, 720);
        install(disk.clone(), "mydos").unwrap();
        disk.borrow_mut().write_byte(1, 0, b'M').unwrap();
        let fs = detect(disk).unwrap();
        assert_eq!(fs.name(), "mydos");
        assert_eq!(fs.free_sector_count().unwrap(), 708);
    }

    #[test]
    fn test_rkdos_install_then_detect() {
        // Unlike the DOS 2 family, formatting writes the signature.
        let disk = blank(128, 1040);
        install(disk.clone(), "rkdos").unwrap();
        let fs = detect(disk).unwrap();
        assert_eq!(fs.name(), "rkdos");
        assert_eq!(fs.free_sector_count().unwrap(), 1037);
        assert_eq!(DosType::RkDos.to_string(), "RK-DOS");
    }
}
