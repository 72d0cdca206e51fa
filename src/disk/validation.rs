use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::io;

use thiserror::Error;

use crate::disk::chain::{file_number, ChainFormat, ChainIterator};
use crate::disk::directory::{
    entry_count, read_entry, EntryLocation, DIRECTORY_SECTOR_COUNT, FIRST_DIRECTORY_SECTOR,
};
use crate::disk::dos2::Volume;
use crate::disk::error::DiskError;
use crate::disk::{SectorNum, BOOT_SECTOR_COUNT};

/// Owner recorded for the boot area, the bitmap, and the root directory.
const SYSTEM_OWNER: &str = "DOS";

/// A validation error represents an inconsistency in the disk image found by
/// the validate() function.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("system sector {0} not allocated")]
    SystemSectorNotAllocated(SectorNum),
    #[error("sector {0} allocated but not occupied")]
    SectorMisallocated(SectorNum),
    #[error("sector {0} occupied by {1} but not allocated")]
    SectorMisoccupied(SectorNum, String),
    #[error("sector {0} occupied by multiple files, including at least: {1} {2}")]
    SectorOveroccupied(SectorNum, String, String),
    #[error("sector {sector} of {name} carries file number {found}, expected {expected}")]
    FileNumberMismatch {
        sector: SectorNum,
        name: String,
        found: u8,
        expected: u8,
    },
    #[error("{name} records {recorded} sectors but its chain has {actual}")]
    SectorCountMismatch {
        name: String,
        recorded: usize,
        actual: usize,
    },
    #[error("error scanning {1}: {0}")]
    FileScanError(DiskError, String),
    #[error("VTOC records {stored} free sectors but the bitmap has {counted}")]
    FreeCountMismatch { stored: usize, counted: usize },
}

/// Sector ownership gathered from the directory tree.
struct Scan<'a> {
    volume: &'a Volume,
    owners: BTreeMap<SectorNum, String>,
    visited_directories: HashSet<SectorNum>,
    errors: Vec<ValidationError>,
}

impl<'a> Scan<'a> {
    fn claim(&mut self, sector: SectorNum, owner: &str) {
        match self.owners.entry(sector) {
            Entry::Occupied(existing) => {
                self.errors.push(ValidationError::SectorOveroccupied(
                    sector,
                    existing.get().clone(),
                    owner.to_string(),
                ));
            }
            Entry::Vacant(v) => {
                v.insert(owner.to_string());
            }
        }
    }

    /// Record a DiskError against a file, or pass any other error through.
    fn scan_error(&mut self, error: io::Error, name: &str) -> io::Result<()> {
        match DiskError::from_io_error(&error) {
            Some(e) => {
                self.errors
                    .push(ValidationError::FileScanError(e, name.to_string()));
                Ok(())
            }
            None => Err(error),
        }
    }

    fn scan_directory(&mut self, first_sector: SectorNum) -> io::Result<()> {
        let sector_size = self.volume.disk.borrow().sector_size();
        for index in 0..entry_count(sector_size) {
            let location = EntryLocation::new(first_sector, index, sector_size);
            let entry = read_entry(&mut self.volume.disk.borrow_mut(), location)?;
            if entry.is_never_used() {
                break;
            }
            if entry.is_deleted() {
                continue;
            }
            let name = entry.name.to_escaped_string();
            let first = entry.first_sector as SectorNum;
            if self.volume.subdirectories && entry.is_dir() {
                if !self.visited_directories.insert(first) {
                    self.errors
                        .push(ValidationError::FileScanError(DiskError::ChainLoop, name));
                    continue;
                }
                for sector in first..first + DIRECTORY_SECTOR_COUNT {
                    self.claim(sector, &name);
                }
                self.scan_directory(first)?;
                continue;
            }
            self.scan_file(index, first, entry.sector_count as usize, &name)?;
        }
        Ok(())
    }

    fn scan_file(
        &mut self,
        index: usize,
        first_sector: SectorNum,
        recorded: usize,
        name: &str,
    ) -> io::Result<()> {
        let mut actual = 0;
        let chain = ChainIterator::new(self.volume.disk.clone(), self.volume.chain, first_sector);
        for step in chain {
            let step = match step {
                Ok(step) => step,
                Err(e) => return self.scan_error(e, name),
            };
            actual += 1;
            self.claim(step.sector, name);
            if self.volume.chain == ChainFormat::FileNumbered {
                let found = step.trailer.file_no.unwrap_or(0);
                let expected = file_number(index);
                if found != expected {
                    self.errors.push(ValidationError::FileNumberMismatch {
                        sector: step.sector,
                        name: name.to_string(),
                        found,
                        expected,
                    });
                }
            }
        }
        if actual != recorded {
            self.errors.push(ValidationError::SectorCountMismatch {
                name: name.to_string(),
                recorded,
                actual,
            });
        }
        Ok(())
    }
}

/// Check the consistency of a DOS 2 family volume.  This is a read-only
/// operation and does not attempt any repairs.  A list of validation errors
/// is returned, in sector order for the bitmap checks.
pub fn validate(volume: &Volume) -> io::Result<Vec<ValidationError>> {
    let allocator = volume.allocator.borrow();
    let mut scan = Scan {
        volume,
        owners: BTreeMap::new(),
        visited_directories: HashSet::new(),
        errors: vec![],
    };

    // 1. System sectors, including the nonexistent sector 0.
    let mut system_sectors: Vec<SectorNum> = (0..=BOOT_SECTOR_COUNT).collect();
    system_sectors.extend(allocator.vtoc_sectors());
    system_sectors.extend(allocator.reserved_sectors());
    system_sectors.extend(FIRST_DIRECTORY_SECTOR..FIRST_DIRECTORY_SECTOR + DIRECTORY_SECTOR_COUNT);
    for &sector in &system_sectors {
        scan.claim(sector, SYSTEM_OWNER);
    }

    // 2. Files and subdirectories.
    scan.visited_directories.insert(FIRST_DIRECTORY_SECTOR);
    scan.scan_directory(FIRST_DIRECTORY_SECTOR)?;

    // 3. Compare ownership with the bitmap.
    let limit = allocator.bitmap_limit();
    let mut errors = scan.errors;
    for num in 0..limit {
        let free = allocator.is_free(num)?;
        match scan.owners.get(&num) {
            Some(_) if free && system_sectors.contains(&num) => {
                errors.push(ValidationError::SystemSectorNotAllocated(num));
            }
            Some(owner) if free => {
                errors.push(ValidationError::SectorMisoccupied(num, owner.clone()));
            }
            None if !free => errors.push(ValidationError::SectorMisallocated(num)),
            _ => {}
        }
    }
    for (&num, owner) in scan.owners.range(limit..) {
        if !system_sectors.contains(&num) {
            errors.push(ValidationError::SectorMisoccupied(num, owner.clone()));
        }
    }

    // 4. The stored free count.
    let stored = allocator.free_sector_count()?;
    let counted = allocator.count_free_bits()?;
    if stored != counted {
        errors.push(ValidationError::FreeCountMismatch { stored, counted });
    }

    Ok(errors)
}
